//! Audio output backends
//!
//! The engine is device-independent: whatever drives the sound card pulls
//! finished periods through a [`RenderSource`]. Backends compiled in:
//!
//! - **jack** (`jack-backend` feature): native JACK for pro-audio routing
//! - **cpal** (`cpal-backend` feature, default): ALSA/WASAPI/CoreAudio
//! - **dummy**: always available; drives the engine and discards output
//!
//! [`try_audio_devices`] probes them in that order, honoring the
//! configured preference, and never fails.

mod device;
mod dummy;
mod error;

#[cfg(feature = "cpal-backend")]
mod cpal_backend;

#[cfg(feature = "jack-backend")]
mod jack_backend;

pub use device::{try_audio_devices, AudioDevice, RenderSource, SurroundPump};
pub use dummy::DummyAudio;
pub use error::{AudioError, AudioResult};

#[cfg(feature = "cpal-backend")]
pub use cpal_backend::CpalAudio;

#[cfg(feature = "jack-backend")]
pub use jack_backend::JackAudio;
