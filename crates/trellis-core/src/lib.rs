//! Trellis Core: the realtime mixer engine of a digital audio workstation
//!
//! Every audio period the engine advances all sounding voices, funnels
//! their output into per-track audio ports, runs the FX bus topology, and
//! publishes one block of surround samples for the sound card:
//!
//! ```text
//! Song ─► Stage 1 (voices ─► ports) ─► Stage 2 (port FX ─► buses)
//!      ─► Stage 3 (bus processing) ─► Stage 4 (master mix) ─► pool ─► device
//! ```
//!
//! The three stages run on a fixed worker pool with lock-free job
//! claiming; the caller of [`engine::Mixer::render_next_buffer`] (an
//! audio device callback, or the fifo writer) acts as one more worker.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use trellis_core::config::Config;
//! use trellis_core::engine::{BusMixer, IdleSong, Mixer};
//!
//! let config = Config::default();
//! let fx = Arc::new(BusMixer::new(16, config.frames_per_period()));
//! let mixer = Mixer::new(&config, Box::new(IdleSong), fx);
//! mixer.init_devices();
//! mixer.start_processing(false);
//! ```

pub mod audio;
pub mod config;
pub mod engine;
pub mod types;

pub use types::*;
