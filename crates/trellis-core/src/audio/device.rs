//! Audio device contract and backend probing
//!
//! A device owns the platform stream and *pulls* finished periods from the
//! engine, either synchronously from its callback or by consuming the
//! fifo; the [`RenderSource`] handle hides the difference. Devices hold
//! only a weak reference to the mixer, so engine teardown never races a
//! callback.

use std::sync::Weak;

use crate::engine::Mixer;
use crate::types::{SurroundFrame, DEFAULT_FRAMES_PER_PERIOD, SURROUND_CHANNELS};

use super::dummy::DummyAudio;

/// A platform audio output owned by the mixer.
///
/// Construction probes the backend; a constructed device is ready to
/// start. The mixer swaps devices only while processing is stopped.
pub trait AudioDevice: Send {
    /// Open the stream and start pulling periods.
    fn start_processing(&mut self);

    /// Close the stream; must not return while a callback is running.
    fn stop_processing(&mut self);

    /// Negotiated output rate in Hz.
    fn sample_rate(&self) -> u32;

    /// Re-read the mixer's quality settings. Backends that negotiate at
    /// stream build time pick them up on the next `start_processing`.
    fn apply_quality_settings(&mut self);

    /// Backend name, as used in configuration.
    fn name(&self) -> &'static str;
}

/// Weak handle through which a device pulls periods from the engine.
#[derive(Clone)]
pub struct RenderSource {
    mixer: Weak<Mixer>,
}

impl RenderSource {
    pub fn new(mixer: Weak<Mixer>) -> Self {
        Self { mixer }
    }

    /// A source connected to nothing; every pull yields silence. For
    /// probing in tests and tools.
    pub fn detached() -> Self {
        Self { mixer: Weak::new() }
    }

    /// Whether the engine behind this source still exists.
    pub fn is_alive(&self) -> bool {
        self.mixer.strong_count() > 0
    }

    /// Period length the engine renders, for sizing device buffers.
    pub fn frames_per_period(&self) -> usize {
        self.mixer
            .upgrade()
            .map(|m| m.frames_per_period())
            .unwrap_or(DEFAULT_FRAMES_PER_PERIOD)
    }

    /// The rate the engine wants to be pulled at.
    pub fn target_sample_rate(&self) -> u32 {
        self.mixer
            .upgrade()
            .map(|m| m.processing_sample_rate())
            .unwrap_or(crate::config::MIN_SAMPLE_RATE)
    }

    /// Pull the next finished period into `out`. False (and silence) when
    /// the engine is gone or its stream ended.
    pub fn next_period(&self, out: &mut [SurroundFrame]) -> bool {
        match self.mixer.upgrade() {
            Some(mixer) => mixer.next_output_period(out),
            None => {
                crate::types::clear_audio_buffer(out);
                false
            }
        }
    }
}

/// Adapts whole engine periods to arbitrary device buffer sizes by
/// carrying the unconsumed remainder between callbacks.
pub struct SurroundPump {
    source: RenderSource,
    hold: Vec<SurroundFrame>,
    pos: usize,
}

impl SurroundPump {
    pub fn new(source: RenderSource) -> Self {
        Self {
            source,
            hold: Vec::new(),
            pos: 0,
        }
    }

    /// The next output frame, pulling a fresh period when the held one is
    /// exhausted.
    #[inline]
    pub fn next_frame(&mut self) -> SurroundFrame {
        if self.pos >= self.hold.len() {
            let frames = self.source.frames_per_period();
            if self.hold.len() != frames {
                self.hold.resize(frames, SurroundFrame::silence());
            }
            self.source.next_period(&mut self.hold);
            self.pos = 0;
        }
        let frame = self.hold[self.pos];
        self.pos += 1;
        frame
    }

    /// Fill an interleaved device buffer with `channels` lanes per frame.
    /// Lanes beyond the surround width repeat the stereo pair.
    pub fn fill_interleaved(&mut self, data: &mut [f32], channels: usize) {
        if channels == 0 {
            return;
        }
        for out in data.chunks_mut(channels) {
            let frame = self.next_frame();
            for (i, sample) in out.iter_mut().enumerate() {
                *sample = frame.0[i % SURROUND_CHANNELS];
            }
        }
    }
}

/// Probe audio backends in order and return the first that comes up.
///
/// `preferred` is the `mixer.audiodev` configuration value; the dummy name
/// or an empty string means "no preference, try everything". A preference
/// matching no compiled-in backend skips them all. Every failure is logged
/// and falls through; the dummy device (drives the engine at period
/// cadence, discards the output) is the unconditional fallback.
pub fn try_audio_devices(
    preferred: &str,
    source: RenderSource,
) -> (Box<dyn AudioDevice>, &'static str) {
    let preferred = if preferred == DummyAudio::NAME {
        ""
    } else {
        preferred
    };

    #[cfg(feature = "jack-backend")]
    if preferred == super::jack_backend::JackAudio::NAME || preferred.is_empty() {
        match super::jack_backend::JackAudio::new(source.clone()) {
            Ok(device) => {
                log::info!("audio: using the JACK backend");
                return (Box::new(device), super::jack_backend::JackAudio::NAME);
            }
            Err(e) => log::warn!("audio: JACK backend failed: {}", e),
        }
    }

    #[cfg(feature = "cpal-backend")]
    if preferred == super::cpal_backend::CpalAudio::NAME || preferred.is_empty() {
        match super::cpal_backend::CpalAudio::new(source.clone()) {
            Ok(device) => {
                log::info!("audio: using the cpal backend");
                return (Box::new(device), super::cpal_backend::CpalAudio::NAME);
            }
            Err(e) => log::warn!("audio: cpal backend failed: {}", e),
        }
    }

    log::warn!(
        "audio: no backend working, falling back to the dummy device; \
         rendering to file still works"
    );
    (Box::new(DummyAudio::new(source)), DummyAudio::NAME)
}
