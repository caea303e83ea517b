//! Synthesized metronome click
//!
//! The engine injects one of these while the user records in pattern mode.
//! The click is generated, not loaded: a short exponentially decaying sine
//! burst, rendered period by period into the engine's metronome port.

use crate::engine::audio_port::{buffer_to_port, AudioPortPtr};
use crate::engine::play_handle::{PlayHandle, PlayHandleKind};
use crate::types::{StereoFrame, VolumeVector};

/// Click length in frames
const CLICK_FRAMES: usize = 2048;

/// Click tone frequency in Hz, at the nominal base rate
const CLICK_FREQ: f32 = 1000.0;

/// Nominal rate the click phase increment is derived from
const CLICK_RATE: f32 = 44100.0;

/// Peak click level
const CLICK_LEVEL: f32 = 0.5;

/// One-shot click voice.
pub struct ClickHandle {
    port: AudioPortPtr,
    pos: usize,
}

impl ClickHandle {
    pub fn new(port: AudioPortPtr) -> Self {
        Self { port, pos: 0 }
    }

    fn sample_at(frame: usize) -> f32 {
        let t = frame as f32 / CLICK_RATE;
        let remaining = 1.0 - frame as f32 / CLICK_FRAMES as f32;
        let envelope = remaining * remaining;
        (2.0 * std::f32::consts::PI * CLICK_FREQ * t).sin() * CLICK_LEVEL * envelope
    }
}

impl PlayHandle for ClickHandle {
    fn play(&mut self, scratch: &mut [StereoFrame]) {
        if self.is_done() {
            return;
        }
        let n = scratch.len().min(CLICK_FRAMES - self.pos);
        for (i, frame) in scratch[..n].iter_mut().enumerate() {
            *frame = StereoFrame::mono(Self::sample_at(self.pos + i));
        }
        buffer_to_port(&scratch[..n], n, 0, VolumeVector::unity(), &self.port);
        self.pos += n;
    }

    fn is_done(&self) -> bool {
        self.pos >= CLICK_FRAMES
    }

    fn kind(&self) -> PlayHandleKind {
        PlayHandleKind::Sample
    }
}
