//! Dummy audio device
//!
//! The unconditional probe fallback: a thread that pulls periods at the
//! rate a real sound card would and throws them away. The engine keeps
//! running, meters keep moving, and render-to-file consumers keep getting
//! fifo output; only the speakers stay silent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::types::SurroundFrame;

use super::device::{AudioDevice, RenderSource};

pub struct DummyAudio {
    source: RenderSource,
    sample_rate: u32,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl DummyAudio {
    pub const NAME: &'static str = "dummy";

    /// Construction cannot fail; that is the point of this device.
    pub fn new(source: RenderSource) -> Self {
        let sample_rate = source.target_sample_rate();
        Self {
            source,
            sample_rate,
            stop: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }
}

impl AudioDevice for DummyAudio {
    fn start_processing(&mut self) {
        if self.thread.is_some() {
            return;
        }
        self.stop.store(false, Ordering::Release);

        let source = self.source.clone();
        let stop = Arc::clone(&self.stop);
        let sample_rate = self.sample_rate.max(1);

        let thread = thread::Builder::new()
            .name("trellis-dummy-audio".to_string())
            .spawn(move || {
                let frames = source.frames_per_period();
                let period = Duration::from_secs_f64(frames as f64 / sample_rate as f64);
                let mut sink = vec![SurroundFrame::silence(); frames];

                while !stop.load(Ordering::Acquire) {
                    if !source.is_alive() {
                        break;
                    }
                    source.next_period(&mut sink);
                    thread::sleep(period);
                }
            })
            .expect("failed to spawn dummy audio thread");

        self.thread = Some(thread);
    }

    fn stop_processing(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn apply_quality_settings(&mut self) {
        self.sample_rate = self.source.target_sample_rate();
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }
}

impl Drop for DummyAudio {
    fn drop(&mut self) {
        self.stop_processing();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::{BusMixer, IdleSong, Mixer, MixerEvent};
    use std::sync::Arc;

    #[test]
    fn test_detached_dummy_stops_cleanly() {
        let mut device = DummyAudio::new(RenderSource::detached());
        device.start_processing();
        device.stop_processing();
    }

    #[test]
    fn test_dummy_drives_the_period_loop() {
        let config = Config::default();
        let mixer = Mixer::with_worker_threads(
            &config,
            Box::new(IdleSong),
            Arc::new(BusMixer::new(2, config.frames_per_period())),
            0,
        );
        let events = mixer.subscribe();

        let mut device = DummyAudio::new(RenderSource::new(Arc::downgrade(&mixer)));
        device.start_processing();
        let event = events.recv_timeout(Duration::from_secs(2));
        device.stop_processing();

        assert_eq!(event.unwrap(), MixerEvent::NextAudioBuffer);
    }
}
