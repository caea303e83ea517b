//! Output fifo and its writer thread
//!
//! When the device cannot drive the period loop directly (oversampled
//! processing, render-to-disk), a dedicated writer thread runs
//! `render_next_buffer` in a loop, copies each finished period into a fresh
//! buffer and pushes it through a bounded channel. The consumer side blocks
//! on `read`; a `None` sentinel marks end of stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::engine::mixer::Mixer;
use crate::engine::priority::set_time_critical;
use crate::types::{AlignedBuffer, SurroundFrame};

/// One finished period, owned by the consumer
pub type PeriodBuffer = AlignedBuffer<SurroundFrame>;

/// How often a blocked writer re-checks its finish flag
const SEND_RETRY: Duration = Duration::from_millis(100);

pub(crate) struct Fifo {
    tx: flume::Sender<Option<PeriodBuffer>>,
    rx: flume::Receiver<Option<PeriodBuffer>>,
}

impl Fifo {
    pub fn new(depth: usize) -> Self {
        let (tx, rx) = flume::bounded(depth.max(1));
        Self { tx, rx }
    }

    pub fn sender(&self) -> flume::Sender<Option<PeriodBuffer>> {
        self.tx.clone()
    }

    pub fn receiver(&self) -> &flume::Receiver<Option<PeriodBuffer>> {
        &self.rx
    }

    pub fn reader(&self) -> FifoReader {
        FifoReader {
            rx: self.rx.clone(),
        }
    }

    /// Release every queued buffer.
    pub fn drain(&self) {
        while self.rx.try_recv().is_ok() {}
    }
}

/// Consumer handle onto the output fifo.
#[derive(Clone)]
pub struct FifoReader {
    rx: flume::Receiver<Option<PeriodBuffer>>,
}

impl FifoReader {
    /// Block for the next finished period. `None` means the stream ended.
    pub fn read(&self) -> Option<PeriodBuffer> {
        self.rx.recv().ok().flatten()
    }

    /// Non-blocking variant; `None` when nothing is queued yet.
    pub fn try_read(&self) -> Option<PeriodBuffer> {
        self.rx.try_recv().ok().flatten()
    }
}

/// The thread feeding the fifo.
pub struct FifoWriter {
    finish: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl FifoWriter {
    /// Spawn the writer loop. It stops when `finish` is called or the
    /// mixer goes away, then pushes the end-of-stream sentinel.
    pub(crate) fn start(
        mixer: Weak<Mixer>,
        tx: flume::Sender<Option<PeriodBuffer>>,
        frames_per_period: usize,
    ) -> Self {
        let finish = Arc::new(AtomicBool::new(false));
        let finish_flag = Arc::clone(&finish);

        let thread = thread::Builder::new()
            .name("trellis-fifo".to_string())
            .spawn(move || {
                set_time_critical();
                'writing: while !finish_flag.load(Ordering::Acquire) {
                    let Some(mixer) = mixer.upgrade() else {
                        break;
                    };
                    let mut out = AlignedBuffer::<SurroundFrame>::new(frames_per_period);
                    {
                        let period = mixer.render_next_buffer();
                        out.as_mut_slice().copy_from_slice(&period);
                    }
                    drop(mixer);

                    // Blocking send, interruptible by the finish flag; the
                    // last rendered period may be dropped on shutdown.
                    let mut item = out;
                    loop {
                        match tx.send_timeout(Some(item), SEND_RETRY) {
                            Ok(()) => break,
                            Err(flume::SendTimeoutError::Timeout(returned)) => {
                                if finish_flag.load(Ordering::Acquire) {
                                    break 'writing;
                                }
                                item = match returned {
                                    Some(buf) => buf,
                                    None => break,
                                };
                            }
                            Err(flume::SendTimeoutError::Disconnected(_)) => break 'writing,
                        }
                    }
                }
                let _ = tx.try_send(None);
            })
            .expect("failed to spawn fifo writer thread");

        Self {
            finish,
            thread: Some(thread),
        }
    }

    /// Ask the writer to stop after the period it is rendering.
    pub fn finish(&self) {
        self.finish.store(true, Ordering::Release);
    }

    /// Wait for the writer to exit.
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for FifoWriter {
    fn drop(&mut self) {
        self.finish();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SURROUND_CHANNELS;

    #[test]
    fn test_fifo_hands_buffers_through_in_order() {
        let fifo = Fifo::new(4);
        let reader = fifo.reader();
        let tx = fifo.sender();

        for value in 0..3 {
            let mut buf = AlignedBuffer::<SurroundFrame>::new(8);
            buf[0] = SurroundFrame([value as f32; SURROUND_CHANNELS]);
            tx.send(Some(buf)).unwrap();
        }
        tx.send(None).unwrap();

        for value in 0..3 {
            let buf = reader.read().expect("buffer expected");
            assert_eq!(buf[0].0[0], value as f32);
        }
        assert!(reader.read().is_none());
    }

    #[test]
    fn test_drain_releases_queued_buffers() {
        let fifo = Fifo::new(2);
        fifo.sender()
            .send(Some(AlignedBuffer::<SurroundFrame>::new(4)))
            .unwrap();
        fifo.drain();
        assert!(fifo.reader().try_read().is_none());
    }
}
