//! RT-safe deferred deallocation
//!
//! Play-handle and audio-port cells are erased on the audio thread. Freeing
//! them there would put `munmap` latency inside the period deadline, so the
//! cells live in `basedrop::Shared` pointers: the last drop enqueues the
//! allocation (a pointer push, ~50ns) and a background collector thread does
//! the actual free where latency does not matter.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use basedrop::{Collector, Handle};
use parking_lot::Mutex;

/// Interval between collection sweeps
const COLLECT_INTERVAL: Duration = Duration::from_millis(100);

/// Owns the collector thread and hands out allocation handles.
///
/// One runtime per mixer; dropping it stops the collector after a final
/// sweep.
pub struct GcRuntime {
    // Handle is Send but not Sync; the lock lets the runtime be shared.
    handle: Mutex<Handle>,
    quit: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl GcRuntime {
    pub fn new() -> Self {
        let quit = Arc::new(AtomicBool::new(false));
        let quit_flag = Arc::clone(&quit);

        // The Collector is !Sync, so it is created on its own thread and a
        // Handle is sent back for allocations.
        let (tx, rx) = mpsc::channel();
        let thread = thread::Builder::new()
            .name("trellis-gc".to_string())
            .spawn(move || {
                let mut collector = Collector::new();
                tx.send(collector.handle())
                    .expect("gc handle receiver dropped");

                log::info!("gc: collector thread started");
                loop {
                    collector.collect();
                    if quit_flag.load(Ordering::Acquire) {
                        collector.collect();
                        break;
                    }
                    thread::sleep(COLLECT_INTERVAL);
                }
                log::info!("gc: collector thread stopped");
            })
            .expect("failed to spawn gc thread");

        let handle = rx.recv().expect("gc thread died before sending handle");
        Self {
            handle: Mutex::new(handle),
            quit,
            thread: Some(thread),
        }
    }

    /// Handle for creating `Shared<T>` allocations. Cheap to clone.
    pub fn handle(&self) -> Handle {
        self.handle.lock().clone()
    }
}

impl Default for GcRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for GcRuntime {
    fn drop(&mut self) {
        self.quit.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use basedrop::Shared;

    #[test]
    fn test_shared_allocations_are_collected() {
        let gc = GcRuntime::new();
        let a = Shared::new(&gc.handle(), vec![0u8; 1024]);
        let b = a.clone();
        assert_eq!(b.len(), 1024);
        drop(a);
        drop(b);
        // Runtime shutdown performs a final sweep without deadlocking.
        drop(gc);
    }
}
