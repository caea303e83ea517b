//! Job queue and worker pool
//!
//! Each period runs three dependency-ordered stages. For every stage the
//! engine fills a fixed-size queue of job descriptors, broadcasts a wake,
//! drains the queue itself as worker N, and spins until the done count
//! reaches the queue size. Workers claim descriptors with a compare-and-
//! swap, so a slow worker just ends up with fewer jobs; total atomic
//! traffic per period is O(jobs x workers).
//!
//! Stage ordering needs no extra fencing: a descriptor only becomes
//! claimable after its payload is published, and the engine never fills
//! stage k+1 before every stage-k descriptor has completed.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::engine::audio_port::{AudioPortPtr, BufferUsage};
use crate::engine::fx::{FxChannelId, FxMixer};
use crate::engine::play_handle::PlayHandlePtr;
use crate::engine::priority::set_time_critical;
use crate::types::{AlignedBuffer, StereoFrame};

/// Hard capacity of one stage's queue
pub const JOB_QUEUE_SIZE: usize = 1024;

/// How long a parked worker sleeps before re-checking the quit flag
const WORKER_WAKE_CHECK: Duration = Duration::from_millis(500);

/// One unit of stage work
pub enum Job {
    /// Render a play handle into its port (Stage 1)
    PlayHandle(PlayHandlePtr),
    /// Run a port's insert chain and route it to its FX channel (Stage 2)
    PortEffects(AudioPortPtr),
    /// Process one FX channel (Stage 3)
    FxChannel(FxChannelId),
}

struct JobSlot {
    /// Claim flag: CAS false -> true decides which worker runs the job.
    claimed: AtomicBool,
    payload: Mutex<Option<Job>>,
}

impl JobSlot {
    fn new() -> Self {
        Self {
            claimed: AtomicBool::new(true),
            payload: Mutex::new(None),
        }
    }
}

/// Fixed-capacity descriptor array shared by the engine and all workers.
pub struct JobQueue {
    slots: Vec<JobSlot>,
    queue_size: AtomicUsize,
    items_done: AtomicUsize,
}

impl JobQueue {
    fn new() -> Self {
        Self {
            slots: (0..JOB_QUEUE_SIZE).map(|_| JobSlot::new()).collect(),
            queue_size: AtomicUsize::new(0),
            items_done: AtomicUsize::new(0),
        }
    }

    /// Empty the queue for the next stage. Engine thread only, with no
    /// stage in flight.
    pub fn reset(&self) {
        self.queue_size.store(0, Ordering::Release);
        self.items_done.store(0, Ordering::Release);
    }

    /// Append a descriptor. Returns false when the stage exceeds the fixed
    /// capacity; that is a design-level overload, asserted in debug builds
    /// and clamped in release.
    pub fn push(&self, job: Job) -> bool {
        let index = self.queue_size.load(Ordering::Relaxed);
        if index >= JOB_QUEUE_SIZE {
            debug_assert!(false, "job queue overflow: more than {} jobs in one stage", JOB_QUEUE_SIZE);
            log::error!("job queue overflow, dropping job");
            return false;
        }
        let slot = &self.slots[index];
        *slot.payload.lock() = Some(job);
        // Publishing order matters: payload, then claimability, then size.
        slot.claimed.store(false, Ordering::Release);
        self.queue_size.store(index + 1, Ordering::Release);
        true
    }

    pub fn queue_size(&self) -> usize {
        self.queue_size.load(Ordering::Acquire)
    }

    pub fn items_done(&self) -> usize {
        self.items_done.load(Ordering::Acquire)
    }

    fn is_complete(&self) -> bool {
        self.items_done() >= self.queue_size()
    }

    /// Walk the queue claiming and running descriptors. Re-reads the size
    /// each iteration, so a worker that raced past a stage boundary simply
    /// picks up current-stage work or stops.
    fn process(&self, scratch: &mut [StereoFrame], fx: &dyn FxMixer) {
        let mut index = 0;
        while index < self.queue_size.load(Ordering::Acquire) {
            let slot = &self.slots[index];
            if slot
                .claimed
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                if let Some(job) = slot.payload.lock().take() {
                    dispatch(job, scratch, fx);
                }
                self.items_done.fetch_add(1, Ordering::AcqRel);
            }
            index += 1;
        }
    }
}

/// Run one descriptor. Jobs never unwind into the period loop: a panicking
/// handle or effect loses its own output and the period continues.
fn dispatch(job: Job, scratch: &mut [StereoFrame], fx: &dyn FxMixer) {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| match job {
        Job::PlayHandle(handle) => {
            handle.play(scratch);
        }
        Job::PortEffects(port) => {
            let chain_live = port.process_effects();
            if chain_live || port.buffer_usage() != BufferUsage::None {
                {
                    let first = port.lock_first_buffer();
                    fx.mix_to_channel(&first, port.next_fx_channel());
                }
                port.next_period();
            }
        }
        Job::FxChannel(channel) => {
            fx.process_channel(channel);
        }
    }));
    if outcome.is_err() {
        log::error!("worker job panicked; its output for this period is lost");
    }
}

struct PoolShared {
    queue: JobQueue,
    fx: Arc<dyn FxMixer>,
    /// Stage generation; bumped and broadcast once per stage so every
    /// worker participates.
    wake: Mutex<u64>,
    cond: Condvar,
    quit: AtomicBool,
    frames_per_period: usize,
}

/// Fixed set of persistent worker threads plus the caller as worker N.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    threads: Vec<JoinHandle<()>>,
    /// Scratch for the caller acting as worker N.
    caller_scratch: Mutex<AlignedBuffer<StereoFrame>>,
}

impl WorkerPool {
    /// Worker-thread count for this host: all cores minus the engine
    /// caller, at least one.
    pub fn default_worker_threads() -> usize {
        let cores = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        cores.saturating_sub(1).max(1)
    }

    pub fn new(worker_threads: usize, frames_per_period: usize, fx: Arc<dyn FxMixer>) -> Self {
        let shared = Arc::new(PoolShared {
            queue: JobQueue::new(),
            fx,
            wake: Mutex::new(0),
            cond: Condvar::new(),
            quit: AtomicBool::new(false),
            frames_per_period,
        });

        let threads = (0..worker_threads)
            .map(|i| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("trellis-worker-{}", i))
                    .spawn(move || worker_main(shared))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Self {
            shared,
            threads,
            caller_scratch: Mutex::new(AlignedBuffer::new(frames_per_period)),
        }
    }

    pub fn worker_threads(&self) -> usize {
        self.threads.len()
    }

    /// The stage queue, for the engine to fill between stages.
    pub fn queue(&self) -> &JobQueue {
        &self.shared.queue
    }

    /// Run the currently filled stage to completion: broadcast the wake,
    /// drain the queue on the calling thread, then spin until every
    /// descriptor is done.
    pub fn run_stage(&self) {
        {
            let mut generation = self.shared.wake.lock();
            *generation += 1;
        }
        self.shared.cond.notify_all();

        {
            let mut scratch = self.caller_scratch.lock();
            self.shared.queue.process(&mut scratch, &*self.shared.fx);
        }

        while !self.shared.queue.is_complete() {
            std::hint::spin_loop();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Publish an empty queue so late risers find nothing to do, then
        // wake everyone with the quit flag set.
        self.shared.queue.reset();
        self.shared.quit.store(true, Ordering::Release);
        {
            let mut generation = self.shared.wake.lock();
            *generation += 1;
        }
        self.shared.cond.notify_all();
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}

fn worker_main(shared: Arc<PoolShared>) {
    set_time_critical();
    let mut scratch = AlignedBuffer::<StereoFrame>::new(shared.frames_per_period);
    let mut seen_generation = 0u64;

    loop {
        {
            let mut generation = shared.wake.lock();
            while *generation == seen_generation && !shared.quit.load(Ordering::Acquire) {
                // Bounded wait keeps shutdown prompt even if a wake is
                // missed.
                shared.cond.wait_for(&mut generation, WORKER_WAKE_CHECK);
            }
            seen_generation = *generation;
        }
        if shared.quit.load(Ordering::Acquire) {
            break;
        }
        shared.queue.process(&mut scratch, &*shared.fx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fx::BusMixer;
    use crate::engine::gc::GcRuntime;
    use crate::engine::play_handle::{PlayHandle, PlayHandleCell, PlayHandleKind};

    struct CountingHandle {
        plays: Arc<AtomicUsize>,
    }

    impl PlayHandle for CountingHandle {
        fn play(&mut self, _scratch: &mut [StereoFrame]) {
            self.plays.fetch_add(1, Ordering::SeqCst);
        }

        fn is_done(&self) -> bool {
            true
        }

        fn kind(&self) -> PlayHandleKind {
            PlayHandleKind::Note
        }
    }

    fn counting_stage(pool: &WorkerPool, gc: &GcRuntime, jobs: usize) -> Vec<Arc<AtomicUsize>> {
        pool.queue().reset();
        let counters: Vec<Arc<AtomicUsize>> =
            (0..jobs).map(|_| Arc::new(AtomicUsize::new(0))).collect();
        for plays in &counters {
            let handle = PlayHandleCell::register(
                &gc.handle(),
                Box::new(CountingHandle {
                    plays: Arc::clone(plays),
                }),
            );
            assert!(pool.queue().push(Job::PlayHandle(handle)));
        }
        counters
    }

    #[test]
    fn test_every_descriptor_runs_exactly_once() {
        let gc = GcRuntime::new();
        let fx: Arc<dyn FxMixer> = Arc::new(BusMixer::new(2, 32));
        let pool = WorkerPool::new(3, 32, fx);

        for _ in 0..5 {
            let counters = counting_stage(&pool, &gc, 100);
            pool.run_stage();

            assert_eq!(pool.queue().items_done(), pool.queue().queue_size());
            for c in &counters {
                assert_eq!(c.load(Ordering::SeqCst), 1);
            }
        }
    }

    #[test]
    fn test_engine_only_pool_drains_the_queue() {
        let gc = GcRuntime::new();
        let fx: Arc<dyn FxMixer> = Arc::new(BusMixer::new(2, 32));
        let pool = WorkerPool::new(0, 32, fx);

        let counters = counting_stage(&pool, &gc, 64);
        pool.run_stage();

        for c in &counters {
            assert_eq!(c.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn test_queue_size_never_exceeds_capacity() {
        let fx: Arc<dyn FxMixer> = Arc::new(BusMixer::new(2, 32));
        let pool = WorkerPool::new(0, 32, fx);
        pool.queue().reset();

        for i in 0..JOB_QUEUE_SIZE {
            assert!(pool.queue().push(Job::FxChannel(i % 3)), "push {} failed", i);
        }
        assert_eq!(pool.queue().queue_size(), JOB_QUEUE_SIZE);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "job queue overflow")]
    fn test_overflow_asserts_in_debug() {
        let fx: Arc<dyn FxMixer> = Arc::new(BusMixer::new(2, 32));
        let pool = WorkerPool::new(0, 32, fx);
        pool.queue().reset();
        for _ in 0..=JOB_QUEUE_SIZE {
            pool.queue().push(Job::FxChannel(1));
        }
    }

    #[test]
    fn test_panicking_job_does_not_poison_the_stage() {
        struct PanicHandle;
        impl PlayHandle for PanicHandle {
            fn play(&mut self, _scratch: &mut [StereoFrame]) {
                panic!("handle blew up");
            }
            fn is_done(&self) -> bool {
                true
            }
            fn kind(&self) -> PlayHandleKind {
                PlayHandleKind::Note
            }
        }

        let gc = GcRuntime::new();
        let fx: Arc<dyn FxMixer> = Arc::new(BusMixer::new(2, 32));
        let pool = WorkerPool::new(0, 32, fx);
        pool.queue().reset();

        let bad = PlayHandleCell::register(&gc.handle(), Box::new(PanicHandle));
        pool.queue().push(Job::PlayHandle(bad));
        let counters = {
            let plays = Arc::new(AtomicUsize::new(0));
            let good = PlayHandleCell::register(
                &gc.handle(),
                Box::new(CountingHandle {
                    plays: Arc::clone(&plays),
                }),
            );
            pool.queue().push(Job::PlayHandle(good));
            plays
        };

        pool.run_stage();
        assert_eq!(counters.load(Ordering::SeqCst), 1);
        assert_eq!(pool.queue().items_done(), 2);
    }
}
