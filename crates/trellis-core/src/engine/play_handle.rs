//! Play handles: the active voices of the engine
//!
//! A play handle is anything that contributes audio for the current period:
//! a sounding note, a triggered sample, an input monitor. The engine keeps
//! registered handles in reference-counted cells so worker jobs can render
//! them without touching the handle list, and so erasing a handle on the
//! audio thread never frees memory there (see [`super::gc`]).

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::ThreadId;

use basedrop::{Handle, Shared};
use parking_lot::Mutex;

use crate::types::StereoFrame;

/// Identifier of the track a handle belongs to
pub type TrackId = u64;

/// Variant tag of a play handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayHandleKind {
    /// A sounding note from an instrument
    Note,
    /// A one-shot sample (previews, metronome clicks)
    Sample,
    /// An instrument's persistent voice allocator. Lives as long as the
    /// instrument itself and is never removed by [`clear`](crate::engine::Mixer::clear).
    Instrument,
    /// A preset being auditioned in the browser
    PresetPreview,
}

/// An active audio producer.
///
/// `play` renders this handle's contribution for the current period into its
/// owning audio port, typically through
/// [`buffer_to_port`](super::audio_port::buffer_to_port) using the worker's
/// scratch buffer as staging space. Rendering must not panic outward and
/// must not block on anything slower than the port buffer locks.
pub trait PlayHandle: Send {
    /// Render one period into the owning port. `scratch` is a per-worker
    /// aligned buffer of `frames_per_period` frames; its previous contents
    /// are arbitrary.
    fn play(&mut self, scratch: &mut [StereoFrame]);

    /// True once the handle has produced all of its audio and may be
    /// removed.
    fn is_done(&self) -> bool;

    /// Variant tag.
    fn kind(&self) -> PlayHandleKind;

    /// Whether this handle holds resources that pin destruction to one
    /// thread.
    fn affinity_matters(&self) -> bool {
        false
    }

    /// The thread this handle must be destroyed on, when
    /// `affinity_matters()`.
    fn affinity(&self) -> Option<ThreadId> {
        None
    }

    /// True iff this handle was spawned by the given track.
    fn is_from_track(&self, _track: TrackId) -> bool {
        false
    }
}

/// Unique, never-reused id of a registered handle.
///
/// The deferred-removal queue stores ids instead of pointers, so a new
/// handle reusing a freed allocation can never be confused with a dead one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(u64);

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

impl HandleId {
    fn next() -> Self {
        Self(NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// A registered play handle.
///
/// Kind and affinity are fixed at registration, so the engine can consult
/// them during culling without taking the handle's own lock. The inner lock
/// is uncontended in practice: each period a handle is claimed by exactly
/// one worker.
pub struct PlayHandleCell {
    id: HandleId,
    kind: PlayHandleKind,
    affinity: Option<ThreadId>,
    inner: Mutex<Box<dyn PlayHandle>>,
}

/// Shared pointer to a registered handle; drops on the audio thread are
/// deferred to the collector.
pub type PlayHandlePtr = Shared<PlayHandleCell>;

impl PlayHandleCell {
    /// Wrap a handle for registration with the engine.
    pub fn register(gc: &Handle, handle: Box<dyn PlayHandle>) -> PlayHandlePtr {
        let kind = handle.kind();
        let affinity = if handle.affinity_matters() {
            handle.affinity()
        } else {
            None
        };
        Shared::new(
            gc,
            Self {
                id: HandleId::next(),
                kind,
                affinity,
                inner: Mutex::new(handle),
            },
        )
    }

    #[inline]
    pub fn id(&self) -> HandleId {
        self.id
    }

    #[inline]
    pub fn kind(&self) -> PlayHandleKind {
        self.kind
    }

    /// The deletion-affinity thread, or `None` when any thread may delete
    /// this handle.
    #[inline]
    pub fn affinity(&self) -> Option<ThreadId> {
        self.affinity
    }

    pub fn play(&self, scratch: &mut [StereoFrame]) {
        self.inner.lock().play(scratch);
    }

    pub fn is_done(&self) -> bool {
        self.inner.lock().is_done()
    }

    pub fn is_from_track(&self, track: TrackId) -> bool {
        self.inner.lock().is_from_track(track)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::gc::GcRuntime;

    struct NullHandle {
        done: bool,
        track: TrackId,
    }

    impl PlayHandle for NullHandle {
        fn play(&mut self, _scratch: &mut [StereoFrame]) {
            self.done = true;
        }

        fn is_done(&self) -> bool {
            self.done
        }

        fn kind(&self) -> PlayHandleKind {
            PlayHandleKind::Note
        }

        fn is_from_track(&self, track: TrackId) -> bool {
            track == self.track
        }
    }

    #[test]
    fn test_cell_caches_kind_and_affinity() {
        let gc = GcRuntime::new();
        let cell = PlayHandleCell::register(
            &gc.handle(),
            Box::new(NullHandle {
                done: false,
                track: 7,
            }),
        );
        assert_eq!(cell.kind(), PlayHandleKind::Note);
        assert_eq!(cell.affinity(), None);
        assert!(cell.is_from_track(7));
        assert!(!cell.is_from_track(8));
    }

    #[test]
    fn test_ids_are_unique() {
        let gc = GcRuntime::new();
        let a = PlayHandleCell::register(
            &gc.handle(),
            Box::new(NullHandle {
                done: false,
                track: 0,
            }),
        );
        let b = PlayHandleCell::register(
            &gc.handle(),
            Box::new(NullHandle {
                done: false,
                track: 0,
            }),
        );
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_play_marks_done() {
        let gc = GcRuntime::new();
        let cell = PlayHandleCell::register(
            &gc.handle(),
            Box::new(NullHandle {
                done: false,
                track: 0,
            }),
        );
        assert!(!cell.is_done());
        let mut scratch = [StereoFrame::silence(); 8];
        cell.play(&mut scratch);
        assert!(cell.is_done());
    }
}
