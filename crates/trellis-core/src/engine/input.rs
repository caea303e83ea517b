//! Input capture ring
//!
//! Double-buffered capture of incoming stereo audio. Device callbacks and
//! other producers append to the write side under a short dedicated lock;
//! at the top of each period the engine swaps the sides and zeroes the new
//! write fill, so Stage-1 monitoring handles see exactly what arrived
//! during the previous period, in append order.
//!
//! Growth copies into larger storage while holding the lock; nobody keeps
//! a pointer into the buffers across a swap.

use parking_lot::{Mutex, MutexGuard};

use crate::types::StereoFrame;

/// Initial capacity, in periods, of each capture side
const INITIAL_CAPACITY_PERIODS: usize = 100;

struct CaptureState {
    bufs: [Vec<StereoFrame>; 2],
    read: usize,
    write: usize,
}

pub struct CaptureRing {
    inner: Mutex<CaptureState>,
}

/// Read access to the frames captured during the previous period.
pub struct InputGuard<'a> {
    state: MutexGuard<'a, CaptureState>,
}

impl std::ops::Deref for InputGuard<'_> {
    type Target = [StereoFrame];

    fn deref(&self) -> &[StereoFrame] {
        let read = self.state.read;
        &self.state.bufs[read]
    }
}

impl CaptureRing {
    pub fn new(frames_per_period: usize) -> Self {
        let capacity = frames_per_period * INITIAL_CAPACITY_PERIODS;
        Self {
            inner: Mutex::new(CaptureState {
                bufs: [Vec::with_capacity(capacity), Vec::with_capacity(capacity)],
                read: 0,
                write: 1,
            }),
        }
    }

    /// Append captured frames to the write side, growing storage to
    /// `max(2 * capacity, fill + n)` on overflow.
    pub fn push(&self, frames: &[StereoFrame]) {
        let mut state = self.inner.lock();
        let write = state.write;
        let buf = &mut state.bufs[write];

        let needed = buf.len() + frames.len();
        if needed > buf.capacity() {
            let target = (buf.capacity() * 2).max(needed);
            buf.reserve_exact(target - buf.len());
        }
        buf.extend_from_slice(frames);
    }

    /// Swap read and write sides and reset the new write fill. Engine
    /// thread only, at period start.
    pub fn swap(&self) {
        let mut state = self.inner.lock();
        state.write = (state.write + 1) % 2;
        state.read = (state.read + 1) % 2;
        let write = state.write;
        state.bufs[write].clear();
    }

    /// The frames captured before the last swap.
    pub fn read_guard(&self) -> InputGuard<'_> {
        InputGuard {
            state: self.inner.lock(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_preserves_stream() {
        let ring = CaptureRing::new(4);
        let a: Vec<StereoFrame> = (0..3).map(|i| StereoFrame::mono(i as f32)).collect();
        let b: Vec<StereoFrame> = (3..8).map(|i| StereoFrame::mono(i as f32)).collect();

        ring.push(&a);
        ring.push(&b);
        ring.swap();

        let read = ring.read_guard();
        assert_eq!(read.len(), 8);
        for (i, f) in read.iter().enumerate() {
            assert_eq!(*f, StereoFrame::mono(i as f32));
        }
    }

    #[test]
    fn test_growth_preserves_prefix() {
        let ring = CaptureRing::new(1);
        let big: Vec<StereoFrame> = (0..1000).map(|i| StereoFrame::mono(i as f32)).collect();

        // Way past the initial capacity of one-frame periods.
        for chunk in big.chunks(17) {
            ring.push(chunk);
        }
        ring.swap();

        let read = ring.read_guard();
        assert_eq!(read.len(), 1000);
        assert_eq!(read[999], StereoFrame::mono(999.0));
    }

    #[test]
    fn test_swap_resets_write_fill() {
        let ring = CaptureRing::new(4);
        ring.push(&[StereoFrame::mono(1.0)]);
        ring.swap();
        // Nothing captured since the swap.
        ring.swap();
        assert_eq!(ring.read_guard().len(), 0);
    }

    #[test]
    fn test_producers_interleave_in_append_order() {
        let ring = CaptureRing::new(4);
        ring.push(&[StereoFrame::mono(1.0)]);
        ring.push(&[StereoFrame::mono(2.0), StereoFrame::mono(3.0)]);
        ring.swap();

        let read = ring.read_guard();
        assert_eq!(read[0], StereoFrame::mono(1.0));
        assert_eq!(read[2], StereoFrame::mono(3.0));
    }
}
