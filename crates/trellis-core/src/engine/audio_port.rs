//! Audio ports: per-track additive accumulators
//!
//! Every track owns a port. Play handles mix into it additively during
//! Stage 1; Stage 2 runs the port's effect chain and routes the result to
//! an FX channel. The port carries two equal-length buffers treated as a
//! 2x-period ring, so a handle rendering past the period boundary spills
//! into `second` instead of being truncated; `next_period` swaps the pair.
//!
//! `first` and `second` have independent locks: concurrent Stage-1 jobs
//! mixing into different regions of one port do not serialize against each
//! other more than necessary.

use std::mem;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};

use basedrop::{Handle, Shared};
use parking_lot::{Mutex, MutexGuard};

use crate::engine::fx::FxChannelId;
use crate::types::{AlignedBuffer, StereoFrame, VolumeVector};

/// Which halves of the port ring carry data this period
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BufferUsage {
    None = 0,
    FirstOnly = 1,
    Both = 2,
}

impl BufferUsage {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => BufferUsage::FirstOnly,
            2 => BufferUsage::Both,
            _ => BufferUsage::None,
        }
    }
}

/// Per-track insert effect chain.
///
/// `process` runs over the port's current-period buffer and returns whether
/// the chain is still producing sound (tails, reverbs); a live chain keeps
/// the port routed to its FX channel even when no handle wrote to it.
pub trait EffectChain: Send {
    fn process(&mut self, buf: &mut [StereoFrame]) -> bool;
}

/// Unique id of a registered port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortId(u64);

static NEXT_PORT_ID: AtomicU64 = AtomicU64::new(1);

/// Per-track audio accumulator.
pub struct AudioPort {
    id: PortId,
    name: String,
    frames_per_period: usize,
    first: Mutex<AlignedBuffer<StereoFrame>>,
    second: Mutex<AlignedBuffer<StereoFrame>>,
    usage: AtomicU8,
    next_fx_channel: AtomicUsize,
    effects: Mutex<Option<Box<dyn EffectChain>>>,
}

/// Shared pointer to a registered port; drops on the audio thread are
/// deferred to the collector.
pub type AudioPortPtr = Shared<AudioPort>;

impl AudioPort {
    pub fn new(name: impl Into<String>, frames_per_period: usize, fx_channel: FxChannelId) -> Self {
        Self {
            id: PortId(NEXT_PORT_ID.fetch_add(1, Ordering::Relaxed)),
            name: name.into(),
            frames_per_period,
            first: Mutex::new(AlignedBuffer::new(frames_per_period)),
            second: Mutex::new(AlignedBuffer::new(frames_per_period)),
            usage: AtomicU8::new(BufferUsage::None as u8),
            next_fx_channel: AtomicUsize::new(fx_channel),
            effects: Mutex::new(None),
        }
    }

    /// Wrap a port for registration with the engine.
    pub fn register(gc: &Handle, port: AudioPort) -> AudioPortPtr {
        Shared::new(gc, port)
    }

    #[inline]
    pub fn id(&self) -> PortId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn frames_per_period(&self) -> usize {
        self.frames_per_period
    }

    #[inline]
    pub fn buffer_usage(&self) -> BufferUsage {
        BufferUsage::from_u8(self.usage.load(Ordering::Acquire))
    }

    #[inline]
    fn set_buffer_usage(&self, usage: BufferUsage) {
        self.usage.store(usage as u8, Ordering::Release);
    }

    /// The FX channel this port routes to after its effect chain.
    #[inline]
    pub fn next_fx_channel(&self) -> FxChannelId {
        self.next_fx_channel.load(Ordering::Relaxed)
    }

    pub fn set_next_fx_channel(&self, channel: FxChannelId) {
        self.next_fx_channel.store(channel, Ordering::Relaxed);
    }

    /// Install or remove the insert chain.
    pub fn set_effects(&self, chain: Option<Box<dyn EffectChain>>) {
        *self.effects.lock() = chain;
    }

    /// Current-period buffer, locked.
    pub fn lock_first_buffer(&self) -> MutexGuard<'_, AlignedBuffer<StereoFrame>> {
        self.first.lock()
    }

    /// Spill buffer for writes past the period boundary, locked.
    pub fn lock_second_buffer(&self) -> MutexGuard<'_, AlignedBuffer<StereoFrame>> {
        self.second.lock()
    }

    /// Run the insert chain over the current-period buffer.
    ///
    /// Returns whether the chain is producing sound. A port without a chain
    /// reports false and relies on `buffer_usage` to stay routed.
    pub fn process_effects(&self) -> bool {
        let mut effects = self.effects.lock();
        match effects.as_mut() {
            Some(chain) => {
                let mut first = self.first.lock();
                chain.process(&mut first)
            }
            None => false,
        }
    }

    /// Advance the 2x-period ring: the spill buffer becomes the current
    /// one, the consumed buffer is cleared for future spills, and the usage
    /// flag resets.
    pub fn next_period(&self) {
        let mut first = self.first.lock();
        let mut second = self.second.lock();
        mem::swap(&mut *first, &mut *second);
        second.clear();
        self.set_buffer_usage(BufferUsage::None);
    }
}

/// Additively mix `frames` rendered frames into a port at global offset
/// `offset`, applying the per-channel gains of `vv`.
///
/// The write starts at `offset % frames_per_period` in `first`; anything
/// past the period boundary lands at the start of `second`, marking the
/// port as using both halves. Writes are purely additive; the buffers are
/// cleared by `next_period` after Stage 2 routing.
pub fn buffer_to_port(
    src: &[StereoFrame],
    frames: usize,
    offset: usize,
    vv: VolumeVector,
    port: &AudioPort,
) {
    let fpp = port.frames_per_period();
    let start = offset % fpp;
    let end = start + frames;
    let first_span = end.min(fpp) - start;

    {
        let mut first = port.lock_first_buffer();
        let out = &mut first[start..start + first_span];
        for (dst, s) in out.iter_mut().zip(src.iter()) {
            dst.left += s.left * vv.vol[0];
            dst.right += s.right * vv.vol[1];
        }
    }

    let mut second = port.lock_second_buffer();
    if end > fpp {
        let spill = (end - fpp).min(fpp);
        let out = &mut second[..spill];
        for (dst, s) in out.iter_mut().zip(src[first_span..].iter()) {
            dst.left += s.left * vv.vol[0];
            dst.right += s.right * vv.vol[1];
        }
        port.set_buffer_usage(BufferUsage::Both);
    } else if port.buffer_usage() == BufferUsage::None {
        port.set_buffer_usage(BufferUsage::FirstOnly);
    }
}
