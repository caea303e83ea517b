//! Transport collaborator contract
//!
//! The song/transport lives outside the engine; each period the mixer hands
//! it a `PeriodContext` so it can spawn the play handles and audio ports
//! for newly reached notes. The context borrows the already-locked engine
//! state, so the song never calls back into the mixer and the global lock
//! never recurses.

use basedrop::Handle;

use crate::engine::audio_port::{AudioPort, AudioPortPtr};
use crate::engine::play_handle::{PlayHandle, PlayHandleCell, PlayHandlePtr};

/// Tick resolution of one tact (bar); the metronome clicks every quarter.
pub const DEFAULT_TICKS_PER_TACT: u32 = 192;

/// Mutable view of the engine state handed to the song each period.
pub struct PeriodContext<'a> {
    pub frames_per_period: usize,
    handles: &'a mut Vec<PlayHandlePtr>,
    ports: &'a mut Vec<AudioPortPtr>,
    gc: &'a Handle,
}

impl<'a> PeriodContext<'a> {
    pub(crate) fn new(
        frames_per_period: usize,
        handles: &'a mut Vec<PlayHandlePtr>,
        ports: &'a mut Vec<AudioPortPtr>,
        gc: &'a Handle,
    ) -> Self {
        Self {
            frames_per_period,
            handles,
            ports,
            gc,
        }
    }

    /// Register a new voice for this and following periods.
    pub fn add_play_handle(&mut self, handle: Box<dyn PlayHandle>) -> PlayHandlePtr {
        let cell = PlayHandleCell::register(self.gc, handle);
        self.handles.push(cell.clone());
        cell
    }

    /// Register a new per-track accumulator.
    pub fn register_audio_port(&mut self, port: AudioPort) -> AudioPortPtr {
        let ptr = AudioPort::register(self.gc, port);
        self.ports.push(ptr.clone());
        ptr
    }
}

/// The transport the engine advances once per period.
pub trait Song: Send {
    /// Advance by one period; spawn play handles and ports for anything
    /// that starts sounding now.
    fn process_next_buffer(&mut self, ctx: &mut PeriodContext<'_>);

    /// Whether playback has a realtime deadline (false while exporting).
    /// Feeds [`critical_xruns`](crate::engine::Mixer::critical_xruns).
    fn is_realtime(&self) -> bool {
        true
    }

    /// Current tick position while recording in pattern mode, `None`
    /// otherwise. Drives the metronome.
    fn pattern_recording_tick(&self) -> Option<u32> {
        None
    }
}

/// A song that never schedules anything. Useful for hosts that feed the
/// engine purely through live play handles, and for tests.
pub struct IdleSong;

impl Song for IdleSong {
    fn process_next_buffer(&mut self, _ctx: &mut PeriodContext<'_>) {}
}
