//! The mixer engine
//!
//! Core of the realtime path:
//! - Mixer: the period loop and the lifecycle around it
//! - WorkerPool/JobQueue: the three-stage parallel job pipeline
//! - PlayHandle / AudioPort: voices and the per-track accumulators they
//!   mix into
//! - BufferPool, CaptureRing, Fifo: the buffers around the loop
//! - FxMixer: the bus-routing contract, with a baseline BusMixer
//! - Song: the transport collaborator contract

mod audio_port;
mod buffer_pool;
mod fifo;
mod fx;
mod gc;
mod input;
mod metronome;
mod mixer;
mod play_handle;
mod priority;
mod quality;
mod song;
mod worker;

pub use audio_port::{buffer_to_port, AudioPort, AudioPortPtr, BufferUsage, EffectChain, PortId};
pub use buffer_pool::{BufferPool, PoolReadGuard, DEFAULT_POOL_DEPTH};
pub use fifo::{FifoReader, FifoWriter, PeriodBuffer};
pub use fx::{BusMixer, FxChannelId, FxMixer, DEFAULT_FX_CHANNELS};
pub use gc::GcRuntime;
pub use input::{CaptureRing, InputGuard};
pub use metronome::ClickHandle;
pub use mixer::{Mixer, MixerEvent};
pub use play_handle::{
    HandleId, PlayHandle, PlayHandleCell, PlayHandleKind, PlayHandlePtr, TrackId,
};
pub use quality::{Oversampling, QualityMode, QualitySettings};
pub use song::{IdleSong, PeriodContext, Song, DEFAULT_TICKS_PER_TACT};
pub use worker::{Job, JobQueue, WorkerPool, JOB_QUEUE_SIZE};
