//! The mixer: period loop, handle lifecycle, device plumbing
//!
//! One `Mixer` exists per process, shared as an `Arc`. Whoever drives the
//! output (the audio device callback, or the fifo writer in oversampled and
//! render modes) calls [`Mixer::render_next_buffer`] once per period; GUI
//! and MIDI threads add and remove play handles around it.
//!
//! Everything the period loop mutates lives behind one global lock held for
//! the whole period. Workers never touch that state: they only see cloned
//! cell pointers through the job queue, between the stage fences the engine
//! erects. Collaborator callbacks (`Song`) receive a borrow of the locked
//! state instead of calling back into the mixer, so the lock never needs to
//! recurse.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use trellis_midi::MidiClient;

use crate::audio::{try_audio_devices, AudioDevice, RenderSource};
use crate::config::Config;
use crate::engine::audio_port::{AudioPort, AudioPortPtr};
use crate::engine::buffer_pool::{BufferPool, PoolReadGuard, DEFAULT_POOL_DEPTH};
use crate::engine::fifo::{Fifo, FifoReader, FifoWriter};
use crate::engine::fx::FxMixer;
use crate::engine::gc::GcRuntime;
use crate::engine::input::{CaptureRing, InputGuard};
use crate::engine::metronome::ClickHandle;
use crate::engine::play_handle::{
    HandleId, PlayHandle, PlayHandleCell, PlayHandleKind, PlayHandlePtr, TrackId,
};
use crate::engine::quality::QualitySettings;
use crate::engine::song::{PeriodContext, Song, DEFAULT_TICKS_PER_TACT};
use crate::engine::worker::{Job, WorkerPool};
use crate::types::{clear_audio_buffer, StereoFrame, SurroundFrame, DEFAULT_FRAMES_PER_PERIOD};

/// Cpu load above which realtime playback is considered failing
const XRUN_LOAD: u32 = 99;

/// Per-subscriber event queue depth; laggards lose events, never block us
const EVENT_QUEUE_DEPTH: usize = 256;

/// Bound on a fifo-mode device read, so a stopped writer cannot wedge a
/// device callback
const FIFO_READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Engine notifications for external observers (meters, LFO ticks,
/// controller frame counters hang off `NextAudioBuffer`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixerEvent {
    NextAudioBuffer,
    SampleRateChanged,
    QualitySettingsChanged,
}

/// Everything guarded by the global lock.
struct EngineState {
    play_handles: Vec<PlayHandlePtr>,
    handles_to_remove: Vec<HandleId>,
    audio_ports: Vec<AudioPortPtr>,
    song: Box<dyn Song>,
    metronome_port: Option<AudioPortPtr>,
}

/// The realtime mixer engine.
pub struct Mixer {
    frames_per_period: usize,
    base_sample_rate: u32,
    config: Config,

    state: Mutex<EngineState>,
    pool: BufferPool,
    input: CaptureRing,
    workers: WorkerPool,
    fx: Arc<dyn FxMixer>,

    quality: Mutex<QualitySettings>,
    /// Linear master gain, stored as f32 bits
    master_gain: AtomicU32,
    /// Smoothed 0..=100 load percentage
    cpu_load: AtomicU32,
    /// Cached `output rate * multiplier`; refreshed on device and quality
    /// changes so the period loop never takes the device lock
    processing_rate: AtomicU32,
    last_metronome_tick: AtomicI64,

    audio_device: Mutex<Option<Box<dyn AudioDevice>>>,
    old_audio_device: Mutex<Option<Box<dyn AudioDevice>>>,
    audio_device_name: Mutex<&'static str>,
    midi_client: Mutex<Option<Box<dyn MidiClient>>>,
    midi_client_name: Mutex<&'static str>,

    fifo: Fifo,
    fifo_writer: Mutex<Option<FifoWriter>>,
    fifo_in_use: AtomicBool,

    observers: Mutex<Vec<flume::Sender<MixerEvent>>>,

    // Dropped last: handle and port cells released above defer their
    // deallocation to this runtime's collector.
    gc: GcRuntime,
}

impl Mixer {
    /// Build the engine with the host's default worker count.
    pub fn new(config: &Config, song: Box<dyn Song>, fx: Arc<dyn FxMixer>) -> Arc<Self> {
        Self::with_worker_threads(config, song, fx, WorkerPool::default_worker_threads())
    }

    /// Build the engine with an explicit worker-thread count. Zero means
    /// the caller drains every stage alone; output is identical either
    /// way.
    pub fn with_worker_threads(
        config: &Config,
        song: Box<dyn Song>,
        fx: Arc<dyn FxMixer>,
        worker_threads: usize,
    ) -> Arc<Self> {
        let configured = config.frames_per_period();
        // Oversized periods are processed in default-size slices pushed
        // through a correspondingly deeper fifo.
        let (frames_per_period, fifo_depth) = if configured > DEFAULT_FRAMES_PER_PERIOD {
            (
                DEFAULT_FRAMES_PER_PERIOD,
                configured / DEFAULT_FRAMES_PER_PERIOD,
            )
        } else {
            (configured, 1)
        };
        let base_sample_rate = config.base_sample_rate();

        log::info!(
            "mixer: {} frames/period, pool depth {}, fifo depth {}, {} worker thread(s)",
            frames_per_period,
            DEFAULT_POOL_DEPTH,
            fifo_depth,
            worker_threads
        );

        Arc::new(Self {
            frames_per_period,
            base_sample_rate,
            config: config.clone(),
            state: Mutex::new(EngineState {
                play_handles: Vec::new(),
                handles_to_remove: Vec::new(),
                audio_ports: Vec::new(),
                song,
                metronome_port: None,
            }),
            pool: BufferPool::new(DEFAULT_POOL_DEPTH, frames_per_period),
            input: CaptureRing::new(frames_per_period),
            workers: WorkerPool::new(worker_threads, frames_per_period, Arc::clone(&fx)),
            fx,
            quality: Mutex::new(QualitySettings::default()),
            master_gain: AtomicU32::new(1.0f32.to_bits()),
            cpu_load: AtomicU32::new(0),
            processing_rate: AtomicU32::new(base_sample_rate),
            last_metronome_tick: AtomicI64::new(-1),
            audio_device: Mutex::new(None),
            old_audio_device: Mutex::new(None),
            audio_device_name: Mutex::new("none"),
            midi_client: Mutex::new(None),
            midi_client_name: Mutex::new("none"),
            fifo: Fifo::new(fifo_depth),
            fifo_writer: Mutex::new(None),
            fifo_in_use: AtomicBool::new(false),
            observers: Mutex::new(Vec::new()),
            gc: GcRuntime::new(),
        })
    }

    // ── period loop ─────────────────────────────────────────────────────

    /// Render one period and return the finished buffer.
    ///
    /// The guard stays valid until the next call; drop it before then.
    pub fn render_next_buffer(&self) -> PoolReadGuard<'_> {
        let started = Instant::now();

        // Make the previous period's capture readable and open a fresh
        // write side for producers.
        self.input.swap();

        {
            let mut state = self.state.lock();
            let state = &mut *state;

            self.tick_metronome(state);

            // Deferred deletions from other threads, keyed by id so a
            // recycled allocation can never match a stale entry.
            if !state.handles_to_remove.is_empty() {
                let doomed = &state.handles_to_remove;
                state
                    .play_handles
                    .retain(|handle| !doomed.contains(&handle.id()));
                state.handles_to_remove.clear();
            }

            self.pool.rotate_and_clear();
            self.fx.prepare_master_mix();

            {
                let gc_handle = self.gc.handle();
                let mut ctx = PeriodContext::new(
                    self.frames_per_period,
                    &mut state.play_handles,
                    &mut state.audio_ports,
                    &gc_handle,
                );
                state.song.process_next_buffer(&mut ctx);
            }

            // Stage 1: render every live play handle into its port.
            let queue = self.workers.queue();
            queue.reset();
            for handle in &state.play_handles {
                if !handle.is_done() {
                    queue.push(Job::PlayHandle(handle.clone()));
                }
            }
            self.workers.run_stage();

            // Cull whatever finished, except handles pinned to another
            // thread; those wait for their owner's removal request.
            let current = thread::current().id();
            state.play_handles.retain(|handle| {
                if let Some(affinity) = handle.affinity() {
                    if affinity != current {
                        return true;
                    }
                }
                !handle.is_done()
            });

            // Stage 2: port effect chains and FX routing.
            queue.reset();
            for port in &state.audio_ports {
                queue.push(Job::PortEffects(port.clone()));
            }
            self.workers.run_stage();

            // Stage 3: the FX channels themselves.
            queue.reset();
            for channel in 1..=self.fx.num_channels() {
                queue.push(Job::FxChannel(channel));
            }
            self.workers.run_stage();

            // Stage 4: fold the master bus into this period's write slot,
            // then publish it for readers. It stays frozen until the next
            // period boundary.
            {
                let mut write = self.pool.lock_write();
                self.fx.master_mix(&mut write);
                let gain = self.master_gain();
                if gain != 1.0 {
                    for frame in write.iter_mut() {
                        *frame *= gain;
                    }
                }
            }
            self.pool.publish_read();
        }

        self.emit(MixerEvent::NextAudioBuffer);

        // Load estimate: fraction of the period's wallclock budget used,
        // smoothed so meters do not flicker.
        let elapsed_us = started.elapsed().as_micros() as f32;
        let instant_load = elapsed_us / 10_000.0 * self.processing_sample_rate() as f32
            / self.frames_per_period as f32;
        let old_load = self.cpu_load.load(Ordering::Relaxed) as f32;
        let new_load = (instant_load * 0.1 + old_load * 0.9).round().clamp(0.0, 100.0);
        self.cpu_load.store(new_load as u32, Ordering::Relaxed);

        self.pool.lock_read()
    }

    fn tick_metronome(&self, state: &mut EngineState) {
        let Some(tick) = state.song.pattern_recording_tick() else {
            return;
        };
        if tick % (DEFAULT_TICKS_PER_TACT / 4) != 0 {
            return;
        }
        if self.last_metronome_tick.load(Ordering::Relaxed) == tick as i64 {
            return;
        }

        if state.metronome_port.is_none() {
            let port = AudioPort::register(
                &self.gc.handle(),
                AudioPort::new("metronome", self.frames_per_period, 0),
            );
            state.audio_ports.push(port.clone());
            state.metronome_port = Some(port);
        }
        if let Some(port) = &state.metronome_port {
            let click = PlayHandleCell::register(
                &self.gc.handle(),
                Box::new(ClickHandle::new(port.clone())),
            );
            state.play_handles.push(click);
            self.last_metronome_tick.store(tick as i64, Ordering::Relaxed);
        }
    }

    /// Copy the next finished period into `out`: straight from the loop
    /// when the device drives it, from the fifo otherwise. Returns false
    /// on end of stream, leaving silence in `out`.
    pub fn next_output_period(&self, out: &mut [SurroundFrame]) -> bool {
        if self.fifo_in_use.load(Ordering::Acquire) {
            match self.fifo.receiver().recv_timeout(FIFO_READ_TIMEOUT) {
                Ok(Some(buf)) => {
                    let n = out.len().min(buf.len());
                    out[..n].copy_from_slice(&buf[..n]);
                    true
                }
                Ok(None) | Err(_) => {
                    clear_audio_buffer(out);
                    false
                }
            }
        } else {
            let period = self.render_next_buffer();
            let n = out.len().min(period.len());
            out[..n].copy_from_slice(&period[..n]);
            true
        }
    }

    // ── play handles and ports ──────────────────────────────────────────

    /// Register a new voice.
    pub fn add_play_handle(&self, handle: Box<dyn PlayHandle>) -> PlayHandlePtr {
        let cell = PlayHandleCell::register(&self.gc.handle(), handle);
        self.state.lock().play_handles.push(cell.clone());
        cell
    }

    /// Remove one voice. When the handle is pinned to the calling thread
    /// it goes away immediately; otherwise removal is deferred to the next
    /// period's drain.
    pub fn remove_play_handle(&self, handle: &PlayHandlePtr) {
        let mut state = self.state.lock();
        match handle.affinity() {
            Some(affinity) if affinity == thread::current().id() => {
                let id = handle.id();
                state.play_handles.retain(|h| h.id() != id);
            }
            _ => state.handles_to_remove.push(handle.id()),
        }
    }

    /// Remove every voice spawned by the given track.
    pub fn remove_play_handles_of_track(&self, track: TrackId) {
        self.state
            .lock()
            .play_handles
            .retain(|handle| !handle.is_from_track(track));
    }

    /// Queue every non-instrument voice for removal. Instrument handles
    /// persist for the lifetime of their instrument: destroying one would
    /// orphan every later note.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        let state = &mut *state;
        for handle in &state.play_handles {
            if handle.kind() != PlayHandleKind::Instrument {
                state.handles_to_remove.push(handle.id());
            }
        }
    }

    /// Register a per-track accumulator.
    pub fn register_audio_port(&self, port: AudioPort) -> AudioPortPtr {
        let ptr = AudioPort::register(&self.gc.handle(), port);
        self.state.lock().audio_ports.push(ptr.clone());
        ptr
    }

    pub fn remove_audio_port(&self, port: &AudioPortPtr) {
        let id = port.id();
        self.state.lock().audio_ports.retain(|p| p.id() != id);
    }

    pub fn play_handle_count(&self) -> usize {
        self.state.lock().play_handles.len()
    }

    pub fn audio_port_count(&self) -> usize {
        self.state.lock().audio_ports.len()
    }

    // ── input capture ───────────────────────────────────────────────────

    /// Append captured input frames; any thread, any block size.
    pub fn push_input_frames(&self, frames: &[StereoFrame]) {
        self.input.push(frames);
    }

    /// The input captured during the previous period, for monitoring
    /// handles.
    pub fn captured_input(&self) -> InputGuard<'_> {
        self.input.read_guard()
    }

    // ── gains, load, rates ──────────────────────────────────────────────

    pub fn master_gain(&self) -> f32 {
        f32::from_bits(self.master_gain.load(Ordering::Relaxed))
    }

    pub fn set_master_gain(&self, gain: f32) {
        self.master_gain.store(gain.to_bits(), Ordering::Relaxed);
    }

    /// Smoothed CPU load, 0..=100.
    pub fn cpu_load(&self) -> u32 {
        self.cpu_load.load(Ordering::Relaxed)
    }

    /// Whether realtime playback is about to miss deadlines. The transport
    /// decides what to shed in response.
    pub fn critical_xruns(&self) -> bool {
        self.cpu_load() >= XRUN_LOAD && self.state.lock().song.is_realtime()
    }

    #[inline]
    pub fn frames_per_period(&self) -> usize {
        self.frames_per_period
    }

    pub fn base_sample_rate(&self) -> u32 {
        self.base_sample_rate
    }

    pub fn output_sample_rate(&self) -> u32 {
        self.audio_device
            .lock()
            .as_ref()
            .map(|dev| dev.sample_rate())
            .unwrap_or(self.base_sample_rate)
    }

    pub fn input_sample_rate(&self) -> u32 {
        self.output_sample_rate()
    }

    /// Output rate times the oversampling multiplier; cached so the period
    /// loop never touches the device slot.
    pub fn processing_sample_rate(&self) -> u32 {
        self.processing_rate.load(Ordering::Acquire)
    }

    fn refresh_processing_rate(&self) {
        let output = self.output_sample_rate();
        let multiplier = self.quality.lock().sample_rate_multiplier();
        self.processing_rate
            .store(output * multiplier, Ordering::Release);
    }

    pub fn quality_settings(&self) -> QualitySettings {
        *self.quality.lock()
    }

    // ── events ──────────────────────────────────────────────────────────

    /// Subscribe to engine notifications. Each subscriber gets its own
    /// bounded queue; a full queue drops events rather than stalling the
    /// period loop.
    pub fn subscribe(&self) -> flume::Receiver<MixerEvent> {
        let (tx, rx) = flume::bounded(EVENT_QUEUE_DEPTH);
        self.observers.lock().push(tx);
        rx
    }

    fn emit(&self, event: MixerEvent) {
        let mut observers = self.observers.lock();
        observers.retain(|tx| {
            !matches!(
                tx.try_send(event),
                Err(flume::TrySendError::Disconnected(_))
            )
        });
    }

    // ── devices, quality, processing lifecycle ──────────────────────────

    /// Probe and install the audio device and MIDI client configured in
    /// `mixer.audiodev` / `mixer.mididev`.
    pub fn init_devices(self: &Arc<Self>) {
        let source = RenderSource::new(Arc::downgrade(self));
        let (device, name) = try_audio_devices(&self.config.mixer.audiodev, source);
        *self.audio_device.lock() = Some(device);
        *self.audio_device_name.lock() = name;
        self.refresh_processing_rate();

        let (client, client_name) = trellis_midi::try_midi_clients(&self.config.mixer.mididev);
        *self.midi_client.lock() = Some(client);
        *self.midi_client_name.lock() = client_name;

        log::info!("mixer: audio backend '{}', MIDI backend '{}'", name, client_name);
    }

    /// Name of the probed audio backend.
    pub fn audio_device_name(&self) -> &'static str {
        *self.audio_device_name.lock()
    }

    pub fn midi_client_name(&self) -> &'static str {
        *self.midi_client_name.lock()
    }

    /// A consumer handle onto the output fifo (render-to-disk readers).
    pub fn fifo_reader(&self) -> FifoReader {
        self.fifo.reader()
    }

    /// Start the period loop. With `needs_fifo` a writer thread renders
    /// ahead into the fifo; otherwise the device callback drives rendering
    /// directly.
    pub fn start_processing(self: &Arc<Self>, needs_fifo: bool) {
        self.fifo_in_use.store(needs_fifo, Ordering::Release);
        if needs_fifo {
            let writer = FifoWriter::start(
                Arc::downgrade(self),
                self.fifo.sender(),
                self.frames_per_period,
            );
            *self.fifo_writer.lock() = Some(writer);
        }
        if let Some(device) = self.audio_device.lock().as_mut() {
            device.start_processing();
        }
    }

    /// Stop the period loop: finish the fifo writer (if any), stop the
    /// device, then wait for the writer to exit.
    pub fn stop_processing(&self) {
        let writer = self.fifo_writer.lock().take();
        if let Some(writer) = writer {
            writer.finish();
            if let Some(device) = self.audio_device.lock().as_mut() {
                device.stop_processing();
            }
            writer.join();
        } else if let Some(device) = self.audio_device.lock().as_mut() {
            device.stop_processing();
        }
        self.fifo_in_use.store(false, Ordering::Release);
    }

    /// Swap quality settings. Processing is restarted around the change;
    /// the device re-reads the settings through `apply_quality_settings`.
    pub fn change_quality(self: &Arc<Self>, settings: QualitySettings) {
        let was_fifo = self.fifo_in_use.load(Ordering::Acquire);
        self.stop_processing();

        *self.quality.lock() = settings;
        if let Some(device) = self.audio_device.lock().as_mut() {
            device.apply_quality_settings();
        }
        self.refresh_processing_rate();

        self.emit(MixerEvent::SampleRateChanged);
        self.emit(MixerEvent::QualitySettingsChanged);

        self.start_processing(was_fifo);
    }

    /// Install a new audio device, retaining the old one for
    /// [`restore_audio_device`](Self::restore_audio_device). `None` probes
    /// the configured backends again.
    pub fn set_audio_device(
        self: &Arc<Self>,
        device: Option<Box<dyn AudioDevice>>,
        settings: Option<QualitySettings>,
        needs_fifo: bool,
    ) {
        self.stop_processing();

        if let Some(settings) = settings {
            *self.quality.lock() = settings;
            self.emit(MixerEvent::QualitySettingsChanged);
        }

        let old = self.audio_device.lock().take();
        *self.old_audio_device.lock() = old;

        let (device, name) = match device {
            Some(device) => {
                let name = device.name();
                (device, name)
            }
            None => {
                log::warn!("mixer: no device given, probing for a working backend");
                let source = RenderSource::new(Arc::downgrade(self));
                try_audio_devices(&self.config.mixer.audiodev, source)
            }
        };
        *self.audio_device.lock() = Some(device);
        *self.audio_device_name.lock() = name;
        self.refresh_processing_rate();

        self.emit(MixerEvent::SampleRateChanged);
        self.start_processing(needs_fifo);
    }

    /// Swap back to the device retained by the last `set_audio_device`.
    pub fn restore_audio_device(self: &Arc<Self>) {
        let Some(old) = self.old_audio_device.lock().take() else {
            return;
        };
        let was_fifo = self.fifo_in_use.load(Ordering::Acquire);
        self.stop_processing();

        let name = old.name();
        *self.audio_device.lock() = Some(old);
        *self.audio_device_name.lock() = name;
        self.refresh_processing_rate();

        self.emit(MixerEvent::SampleRateChanged);
        self.start_processing(was_fifo);
    }
}

impl Drop for Mixer {
    fn drop(&mut self) {
        self.stop_processing();
        *self.audio_device.lock() = None;
        *self.old_audio_device.lock() = None;
        *self.midi_client.lock() = None;
        // Release every period still parked in the fifo.
        self.fifo.drain();
        // WorkerPool and GcRuntime shut their threads down in their own
        // Drop impls, in field order.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::audio_port::buffer_to_port;
    use crate::engine::fx::BusMixer;
    use crate::engine::song::IdleSong;
    use crate::types::VolumeVector;
    use std::thread::ThreadId;

    fn test_mixer(workers: usize) -> Arc<Mixer> {
        let config = Config::default();
        Mixer::with_worker_threads(
            &config,
            Box::new(IdleSong),
            Arc::new(BusMixer::new(4, config.frames_per_period())),
            workers,
        )
    }

    /// Writes a constant value into its port for a fixed number of
    /// periods.
    struct ConstantVoice {
        port: AudioPortPtr,
        value: f32,
        periods_left: usize,
        track: TrackId,
    }

    impl PlayHandle for ConstantVoice {
        fn play(&mut self, scratch: &mut [StereoFrame]) {
            if self.periods_left == 0 {
                return;
            }
            for frame in scratch.iter_mut() {
                *frame = StereoFrame::mono(self.value);
            }
            let n = scratch.len();
            buffer_to_port(scratch, n, 0, VolumeVector::unity(), &self.port);
            self.periods_left -= 1;
        }

        fn is_done(&self) -> bool {
            self.periods_left == 0
        }

        fn kind(&self) -> PlayHandleKind {
            PlayHandleKind::Note
        }

        fn is_from_track(&self, track: TrackId) -> bool {
            track == self.track
        }
    }

    /// Never finishes on its own; pinned to its creating thread.
    struct PinnedVoice {
        home: ThreadId,
    }

    impl PlayHandle for PinnedVoice {
        fn play(&mut self, _scratch: &mut [StereoFrame]) {}

        fn is_done(&self) -> bool {
            false
        }

        fn kind(&self) -> PlayHandleKind {
            PlayHandleKind::Note
        }

        fn affinity_matters(&self) -> bool {
            true
        }

        fn affinity(&self) -> Option<ThreadId> {
            Some(self.home)
        }
    }

    struct EndlessVoice {
        kind: PlayHandleKind,
    }

    impl PlayHandle for EndlessVoice {
        fn play(&mut self, _scratch: &mut [StereoFrame]) {}

        fn is_done(&self) -> bool {
            false
        }

        fn kind(&self) -> PlayHandleKind {
            self.kind
        }
    }

    #[test]
    fn test_silence_without_handles() {
        let mixer = test_mixer(0);
        let period = mixer.render_next_buffer();
        assert_eq!(period.len(), DEFAULT_FRAMES_PER_PERIOD);
        assert!(period.iter().all(|f| *f == SurroundFrame::silence()));
    }

    #[test]
    fn test_single_voice_passes_through_unity_rack() {
        let mixer = test_mixer(2);
        let port = mixer.register_audio_port(AudioPort::new("track", 256, 1));
        mixer.add_play_handle(Box::new(ConstantVoice {
            port,
            value: 0.25,
            periods_left: 1,
            track: 1,
        }));

        let period = mixer.render_next_buffer();
        assert_eq!(period.len(), 256);
        for frame in period.iter() {
            assert!((frame.0[0] - 0.25).abs() < 1e-6);
            assert!((frame.0[1] - 0.25).abs() < 1e-6);
        }
    }

    #[test]
    fn test_consecutive_periods_return_distinct_buffers() {
        let mixer = test_mixer(0);
        let first = mixer.render_next_buffer().as_slice().as_ptr();
        let second = mixer.render_next_buffer().as_slice().as_ptr();
        assert_ne!(first, second);
    }

    #[test]
    fn test_engine_only_matches_threaded_output() {
        let render = |workers: usize| -> Vec<SurroundFrame> {
            let mixer = test_mixer(workers);
            let port = mixer.register_audio_port(AudioPort::new("track", 256, 1));
            mixer.add_play_handle(Box::new(ConstantVoice {
                port,
                value: 0.125,
                periods_left: 2,
                track: 1,
            }));
            let result = mixer.render_next_buffer().to_vec();
            result
        };

        assert_eq!(render(0), render(3));
    }

    #[test]
    fn test_done_voices_are_culled_after_stage_one() {
        let mixer = test_mixer(0);
        let port = mixer.register_audio_port(AudioPort::new("track", 256, 1));
        mixer.add_play_handle(Box::new(ConstantVoice {
            port,
            value: 0.1,
            periods_left: 2,
            track: 1,
        }));

        mixer.render_next_buffer();
        assert_eq!(mixer.play_handle_count(), 1);
        mixer.render_next_buffer();
        assert_eq!(mixer.play_handle_count(), 0);
    }

    #[test]
    fn test_wrong_thread_removal_is_deferred_one_period() {
        let mixer = test_mixer(0);
        let handle = mixer.add_play_handle(Box::new(PinnedVoice {
            home: thread::current().id(),
        }));

        let mixer2 = Arc::clone(&mixer);
        let handle2 = handle.clone();
        thread::spawn(move || {
            mixer2.remove_play_handle(&handle2);
        })
        .join()
        .unwrap();

        // Still present: the other thread could only queue the removal.
        assert_eq!(mixer.play_handle_count(), 1);

        mixer.render_next_buffer();
        assert_eq!(mixer.play_handle_count(), 0);
    }

    #[test]
    fn test_same_thread_removal_is_immediate_for_pinned_voice() {
        let mixer = test_mixer(0);
        let handle = mixer.add_play_handle(Box::new(PinnedVoice {
            home: thread::current().id(),
        }));
        mixer.remove_play_handle(&handle);
        assert_eq!(mixer.play_handle_count(), 0);
    }

    #[test]
    fn test_clear_preserves_instrument_handles() {
        let mixer = test_mixer(0);
        mixer.add_play_handle(Box::new(EndlessVoice {
            kind: PlayHandleKind::Instrument,
        }));
        mixer.add_play_handle(Box::new(EndlessVoice {
            kind: PlayHandleKind::Note,
        }));

        mixer.clear();
        mixer.render_next_buffer();

        assert_eq!(mixer.play_handle_count(), 1);
        let state = mixer.state.lock();
        assert_eq!(state.play_handles[0].kind(), PlayHandleKind::Instrument);
    }

    #[test]
    fn test_track_removal_is_exact() {
        let mixer = test_mixer(0);
        let port = mixer.register_audio_port(AudioPort::new("track", 256, 1));
        for track in [1, 2, 1] {
            mixer.add_play_handle(Box::new(ConstantVoice {
                port: port.clone(),
                value: 0.0,
                periods_left: 10,
                track,
            }));
        }

        mixer.remove_play_handles_of_track(1);
        assert_eq!(mixer.play_handle_count(), 1);
        let state = mixer.state.lock();
        assert!(state.play_handles[0].is_from_track(2));
    }

    #[test]
    fn test_cpu_load_stays_in_range() {
        let mixer = test_mixer(0);
        for _ in 0..20 {
            mixer.render_next_buffer();
            assert!(mixer.cpu_load() <= 100);
        }
        assert!(!mixer.critical_xruns());
    }

    #[test]
    fn test_input_round_trip_through_period() {
        let mixer = test_mixer(0);
        let frames: Vec<StereoFrame> = (0..40).map(|i| StereoFrame::mono(i as f32)).collect();
        mixer.push_input_frames(&frames[..25]);
        mixer.push_input_frames(&frames[25..]);

        mixer.render_next_buffer();

        let captured = mixer.captured_input();
        assert_eq!(captured.len(), 40);
        for (i, f) in captured.iter().enumerate() {
            assert_eq!(*f, StereoFrame::mono(i as f32));
        }
    }

    struct RecordingSong {
        tick: u32,
    }

    impl Song for RecordingSong {
        fn process_next_buffer(&mut self, _ctx: &mut PeriodContext<'_>) {}

        fn pattern_recording_tick(&self) -> Option<u32> {
            Some(self.tick)
        }
    }

    #[test]
    fn test_metronome_clicks_once_per_quarter_tact() {
        let config = Config::default();
        let mixer = Mixer::with_worker_threads(
            &config,
            Box::new(RecordingSong { tick: 48 }),
            Arc::new(BusMixer::new(4, config.frames_per_period())),
            0,
        );

        mixer.render_next_buffer();
        // One click voice on the metronome port.
        assert_eq!(mixer.play_handle_count(), 1);
        assert_eq!(mixer.audio_port_count(), 1);

        // Same tick position: no second click.
        mixer.render_next_buffer();
        assert_eq!(mixer.play_handle_count(), 1);
    }

    #[test]
    fn test_metronome_skips_off_grid_ticks() {
        let config = Config::default();
        let mixer = Mixer::with_worker_threads(
            &config,
            Box::new(RecordingSong { tick: 47 }),
            Arc::new(BusMixer::new(4, config.frames_per_period())),
            0,
        );
        mixer.render_next_buffer();
        assert_eq!(mixer.play_handle_count(), 0);
    }

    #[test]
    fn test_minimum_period_boundary() {
        let mut config = Config::default();
        config.mixer.framesperaudiobuffer = 32;
        let mixer = Mixer::with_worker_threads(
            &config,
            Box::new(IdleSong),
            Arc::new(BusMixer::new(2, 32)),
            0,
        );
        assert_eq!(mixer.frames_per_period(), 32);
        let period = mixer.render_next_buffer();
        assert_eq!(period.len(), 32);
    }

    #[test]
    fn test_oversized_period_folds_into_fifo_slices() {
        let mut config = Config::default();
        config.mixer.framesperaudiobuffer = 1024;
        let mixer = Mixer::with_worker_threads(
            &config,
            Box::new(IdleSong),
            Arc::new(BusMixer::new(2, DEFAULT_FRAMES_PER_PERIOD)),
            0,
        );
        assert_eq!(mixer.frames_per_period(), DEFAULT_FRAMES_PER_PERIOD);
    }

    #[test]
    fn test_fifo_mode_renders_ahead_and_stops_cleanly() {
        let mixer = test_mixer(0);
        let reader = mixer.fifo_reader();

        mixer.start_processing(true);
        let buf = reader.read().expect("fifo should produce periods");
        assert_eq!(buf.len(), DEFAULT_FRAMES_PER_PERIOD);
        mixer.stop_processing();

        // Whatever was in flight drains; the stream must not wedge.
        while reader.try_read().is_some() {}
    }

    #[test]
    fn test_unknown_backend_preference_yields_dummy_device() {
        let mut config = Config::default();
        config.mixer.audiodev = "nonexistent".to_string();
        let mixer = Mixer::with_worker_threads(
            &config,
            Box::new(IdleSong),
            Arc::new(BusMixer::new(2, config.frames_per_period())),
            0,
        );
        mixer.init_devices();
        assert_eq!(mixer.audio_device_name(), "dummy");
    }

    #[test]
    fn test_master_gain_scales_output() {
        let mixer = test_mixer(0);
        let port = mixer.register_audio_port(AudioPort::new("track", 256, 1));
        mixer.add_play_handle(Box::new(ConstantVoice {
            port,
            value: 0.5,
            periods_left: 1,
            track: 1,
        }));
        mixer.set_master_gain(0.5);

        let period = mixer.render_next_buffer();
        assert!((period[0].0[0] - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_subscribers_receive_period_events() {
        let mixer = test_mixer(0);
        let events = mixer.subscribe();
        mixer.render_next_buffer();
        assert_eq!(events.try_recv().unwrap(), MixerEvent::NextAudioBuffer);
    }
}
