//! cpal audio backend
//!
//! Cross-platform output through cpal (ALSA/WASAPI/CoreAudio). cpal
//! streams are not `Send`, so the stream lives on a dedicated thread that
//! builds it, keeps it playing, and drops it when told to stop; the device
//! object the mixer owns is just the control handle.

use std::thread::{self, JoinHandle};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SampleFormat;

use super::device::{AudioDevice, RenderSource, SurroundPump};
use super::error::{AudioError, AudioResult};

pub struct CpalAudio {
    source: RenderSource,
    sample_rate: u32,
    stream_thread: Option<(flume::Sender<()>, JoinHandle<()>)>,
}

impl CpalAudio {
    pub const NAME: &'static str = "cpal";

    /// Probe the default host's default output device.
    pub fn new(source: RenderSource) -> AudioResult<Self> {
        let host = cpal::default_host();
        let device = host.default_output_device().ok_or(AudioError::NoDevices)?;
        let supported = device
            .default_output_config()
            .map_err(|e| AudioError::ConfigError(e.to_string()))?;
        if supported.sample_format() != SampleFormat::F32 {
            return Err(AudioError::UnsupportedFormat(format!(
                "{:?}",
                supported.sample_format()
            )));
        }

        let device_name = device.name().unwrap_or_else(|_| "unknown".to_string());
        let sample_rate = supported.sample_rate().0;
        log::info!(
            "audio: cpal device '{}', {} Hz, {} channel(s)",
            device_name,
            sample_rate,
            supported.channels()
        );

        Ok(Self {
            source,
            sample_rate,
            stream_thread: None,
        })
    }
}

impl AudioDevice for CpalAudio {
    fn start_processing(&mut self) {
        if self.stream_thread.is_some() {
            return;
        }

        let source = self.source.clone();
        let (stop_tx, stop_rx) = flume::bounded::<()>(1);

        let thread = thread::Builder::new()
            .name("trellis-cpal".to_string())
            .spawn(move || {
                let host = cpal::default_host();
                let Some(device) = host.default_output_device() else {
                    log::error!("audio: cpal output device disappeared");
                    return;
                };
                let supported = match device.default_output_config() {
                    Ok(c) => c,
                    Err(e) => {
                        log::error!("audio: cpal config failed: {}", e);
                        return;
                    }
                };
                let config = supported.config();
                let channels = config.channels as usize;
                let mut pump = SurroundPump::new(source);

                let stream = device.build_output_stream(
                    &config,
                    move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                        pump.fill_interleaved(data, channels);
                    },
                    |err| log::error!("audio: cpal stream error: {}", err),
                    None,
                );
                let stream = match stream {
                    Ok(s) => s,
                    Err(e) => {
                        log::error!("audio: cpal stream build failed: {}", e);
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    log::error!("audio: cpal stream start failed: {}", e);
                    return;
                }

                // Parked until stop is requested or the handle is dropped;
                // dropping the stream tears the callback down.
                let _ = stop_rx.recv();
                drop(stream);
            })
            .expect("failed to spawn cpal stream thread");

        self.stream_thread = Some((stop_tx, thread));
    }

    fn stop_processing(&mut self) {
        if let Some((stop_tx, thread)) = self.stream_thread.take() {
            let _ = stop_tx.send(());
            let _ = thread.join();
        }
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn apply_quality_settings(&mut self) {
        // The stream is rebuilt on the next start_processing; nothing is
        // negotiated while stopped.
        log::debug!("audio: cpal will renegotiate on restart");
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }
}

impl Drop for CpalAudio {
    fn drop(&mut self) {
        self.stop_processing();
    }
}
