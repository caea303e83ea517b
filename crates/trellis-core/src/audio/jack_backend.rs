//! Native JACK audio backend
//!
//! Pro-audio output with port-level routing, used when the `jack-backend`
//! feature is enabled and a JACK (or PipeWire-JACK) server is running. The
//! process callback pulls frames through a [`SurroundPump`] exactly like
//! the cpal backend; JACK owns the realtime thread.

use jack::{AudioOut, Client, ClientOptions, Control, Port, ProcessScope};

use super::device::{AudioDevice, RenderSource, SurroundPump};
use super::error::{AudioError, AudioResult};

const CLIENT_NAME: &str = "trellis";

pub struct JackAudio {
    source: RenderSource,
    sample_rate: u32,
    /// Client held between construction/stop and the next start.
    client: Option<Client>,
    active: Option<jack::AsyncClient<Notifications, Processor>>,
}

struct Notifications;

impl jack::NotificationHandler for Notifications {}

struct Processor {
    out_left: Port<AudioOut>,
    out_right: Port<AudioOut>,
    pump: SurroundPump,
}

impl jack::ProcessHandler for Processor {
    fn process(&mut self, _client: &Client, ps: &ProcessScope) -> Control {
        let n_frames = ps.n_frames() as usize;
        let left = self.out_left.as_mut_slice(ps);
        let right = self.out_right.as_mut_slice(ps);

        for i in 0..n_frames {
            let frame = self.pump.next_frame();
            left[i] = frame.0[0];
            right[i] = frame.0[1];
        }
        Control::Continue
    }
}

impl JackAudio {
    pub const NAME: &'static str = "jack";

    /// Connect to the JACK server.
    pub fn new(source: RenderSource) -> AudioResult<Self> {
        let (client, _status) = Client::new(CLIENT_NAME, ClientOptions::NO_START_SERVER)
            .map_err(|e| AudioError::BackendUnavailable(e.to_string()))?;
        let sample_rate = client.sample_rate() as u32;
        log::info!(
            "audio: JACK server at {} Hz, {} frames",
            sample_rate,
            client.buffer_size()
        );
        Ok(Self {
            source,
            sample_rate,
            client: Some(client),
            active: None,
        })
    }

    fn connect_client(&mut self) -> AudioResult<Client> {
        if let Some(client) = self.client.take() {
            return Ok(client);
        }
        let (client, _status) = Client::new(CLIENT_NAME, ClientOptions::NO_START_SERVER)
            .map_err(|e| AudioError::BackendUnavailable(e.to_string()))?;
        Ok(client)
    }
}

impl AudioDevice for JackAudio {
    fn start_processing(&mut self) {
        if self.active.is_some() {
            return;
        }
        let client = match self.connect_client() {
            Ok(c) => c,
            Err(e) => {
                log::error!("audio: JACK reconnect failed: {}", e);
                return;
            }
        };
        self.sample_rate = client.sample_rate() as u32;

        let out_left = client.register_port("out_l", AudioOut::default());
        let out_right = client.register_port("out_r", AudioOut::default());
        let (out_left, out_right) = match (out_left, out_right) {
            (Ok(l), Ok(r)) => (l, r),
            (l, r) => {
                log::error!(
                    "audio: JACK port registration failed: {:?} / {:?}",
                    l.err(),
                    r.err()
                );
                return;
            }
        };

        let processor = Processor {
            out_left,
            out_right,
            pump: SurroundPump::new(self.source.clone()),
        };
        match client.activate_async(Notifications, processor) {
            Ok(active) => self.active = Some(active),
            Err(e) => log::error!("audio: JACK activation failed: {}", e),
        }
    }

    fn stop_processing(&mut self) {
        if let Some(active) = self.active.take() {
            // Dropping the deactivated client releases its ports; the next
            // start connects afresh.
            if let Err(e) = active.deactivate() {
                log::error!("audio: JACK deactivation failed: {}", e);
            }
            self.client = None;
        }
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn apply_quality_settings(&mut self) {
        // JACK dictates the rate; oversampling happens engine-side.
        log::debug!("audio: JACK keeps the server rate");
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }
}

impl Drop for JackAudio {
    fn drop(&mut self) {
        self.stop_processing();
    }
}
