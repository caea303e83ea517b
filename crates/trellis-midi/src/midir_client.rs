//! midir-backed MIDI client
//!
//! Uses midir for cross-platform MIDI I/O (ALSA on Linux, CoreMIDI on macOS,
//! WinMM on Windows). Construction probes the platform service; a client
//! that failed to initialize reports `is_running() == false` and the caller
//! falls through to the next backend.

use midir::MidiInput;

/// MIDI client backed by the platform service midir selects.
pub struct MidirClient {
    running: bool,
    input_ports: usize,
}

impl MidirClient {
    pub const NAME: &'static str = "midir";

    /// Connect to the platform MIDI service.
    pub fn new() -> Self {
        match MidiInput::new("trellis") {
            Ok(input) => {
                let input_ports = input.ports().len();
                log::info!("MIDI: midir client up, {} input port(s)", input_ports);
                Self {
                    running: true,
                    input_ports,
                }
            }
            Err(e) => {
                log::warn!("MIDI: midir init failed: {}", e);
                Self {
                    running: false,
                    input_ports: 0,
                }
            }
        }
    }

    /// Number of input ports visible at probe time.
    pub fn input_ports(&self) -> usize {
        self.input_ports
    }
}

impl Default for MidirClient {
    fn default() -> Self {
        Self::new()
    }
}

impl super::MidiClient for MidirClient {
    fn is_running(&self) -> bool {
        self.running
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }
}
