//! MIDI client selection for the Trellis engine
//!
//! The engine only needs to know that *a* MIDI client exists and whether it
//! came up; note routing happens elsewhere. This crate provides:
//! - The `MidiClient` contract the engine stores a client behind
//! - A midir-backed client (ALSA on Linux, CoreMIDI on macOS, WinMM on Windows)
//! - A dummy client that is always available
//! - `try_midi_clients`: ordered probing with dummy fallback

mod client;
mod midir_client;

pub use client::{DummyMidiClient, MidiClient};
pub use midir_client::MidirClient;

/// Probe MIDI backends in order and return the first one that is running.
///
/// `preferred` is a backend name from configuration; the dummy name or an
/// empty string means "no preference, try everything". A name that matches
/// no compiled-in backend skips them all and yields the dummy client.
///
/// Never fails: the dummy client satisfies the contract unconditionally.
pub fn try_midi_clients(preferred: &str) -> (Box<dyn MidiClient>, &'static str) {
    let preferred = if preferred == DummyMidiClient::NAME {
        ""
    } else {
        preferred
    };

    if preferred == MidirClient::NAME || preferred.is_empty() {
        let client = MidirClient::new();
        if client.is_running() {
            return (Box::new(client), MidirClient::NAME);
        }
    }

    log::warn!("no MIDI backend came up, falling back to the dummy client");
    (Box::new(DummyMidiClient), DummyMidiClient::NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_preference_yields_dummy() {
        let (client, name) = try_midi_clients("nonexistent");
        assert_eq!(name, DummyMidiClient::NAME);
        assert!(client.is_running());
    }

    #[test]
    fn dummy_preference_means_try_all() {
        // Whatever backend wins, the probe must hand back a running client.
        let (client, _name) = try_midi_clients(DummyMidiClient::NAME);
        assert!(client.is_running());
    }
}
