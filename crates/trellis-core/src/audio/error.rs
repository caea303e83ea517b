//! Audio backend error types

use thiserror::Error;

/// Errors that can occur while bringing up or running a backend
#[derive(Error, Debug)]
pub enum AudioError {
    /// Backend service not reachable (no JACK server, no sound system)
    #[error("Audio backend unavailable: {0}")]
    BackendUnavailable(String),

    /// No output devices on this host
    #[error("No audio output devices found")]
    NoDevices,

    /// Failed to get device configuration
    #[error("Failed to get device config: {0}")]
    ConfigError(String),

    /// Failed to build the output stream
    #[error("Failed to build audio stream: {0}")]
    StreamBuildError(String),

    /// Failed to start the output stream
    #[error("Failed to start audio stream: {0}")]
    StreamPlayError(String),

    /// Device only offers a sample format the engine does not speak
    #[error("Unsupported sample format: {0}")]
    UnsupportedFormat(String),
}

/// Result type for audio operations
pub type AudioResult<T> = Result<T, AudioError>;
