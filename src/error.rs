//! Error types for the Jarvis voice session

use thiserror::Error;

/// Result type alias for voice session operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the voice session
///
/// Guard refusals (recording while a reply plays, playing while recording)
/// are not errors: they surface as `false` or no-op returns.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Microphone unavailable, denied, or not running
    #[error("device error: {0}")]
    Device(String),

    /// Upload or download failed (transport error or non-2xx status)
    #[error("network error: {0}")]
    Network(String),

    /// Staged file is not a RIFF/WAVE container
    #[error("format error: {0}")]
    Format(String),

    /// Container is valid but the sample data cannot be decoded
    #[error("decode error: {0}")]
    Decode(String),

    /// Audio output or graph error
    #[error("audio error: {0}")]
    Audio(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Short label for the error class, used as a structured log field
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Device(_) => "device",
            Self::Network(_) => "network",
            Self::Format(_) => "format",
            Self::Decode(_) => "decode",
            Self::Audio(_) => "audio",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
        }
    }
}
