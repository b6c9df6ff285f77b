// src/error.rs
//
// Error types for the link, the receive pipeline and configuration.
// Only LinkError::Open and LinkError::Io end a session; FrameError values are
// reported and the stream continues.

use thiserror::Error;

/// Errors raised by a byte source (serial port, mock link).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LinkError {
    /// Adapter unavailable or configuration rejected. The link stays closed.
    #[error("Failed to open {port}: {reason}")]
    Open { port: String, reason: String },

    /// Read or write failure in the middle of a session.
    #[error("Link I/O error: {0}")]
    Io(String),

    /// The device went away (EOF on the port).
    #[error("Link disconnected")]
    Disconnected,

    #[error("Link is not open")]
    NotOpen,
}

impl LinkError {
    /// Short kind tag used in events and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            LinkError::Open { .. } => "open",
            LinkError::Io(_) => "io",
            LinkError::Disconnected => "disconnected",
            LinkError::NotOpen => "not_open",
        }
    }
}

/// Errors raised while turning raw bytes into samples.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FrameError {
    /// Bytes before a recognizable start marker were thrown away.
    #[error("Frame desync: {discarded} bytes discarded")]
    Desync { discarded: usize },

    /// A payload field failed to decode. `raw` is the complete frame body.
    #[error("Decode error ({reason}) in frame {}", hex::encode_upper(.raw))]
    Decode { raw: Vec<u8>, reason: String },

    #[error("Checksum mismatch: expected {expected:#06X}, got {actual:#06X}")]
    ChecksumMismatch {
        raw: Vec<u8>,
        expected: u16,
        actual: u16,
    },

    /// An outgoing frame body would contain the end marker.
    #[error("Frame body contains the end marker and cannot be framed")]
    MarkerInBody,

    /// An outgoing body does not match the fixed frame length.
    #[error("Frame body is {actual} bytes, fixed-length framing expects {expected}")]
    BodyLength { expected: usize, actual: usize },
}

/// Settings loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read settings file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse settings: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialise settings: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid hex marker '{value}': {source}")]
    InvalidMarker {
        value: String,
        #[source]
        source: hex::FromHexError,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Errors returned to callers of the session handle.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SessionError {
    #[error("Session controller has shut down")]
    ControllerGone,

    #[error("Link is not open")]
    NotOpen,

    #[error("Transmit queue is full")]
    TransmitQueueFull,

    #[error("Nothing to send")]
    EmptyMessage,

    #[error(transparent)]
    Frame(#[from] FrameError),
}
