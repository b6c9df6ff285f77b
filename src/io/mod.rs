// src/io/mod.rs
//
// Byte source abstraction and the event stream published to the UI.
// A source is a duplex link (serial port, in-memory mock) that the receive
// worker polls for bytes and writes transmit requests to.

pub mod mock;
pub mod serial;
pub mod types;

pub use mock::MockLink;
#[cfg(any(target_os = "windows", target_os = "macos", target_os = "linux"))]
pub use serial::SerialPortOpener;

use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

use crate::error::{FrameError, LinkError};
use crate::settings::LinkConfig;

/// Get current timestamp in microseconds since UNIX epoch
pub fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

// ============================================================================
// Source contract
// ============================================================================

/// An open duplex link. Owned by the receive worker for its whole lifetime.
pub trait ByteSource: Send {
    /// Read whatever is available into `buf`. `Ok(0)` means nothing arrived
    /// within the poll interval; it is not end-of-stream.
    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize, LinkError>;

    /// Write all of `data`.
    fn write(&mut self, data: &[u8]) -> Result<(), LinkError>;

    /// Release the underlying device. Further reads report `NotOpen`.
    fn close(&mut self);
}

/// Opens sources from a link configuration. Opening may block.
pub trait LinkOpener: Send + Sync {
    fn open(&self, config: &LinkConfig) -> Result<Box<dyn ByteSource>, LinkError>;
}

// ============================================================================
// Events
// ============================================================================

/// Link-level state machine: Closed -> Opening -> Open -> Closing -> Closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Closed,
    Opening,
    Open,
    Closing,
}

impl LinkState {
    /// Whether the UI should present the port as open.
    pub fn serial_opened(&self) -> bool {
        matches!(self, LinkState::Open)
    }
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LinkState::Closed => "closed",
            LinkState::Opening => "opening",
            LinkState::Open => "open",
            LinkState::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// Core -> UI notifications. Serialised as `{"type": "...", ...}`.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScopeEvent {
    LinkStateChanged {
        state: LinkState,
        serial_opened: bool,
    },
    BytesReceived {
        total: u64,
    },
    /// `points` is the series length after this tick; `appended` holds the
    /// points added by it. The full series is read through `ChartUpdater::series`.
    SeriesUpdated {
        channel: usize,
        points: usize,
        appended: Vec<(f64, f64)>,
    },
    FrameDesync {
        discarded: usize,
    },
    DecodeError {
        #[serde(serialize_with = "hex::serde::serialize_upper")]
        raw: Vec<u8>,
        reason: String,
    },
    ChecksumMismatch {
        #[serde(serialize_with = "hex::serde::serialize_upper")]
        raw: Vec<u8>,
        expected: u16,
        actual: u16,
    },
    LinkError {
        kind: String,
        message: String,
    },
    Transmitted {
        bytes: usize,
    },
    TransmitFailed {
        message: String,
    },
    ProcessingComplete,
}

impl ScopeEvent {
    pub fn state_changed(state: LinkState) -> Self {
        ScopeEvent::LinkStateChanged {
            state,
            serial_opened: state.serial_opened(),
        }
    }

    pub fn link_error(err: &LinkError) -> Self {
        ScopeEvent::LinkError {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

impl From<FrameError> for ScopeEvent {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Desync { discarded } => ScopeEvent::FrameDesync { discarded },
            FrameError::Decode { raw, reason } => ScopeEvent::DecodeError { raw, reason },
            FrameError::ChecksumMismatch {
                raw,
                expected,
                actual,
            } => ScopeEvent::ChecksumMismatch {
                raw,
                expected,
                actual,
            },
            // Transmit-side errors are returned to the caller, never streamed
            other => ScopeEvent::TransmitFailed {
                message: other.to_string(),
            },
        }
    }
}

pub type EventSender = mpsc::UnboundedSender<ScopeEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<ScopeEvent>;

/// Publish an event. A UI that stopped listening is not an error.
pub fn emit(events: &EventSender, event: ScopeEvent) {
    let _ = events.send(event);
}
