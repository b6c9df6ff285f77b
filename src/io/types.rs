// src/io/types.rs
//
// Requests serviced by the receive worker between reads.

use std::sync::mpsc as std_mpsc;

// ============================================================================
// Transmit Types
// ============================================================================

/// Transmit request sent through the channel
pub struct TransmitRequest {
    /// Encoded bytes ready to write
    pub data: Vec<u8>,
}

/// Sender type for transmit requests (sync-safe, bounded)
pub type TransmitSender = std_mpsc::SyncSender<TransmitRequest>;
pub type TransmitReceiver = std_mpsc::Receiver<TransmitRequest>;

// ============================================================================
// Worker control
// ============================================================================

/// Runtime changes applied by the worker to the state it owns.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerControl {
    SetFrameCheck(bool),
    SetStartMarker(Vec<u8>),
}

pub type ControlSender = std_mpsc::Sender<WorkerControl>;
pub type ControlReceiver = std_mpsc::Receiver<WorkerControl>;
