// src/transmit.rs
//
// Send buffer and message encoding for the transmit path.
// Encoded bytes are queued to the receive worker, which owns the source and
// writes them between reads. Queueing never blocks the caller.

use serde::{Deserialize, Serialize};
use std::sync::mpsc::TrySendError;
use std::sync::{Arc, Mutex, PoisonError};

use crate::checksums::FrameCheck;
use crate::error::SessionError;
use crate::io::serial::framer::FramingEncoding;
use crate::io::types::{TransmitRequest, TransmitSender};
use crate::settings::{ScopeSettings, TransmitSettings};

// ============================================================================
// Types
// ============================================================================

/// Terminator appended to unframed messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineEnding {
    None,
    Lf,
    Crlf,
}

impl Default for LineEnding {
    fn default() -> Self {
        LineEnding::None
    }
}

impl LineEnding {
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            LineEnding::None => b"",
            LineEnding::Lf => b"\n",
            LineEnding::Crlf => b"\r\n",
        }
    }
}

/// Slot holding the worker's transmit queue while the link is open
pub type TransmitSlot = Arc<Mutex<Option<TransmitSender>>>;

// ============================================================================
// Transmit path
// ============================================================================

pub struct TransmitPath {
    message: String,
    settings: TransmitSettings,
    encoding: FramingEncoding,
    frame_check: FrameCheck,
    check_enabled: bool,
    slot: TransmitSlot,
}

impl TransmitPath {
    pub fn new(settings: &ScopeSettings, slot: TransmitSlot) -> Self {
        TransmitPath {
            message: String::new(),
            settings: settings.transmit.clone(),
            encoding: settings.framing.clone(),
            frame_check: settings.decoder.frame_check,
            check_enabled: settings.decoder.frame_check_enabled,
            slot,
        }
    }

    pub fn set_message(&mut self, text: impl Into<String>) {
        self.message = text.into();
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Clear the send buffer.
    pub fn clear(&mut self) {
        self.message.clear();
    }

    /// Mirror of the receive-side frame check toggle.
    pub fn set_frame_check(&mut self, enabled: bool) {
        self.check_enabled = enabled;
    }

    pub fn set_start_marker(&mut self, marker: Vec<u8>) {
        self.encoding.set_start_marker(marker);
    }

    /// Bytes that `send` would write for the current message.
    pub fn encode(&self) -> Result<Vec<u8>, SessionError> {
        if self.message.is_empty() {
            return Err(SessionError::EmptyMessage);
        }
        let text = self.message.as_bytes();

        if self.settings.frame_messages {
            let body = if self.check_enabled {
                self.frame_check.append_trailer(text)
            } else {
                text.to_vec()
            };
            return Ok(self.encoding.encode(&body)?);
        }

        let ending = self.settings.line_ending.as_bytes();
        let mut bytes = Vec::with_capacity(text.len() + ending.len());
        bytes.extend_from_slice(text);
        bytes.extend_from_slice(ending);
        Ok(bytes)
    }

    /// Queue the current message for writing. Returns the encoded length.
    /// The outcome of the write arrives later as a Transmitted or
    /// TransmitFailed event.
    pub fn send(&self) -> Result<usize, SessionError> {
        let data = self.encode()?;
        let tx = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(SessionError::NotOpen)?;

        let len = data.len();
        tx.try_send(TransmitRequest { data }).map_err(|e| match e {
            TrySendError::Full(_) => SessionError::TransmitQueueFull,
            TrySendError::Disconnected(_) => SessionError::NotOpen,
        })?;
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::SampleDecoder;
    use crate::error::FrameError;
    use crate::io::serial::framer::SerialFramer;
    use std::sync::mpsc as std_mpsc;

    fn path(settings: &ScopeSettings) -> (TransmitPath, TransmitSlot) {
        let slot: TransmitSlot = Arc::new(Mutex::new(None));
        (TransmitPath::new(settings, slot.clone()), slot)
    }

    #[test]
    fn test_raw_message_with_line_ending() {
        let mut settings = ScopeSettings::default();
        settings.transmit.line_ending = LineEnding::Crlf;
        let (mut tx, _) = path(&settings);

        tx.set_message("AT");
        assert_eq!(tx.encode().unwrap(), b"AT\r\n".to_vec());

        tx.clear();
        assert_eq!(tx.message(), "");
        assert_eq!(tx.encode(), Err(SessionError::EmptyMessage));
    }

    #[test]
    fn test_framed_message_roundtrips_through_receiver() {
        let mut settings = ScopeSettings::default();
        settings.transmit.frame_messages = true;
        settings.decoder.frame_check_enabled = true;
        let (mut tx, _) = path(&settings);
        tx.set_message("1.5,-4,250");

        let wire = tx.encode().unwrap();

        let mut framer = SerialFramer::new(settings.framing.clone());
        let mut decoder = SampleDecoder::new(&settings.decoder);
        // Deliver one byte at a time
        let mut frames = Vec::new();
        for byte in &wire {
            framer.append(std::slice::from_ref(byte));
            frames.extend(std::iter::from_fn(|| framer.try_extract_frame()));
        }
        assert_eq!(frames.len(), 1);

        let values: Vec<f64> = decoder
            .decode(&frames[0])
            .unwrap()
            .iter()
            .map(|s| s.value)
            .collect();
        assert_eq!(values, vec![1.5, -4.0, 250.0]);
    }

    #[test]
    fn test_framed_message_with_checksum_colliding_with_end_marker() {
        let mut settings = ScopeSettings::default();
        settings.transmit.frame_messages = true;
        settings.decoder.frame_check_enabled = true;
        let (mut tx, _) = path(&settings);
        // CRC-16/MODBUS trailer of "285" begins with 0x03
        tx.set_message("285");
        let wire = tx.encode().unwrap();

        let mut framer = SerialFramer::new(settings.framing.clone());
        let mut decoder = SampleDecoder::new(&settings.decoder);
        framer.append(&wire);
        let frame = framer.try_extract_frame().unwrap();
        let values: Vec<f64> = decoder.decode(&frame).unwrap().iter().map(|s| s.value).collect();
        assert_eq!(values, vec![285.0]);
        assert_eq!(framer.take_discarded(), 0);
    }

    #[test]
    fn test_unstuffed_message_containing_end_marker_refused() {
        let mut settings = ScopeSettings::default();
        settings.transmit.frame_messages = true;
        settings.framing = FramingEncoding::Markers {
            start: vec![0x02],
            end: vec![0x03],
            max_frame_length: 64,
            escape: Vec::new(),
        };
        let (mut tx, _) = path(&settings);
        tx.set_message("a\u{3}b");
        assert_eq!(
            tx.encode(),
            Err(SessionError::Frame(FrameError::MarkerInBody))
        );
    }

    #[test]
    fn test_start_marker_follows_receive_side() {
        let mut settings = ScopeSettings::default();
        settings.transmit.frame_messages = true;
        let (mut tx, _) = path(&settings);
        tx.set_start_marker(vec![0xAA, 0x55]);
        tx.set_message("1");
        assert_eq!(tx.encode().unwrap(), vec![0xAA, 0x55, b'1', 0x03]);
    }

    #[test]
    fn test_send_queues_without_blocking() {
        let (mut tx, slot) = path(&ScopeSettings::default());
        tx.set_message("hello");
        assert_eq!(tx.send(), Err(SessionError::NotOpen));

        let (queue_tx, queue_rx) = std_mpsc::sync_channel(1);
        *slot.lock().unwrap() = Some(queue_tx);

        assert_eq!(tx.send(), Ok(5));
        assert_eq!(tx.send(), Err(SessionError::TransmitQueueFull));
        assert_eq!(queue_rx.try_recv().unwrap().data, b"hello".to_vec());

        drop(queue_rx);
        assert_eq!(tx.send(), Err(SessionError::NotOpen));
    }
}
