// src/io/serial/framer.rs
//
// Ingest buffer and frame extraction for marker-delimited and fixed-length
// frames. Bytes are appended as they are read; complete frames are cut from
// the read position and the consumed prefix is compacted away.
//
// Marker frames are byte-stuffed: a body byte equal to the escape byte or to
// the first byte of either marker is sent as `escape, byte ^ 0x20`.

use serde::{Deserialize, Serialize};

use crate::error::FrameError;
use crate::io::now_us;

/// Consumed bytes kept before the buffer is compacted
const COMPACT_THRESHOLD: usize = 4096;

const STX: u8 = 0x02;
const ETX: u8 = 0x03;
const DLE: u8 = 0x10;

/// Applied to an escaped byte so the wire never carries a bare marker byte
const ESCAPE_XOR: u8 = 0x20;

// =============================================================================
// Types
// =============================================================================

/// Frame boundary scheme. Markers are written as hex strings in settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FramingEncoding {
    /// `start ++ body ++ end`. An empty start marker frames on `end` alone
    /// (line-oriented text).
    Markers {
        #[serde(with = "hex")]
        start: Vec<u8>,
        #[serde(with = "hex")]
        end: Vec<u8>,
        /// Longest body accepted before the start marker is treated as noise
        #[serde(default = "default_max_frame_length")]
        max_frame_length: usize,
        /// Stuffing escape byte; empty sends bodies unescaped
        #[serde(with = "hex", default = "default_escape")]
        escape: Vec<u8>,
    },
    /// `start ++ body[length] ++ end`, where `end` may be empty.
    FixedLength {
        #[serde(with = "hex")]
        start: Vec<u8>,
        length: usize,
        #[serde(with = "hex", default)]
        end: Vec<u8>,
    },
}

fn default_max_frame_length() -> usize {
    1024
}

fn default_escape() -> Vec<u8> {
    vec![DLE]
}

impl Default for FramingEncoding {
    fn default() -> Self {
        FramingEncoding::Markers {
            start: vec![STX],
            end: vec![ETX],
            max_frame_length: default_max_frame_length(),
            escape: default_escape(),
        }
    }
}

impl FramingEncoding {
    pub fn start_marker(&self) -> &[u8] {
        match self {
            FramingEncoding::Markers { start, .. } | FramingEncoding::FixedLength { start, .. } => {
                start
            }
        }
    }

    pub fn end_marker(&self) -> &[u8] {
        match self {
            FramingEncoding::Markers { end, .. } | FramingEncoding::FixedLength { end, .. } => end,
        }
    }

    pub fn set_start_marker(&mut self, marker: Vec<u8>) {
        match self {
            FramingEncoding::Markers { start, .. } | FramingEncoding::FixedLength { start, .. } => {
                *start = marker
            }
        }
    }

    /// Escape byte for marker framing, if stuffing is on.
    pub fn escape(&self) -> Option<u8> {
        match self {
            FramingEncoding::Markers { escape, .. } => escape.first().copied(),
            FramingEncoding::FixedLength { .. } => None,
        }
    }

    /// Wrap a frame body in this encoding's markers (transmit side).
    /// Unstuffed marker bodies may not contain either marker.
    pub fn encode(&self, body: &[u8]) -> Result<Vec<u8>, FrameError> {
        let start = self.start_marker();
        let end = self.end_marker();

        let wire_body = match self {
            FramingEncoding::Markers { .. } => match self.escape() {
                Some(escape) => stuff(body, escape, start.first(), end.first()),
                None => {
                    let start_inside = !start.is_empty() && find(body, start).is_some();
                    if start_inside || find(body, end).is_some() {
                        return Err(FrameError::MarkerInBody);
                    }
                    body.to_vec()
                }
            },
            FramingEncoding::FixedLength { length, .. } => {
                if body.len() != *length {
                    return Err(FrameError::BodyLength {
                        expected: *length,
                        actual: body.len(),
                    });
                }
                body.to_vec()
            }
        };

        let mut framed = Vec::with_capacity(start.len() + wire_body.len() + end.len());
        framed.extend_from_slice(start);
        framed.extend_from_slice(&wire_body);
        framed.extend_from_slice(end);
        Ok(framed)
    }
}

/// A complete frame cut from the stream
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Bytes between the markers (payload plus any checksum trailer)
    pub bytes: Vec<u8>,
    /// Position of this frame in the session, starting at 0
    pub index: u64,
    pub timestamp_us: u64,
}

/// Position of `needle` in `haystack`. An empty needle matches at 0.
fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn stuff(body: &[u8], escape: u8, start: Option<&u8>, end: Option<&u8>) -> Vec<u8> {
    let mut stuffed = Vec::with_capacity(body.len() + body.len() / 8);
    for &byte in body {
        if byte == escape || Some(&byte) == start || Some(&byte) == end {
            stuffed.push(escape);
            stuffed.push(byte ^ ESCAPE_XOR);
        } else {
            stuffed.push(byte);
        }
    }
    stuffed
}

/// Outcome of scanning the bytes after a start marker.
enum BodyScan {
    /// Unstuffed body, and the bytes consumed including the end marker
    Complete { body: Vec<u8>, consumed: usize },
    /// Another start marker begins at this offset
    Restart(usize),
    TooLong,
    Incomplete,
}

fn scan_marked_body(
    data: &[u8],
    start: &[u8],
    end: &[u8],
    escape: Option<u8>,
    max_len: usize,
) -> BodyScan {
    let mut body = Vec::new();
    let mut i = 0;
    while i < data.len() {
        let rest = &data[i..];
        // Every byte pushed so far has been ruled out as an end marker
        if rest.len() >= end.len() && body.len() > max_len {
            return BodyScan::TooLong;
        }
        if Some(data[i]) == escape {
            match data.get(i + 1) {
                Some(&byte) => {
                    body.push(byte ^ ESCAPE_XOR);
                    i += 2;
                    continue;
                }
                None => break,
            }
        }
        if rest.starts_with(end) {
            return BodyScan::Complete {
                body,
                consumed: i + end.len(),
            };
        }
        if !start.is_empty() && rest.starts_with(start) {
            return BodyScan::Restart(i);
        }
        body.push(data[i]);
        i += 1;
    }
    if body.len() > max_len + end.len().saturating_sub(1) {
        BodyScan::TooLong
    } else {
        BodyScan::Incomplete
    }
}

/// Length of the longest proper prefix of `marker` that ends `data`.
fn partial_marker_tail(data: &[u8], marker: &[u8]) -> usize {
    let longest = marker.len().saturating_sub(1).min(data.len());
    (1..=longest)
        .rev()
        .find(|&k| data.ends_with(&marker[..k]))
        .unwrap_or(0)
}

// =============================================================================
// Ingest buffer
// =============================================================================

/// Stateful frame extractor for streaming data.
/// Owned by the receive loop; nothing here is shared across threads.
pub struct SerialFramer {
    encoding: FramingEncoding,
    buffer: Vec<u8>,
    read_pos: usize,
    total_bytes: u64,
    discarded: usize,
    next_index: u64,
}

impl SerialFramer {
    pub fn new(encoding: FramingEncoding) -> Self {
        SerialFramer {
            encoding,
            buffer: Vec::with_capacity(1024),
            read_pos: 0,
            total_bytes: 0,
            discarded: 0,
            next_index: 0,
        }
    }

    pub fn encoding(&self) -> &FramingEncoding {
        &self.encoding
    }

    /// Append newly read bytes to the tail.
    pub fn append(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
        self.total_bytes += data.len() as u64;
    }

    /// Total bytes appended since this framer was created.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Bytes received but not yet consumed.
    pub fn pending(&self) -> usize {
        self.buffer.len() - self.read_pos
    }

    /// Allocated buffer length, including the consumed prefix not yet compacted.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Bytes discarded during resynchronisation since the last call.
    pub fn take_discarded(&mut self) -> usize {
        std::mem::take(&mut self.discarded)
    }

    /// Replace the start marker. Unconsumed bytes are scanned with the new one.
    pub fn set_start_marker(&mut self, marker: Vec<u8>) {
        self.encoding.set_start_marker(marker);
    }

    /// Cut the next complete frame from the read position.
    /// Returns `None` while the next frame is still pending; pending bytes stay
    /// in the buffer. Noise before a start marker is dropped and counted.
    pub fn try_extract_frame(&mut self) -> Option<Frame> {
        let frame = self.scan();
        self.compact();
        frame
    }

    fn scan(&mut self) -> Option<Frame> {
        loop {
            let start_len = self.encoding.start_marker().len();
            let window = &self.buffer[self.read_pos..];

            let offset = match find(window, self.encoding.start_marker()) {
                Some(offset) => offset,
                None => {
                    // Keep a tail that may be the first half of a split marker
                    let keep = partial_marker_tail(window, self.encoding.start_marker());
                    let noise = window.len() - keep;
                    self.discard(noise);
                    return None;
                }
            };
            self.discard(offset);

            let body_start = self.read_pos + start_len;
            let available = self.buffer.len() - body_start;

            match &self.encoding {
                FramingEncoding::Markers {
                    start,
                    end,
                    max_frame_length,
                    ..
                } => {
                    let scan = scan_marked_body(
                        &self.buffer[body_start..],
                        start,
                        end,
                        self.encoding.escape(),
                        *max_frame_length,
                    );
                    match scan {
                        BodyScan::Complete { body, consumed } => {
                            return Some(self.cut(body, body_start + consumed));
                        }
                        // Lost end marker: the frame so far is noise
                        BodyScan::Restart(offset) => self.discard(start_len + offset),
                        BodyScan::TooLong => self.abandon_start(),
                        BodyScan::Incomplete => return None,
                    }
                }
                FramingEncoding::FixedLength { length, end, .. } => {
                    let length = *length;
                    if available < length + end.len() {
                        return None;
                    }
                    let end_at = body_start + length;
                    let frame_end = end_at + end.len();
                    let matched = self.buffer[end_at..frame_end] == end[..];
                    if matched {
                        let body = self.buffer[body_start..end_at].to_vec();
                        return Some(self.cut(body, frame_end));
                    }
                    self.abandon_start();
                }
            }
        }
    }

    /// Treat the byte at the read position as noise and rescan after it.
    fn abandon_start(&mut self) {
        self.discard(1);
    }

    fn discard(&mut self, count: usize) {
        self.read_pos += count;
        self.discarded += count;
    }

    fn cut(&mut self, bytes: Vec<u8>, frame_end: usize) -> Frame {
        let frame = Frame {
            bytes,
            index: self.next_index,
            timestamp_us: now_us(),
        };
        self.next_index += 1;
        self.read_pos = frame_end;
        frame
    }

    fn compact(&mut self) {
        if self.read_pos == 0 {
            return;
        }
        if self.read_pos >= COMPACT_THRESHOLD || self.read_pos * 2 >= self.buffer.len() {
            self.buffer.drain(..self.read_pos);
            self.read_pos = 0;
        }
    }

    /// Drop whatever partial frame remains (link closing).
    /// The dropped bytes are counted as discarded and returned.
    pub fn flush(&mut self) -> usize {
        let partial = self.pending();
        self.discarded += partial;
        self.buffer.clear();
        self.read_pos = 0;
        partial
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stx_etx() -> SerialFramer {
        SerialFramer::new(FramingEncoding::default())
    }

    fn drain(framer: &mut SerialFramer) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        while let Some(frame) = framer.try_extract_frame() {
            frames.push(frame.bytes);
        }
        frames
    }

    #[test]
    fn test_stx_etx_scenario() {
        let mut framer = stx_etx();

        framer.append(&[STX, 0x01, 0x02, ETX]);
        assert_eq!(drain(&mut framer), vec![vec![0x01, 0x02]]);

        framer.append(&[STX, 0x03]);
        assert!(framer.try_extract_frame().is_none());
        assert_eq!(framer.pending(), 2);

        framer.append(&[0x04, ETX]);
        assert_eq!(drain(&mut framer), vec![vec![0x03, 0x04]]);

        assert!(framer.try_extract_frame().is_none());
        assert_eq!(framer.take_discarded(), 0);
        assert_eq!(framer.total_bytes(), 8);
    }

    #[test]
    fn test_split_markers_extracted_once_at_every_boundary() {
        let encoding = FramingEncoding::Markers {
            start: vec![0xAA, 0x55],
            end: vec![0x0D, 0x0A],
            max_frame_length: 64,
            escape: Vec::new(),
        };
        let stream: Vec<u8> = [
            &[0xAA, 0x55, 0x10, 0x20, 0x0D, 0x0A][..],
            &[0xAA, 0x55, 0x30, 0x0D, 0x0A][..],
        ]
        .concat();

        for split_a in 0..=stream.len() {
            for split_b in split_a..=stream.len() {
                let mut framer = SerialFramer::new(encoding.clone());
                let mut frames = Vec::new();
                for chunk in [&stream[..split_a], &stream[split_a..split_b], &stream[split_b..]] {
                    framer.append(chunk);
                    frames.extend(drain(&mut framer));
                }
                assert_eq!(
                    frames,
                    vec![vec![0x10, 0x20], vec![0x30]],
                    "splits at {} and {}",
                    split_a,
                    split_b
                );
                assert_eq!(framer.take_discarded(), 0);
                assert_eq!(framer.total_bytes(), stream.len() as u64);
            }
        }
    }

    #[test]
    fn test_frame_indices_increase() {
        let mut framer = stx_etx();
        framer.append(&[STX, 0x01, ETX, STX, 0x02, ETX, STX, 0x03, ETX]);
        let indices: Vec<u64> = std::iter::from_fn(|| framer.try_extract_frame())
            .map(|f| f.index)
            .collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn test_resync_discards_leading_noise() {
        let mut framer = stx_etx();
        framer.append(&[0xFF, 0xFE, 0x00, STX, 0x05, ETX]);

        assert_eq!(drain(&mut framer), vec![vec![0x05]]);
        assert_eq!(framer.take_discarded(), 3);
        assert_eq!(framer.take_discarded(), 0);
    }

    #[test]
    fn test_noise_without_marker_keeps_partial_start() {
        let mut framer = SerialFramer::new(FramingEncoding::Markers {
            start: vec![0xAA, 0x55],
            end: vec![0x0D],
            max_frame_length: 16,
            escape: vec![DLE],
        });
        framer.append(&[0x01, 0x02, 0xAA]);
        assert!(framer.try_extract_frame().is_none());
        assert_eq!(framer.take_discarded(), 2);
        assert_eq!(framer.pending(), 1);

        framer.append(&[0x55, 0x07, 0x0D]);
        assert_eq!(drain(&mut framer), vec![vec![0x07]]);
    }

    #[test]
    fn test_runaway_body_is_abandoned() {
        let mut framer = SerialFramer::new(FramingEncoding::Markers {
            start: vec![STX],
            end: vec![ETX],
            max_frame_length: 4,
            escape: vec![DLE],
        });
        // Start marker followed by more than max_frame_length bytes without ETX
        framer.append(&[STX, 0x30, 0x31, 0x32, 0x33, 0x34]);
        assert!(framer.try_extract_frame().is_none());
        assert_eq!(framer.take_discarded(), 6);

        framer.append(&[STX, 0x20, ETX]);
        assert_eq!(drain(&mut framer), vec![vec![0x20]]);
    }

    #[test]
    fn test_fixed_length_frames() {
        let mut framer = SerialFramer::new(FramingEncoding::FixedLength {
            start: vec![0xAA, 0x55],
            length: 3,
            end: Vec::new(),
        });
        framer.append(&[0xAA, 0x55, 0x01, 0x02]);
        assert!(framer.try_extract_frame().is_none());
        framer.append(&[0x03, 0xAA, 0x55, 0xAA, 0x55, 0x00]);
        // The second body may contain the start marker itself
        assert_eq!(
            drain(&mut framer),
            vec![vec![0x01, 0x02, 0x03], vec![0xAA, 0x55, 0x00]]
        );
    }

    #[test]
    fn test_fixed_length_bad_end_marker_resyncs() {
        let mut framer = SerialFramer::new(FramingEncoding::FixedLength {
            start: vec![STX],
            length: 2,
            end: vec![ETX],
        });
        // First frame has the wrong trailer byte
        framer.append(&[STX, 0x01, 0x02, 0xEE, STX, 0x03, 0x04, ETX]);
        assert_eq!(drain(&mut framer), vec![vec![0x03, 0x04]]);
        assert_eq!(framer.take_discarded(), 4);
    }

    #[test]
    fn test_line_framing_without_start_marker() {
        let mut framer = SerialFramer::new(FramingEncoding::Markers {
            start: Vec::new(),
            end: b"\r\n".to_vec(),
            max_frame_length: 64,
            escape: Vec::new(),
        });
        framer.append(b"1.5,2\r\n3,");
        assert_eq!(drain(&mut framer), vec![b"1.5,2".to_vec()]);
        framer.append(b"4\r\n");
        assert_eq!(drain(&mut framer), vec![b"3,4".to_vec()]);
    }

    #[test]
    fn test_buffer_is_compacted() {
        let mut framer = stx_etx();
        for i in 0..10_000u32 {
            framer.append(&[STX, (i % 200) as u8 + 0x20, ETX]);
            assert!(framer.try_extract_frame().is_some());
        }
        assert_eq!(framer.total_bytes(), 30_000);
        assert!(framer.buffered() < COMPACT_THRESHOLD);
    }

    #[test]
    fn test_set_start_marker_rescans_pending() {
        let mut framer = stx_etx();
        framer.append(&[0x7E, 0x09, ETX]);
        framer.set_start_marker(vec![0x7E]);
        assert_eq!(drain(&mut framer), vec![vec![0x09]]);
    }

    #[test]
    fn test_flush_drops_partial_frame() {
        let mut framer = stx_etx();
        framer.append(&[STX, 0x01, 0x02]);
        assert!(framer.try_extract_frame().is_none());
        assert_eq!(framer.flush(), 3);
        assert_eq!(framer.take_discarded(), 3);
        assert_eq!(framer.pending(), 0);
    }

    #[test]
    fn test_encode_roundtrip() {
        let encoding = FramingEncoding::default();
        let framed = encoding.encode(b"12,34").unwrap();
        assert_eq!(framed.first(), Some(&STX));
        assert_eq!(framed.last(), Some(&ETX));

        let mut framer = SerialFramer::new(encoding);
        framer.append(&framed);
        assert_eq!(drain(&mut framer), vec![b"12,34".to_vec()]);
    }

    #[test]
    fn test_encode_stuffs_marker_bytes() {
        let encoding = FramingEncoding::default();
        let framed = encoding.encode(&[0x01, ETX, DLE, STX]).unwrap();
        assert_eq!(
            framed,
            vec![STX, 0x01, DLE, ETX ^ 0x20, DLE, DLE ^ 0x20, DLE, STX ^ 0x20, ETX]
        );

        let mut framer = SerialFramer::new(encoding);
        framer.append(&framed);
        assert_eq!(drain(&mut framer), vec![vec![0x01, ETX, DLE, STX]]);
        assert_eq!(framer.take_discarded(), 0);
    }

    #[test]
    fn test_checksum_trailer_equal_to_end_marker() {
        use crate::checksums::{ChecksumAlgorithm, FrameCheck};

        // CRC-16/MODBUS of "285" is 0xD803, so the little-endian trailer starts with ETX
        let check = FrameCheck {
            algorithm: ChecksumAlgorithm::Crc16Modbus,
            big_endian: false,
        };
        let body = check.append_trailer(b"285");
        assert_eq!(&body[3..], &[ETX, 0xD8]);

        let encoding = FramingEncoding::default();
        let wire = encoding.encode(&body).unwrap();
        let mut framer = SerialFramer::new(encoding);
        for byte in &wire {
            framer.append(std::slice::from_ref(byte));
        }
        let frames = drain(&mut framer);
        assert_eq!(frames, vec![body]);
        assert_eq!(check.verify(&frames[0]).unwrap(), b"285");
        assert_eq!(framer.take_discarded(), 0);
    }

    #[test]
    fn test_split_escape_sequence() {
        let encoding = FramingEncoding::default();
        let wire = encoding.encode(&[0x41, ETX, 0x42]).unwrap();
        let escape_at = wire.iter().position(|&b| b == DLE).unwrap();

        let mut framer = SerialFramer::new(encoding);
        framer.append(&wire[..=escape_at]);
        assert!(framer.try_extract_frame().is_none());
        framer.append(&wire[escape_at + 1..]);
        assert_eq!(drain(&mut framer), vec![vec![0x41, ETX, 0x42]]);
    }

    #[test]
    fn test_lost_end_marker_resyncs_on_next_start() {
        let mut framer = stx_etx();
        framer.append(&[STX, b'1', b'2', STX, b'3', b'4', ETX]);

        assert_eq!(drain(&mut framer), vec![b"34".to_vec()]);
        assert_eq!(framer.take_discarded(), 3);
    }

    #[test]
    fn test_lost_end_marker_split_across_reads() {
        let mut framer = stx_etx();
        framer.append(&[STX, b'7', b'8']);
        assert!(framer.try_extract_frame().is_none());
        assert_eq!(framer.take_discarded(), 0);

        framer.append(&[STX, b'9', ETX, STX, b'5', ETX]);
        assert_eq!(drain(&mut framer), vec![b"9".to_vec(), b"5".to_vec()]);
        assert_eq!(framer.take_discarded(), 3);
    }

    #[test]
    fn test_encode_rejects_marker_in_unstuffed_body() {
        let encoding = FramingEncoding::Markers {
            start: vec![STX],
            end: vec![ETX],
            max_frame_length: 64,
            escape: Vec::new(),
        };
        assert_eq!(encoding.encode(&[0x01, ETX]), Err(FrameError::MarkerInBody));
        assert_eq!(encoding.encode(&[STX, 0x01]), Err(FrameError::MarkerInBody));
        assert_eq!(encoding.encode(&[DLE]).unwrap(), vec![STX, DLE, ETX]);

        let fixed = FramingEncoding::FixedLength {
            start: vec![0xAA],
            length: 2,
            end: Vec::new(),
        };
        assert_eq!(
            fixed.encode(&[0x01]),
            Err(FrameError::BodyLength {
                expected: 2,
                actual: 1
            })
        );
    }
}
