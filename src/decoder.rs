// src/decoder.rs
//
// Turns frame bodies into numeric samples. A frame decodes completely or not
// at all; sequence numbers are only consumed by frames that decode.

use serde::{Deserialize, Serialize};

use crate::checksums::FrameCheck;
use crate::error::FrameError;
use crate::io::serial::framer::Frame;
use crate::settings::DecoderSettings;

// ============================================================================
// Payload layouts
// ============================================================================

/// Binary field type. Every field in a binary payload has the same type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    F32,
    F64,
}

impl FieldType {
    pub fn width(&self) -> usize {
        match self {
            FieldType::U8 | FieldType::I8 => 1,
            FieldType::U16 | FieldType::I16 => 2,
            FieldType::U32 | FieldType::I32 | FieldType::F32 => 4,
            FieldType::F64 => 8,
        }
    }

    /// Read one field. `bytes` is exactly `width()` long.
    fn read(&self, bytes: &[u8], big_endian: bool) -> f64 {
        macro_rules! num {
            ($t:ty, $n:expr) => {{
                let mut raw = [0u8; $n];
                raw.copy_from_slice(bytes);
                if big_endian {
                    <$t>::from_be_bytes(raw) as f64
                } else {
                    <$t>::from_le_bytes(raw) as f64
                }
            }};
        }
        match self {
            FieldType::U8 => bytes[0] as f64,
            FieldType::I8 => bytes[0] as i8 as f64,
            FieldType::U16 => num!(u16, 2),
            FieldType::I16 => num!(i16, 2),
            FieldType::U32 => num!(u32, 4),
            FieldType::I32 => num!(i32, 4),
            FieldType::F32 => num!(f32, 4),
            FieldType::F64 => num!(f64, 8),
        }
    }
}

/// How a payload maps to field values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PayloadLayout {
    Binary {
        field: FieldType,
        #[serde(default)]
        big_endian: bool,
    },
    /// UTF-8 numbers split on any of the separator characters
    Text {
        #[serde(default = "default_separators")]
        separators: String,
    },
}

fn default_separators() -> String {
    ",; \t".to_string()
}

impl Default for PayloadLayout {
    fn default() -> Self {
        PayloadLayout::Text {
            separators: default_separators(),
        }
    }
}

impl PayloadLayout {
    /// Parse every field of `payload`. The error is a human-readable reason.
    fn parse(&self, payload: &[u8]) -> Result<Vec<f64>, String> {
        match self {
            PayloadLayout::Binary { field, big_endian } => {
                let width = field.width();
                if payload.len() % width != 0 {
                    return Err(format!(
                        "payload length {} is not a multiple of {}",
                        payload.len(),
                        width
                    ));
                }
                let values: Vec<f64> = payload
                    .chunks_exact(width)
                    .map(|chunk| field.read(chunk, *big_endian))
                    .collect();
                if let Some(pos) = values.iter().position(|v| !v.is_finite()) {
                    return Err(format!("field {} is not a finite number", pos));
                }
                Ok(values)
            }
            PayloadLayout::Text { separators } => {
                let text = std::str::from_utf8(payload)
                    .map_err(|e| format!("payload is not UTF-8: {}", e))?;
                text.trim()
                    .split(|c: char| separators.contains(c))
                    .filter(|token| !token.is_empty())
                    .map(|token| match token.parse::<f64>() {
                        Ok(v) if v.is_finite() => Ok(v),
                        Ok(_) => Err(format!("'{}' is not a finite number", token)),
                        Err(_) => Err(format!("'{}' is not a number", token)),
                    })
                    .collect()
            }
        }
    }
}

// ============================================================================
// Samples
// ============================================================================

/// One numeric value for one channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Sample {
    pub channel: usize,
    pub value: f64,
    /// Session-wide sequence number, strictly increasing
    pub seq: u64,
    /// Index of the frame this sample came from
    pub frame: u64,
    pub timestamp_us: u64,
}

/// Frame body decoder. Owned by the receive loop.
pub struct SampleDecoder {
    layout: PayloadLayout,
    channel_map: Vec<usize>,
    min_fields: usize,
    frame_check: FrameCheck,
    check_enabled: bool,
    next_seq: u64,
}

impl SampleDecoder {
    pub fn new(settings: &DecoderSettings) -> Self {
        SampleDecoder {
            layout: settings.layout.clone(),
            channel_map: settings.channel_map.clone(),
            min_fields: settings.min_fields,
            frame_check: settings.frame_check,
            check_enabled: settings.frame_check_enabled,
            next_seq: 0,
        }
    }

    pub fn set_frame_check(&mut self, enabled: bool) {
        self.check_enabled = enabled;
    }

    pub fn frame_check_enabled(&self) -> bool {
        self.check_enabled
    }

    fn channel_for(&self, field: usize) -> Option<usize> {
        if self.channel_map.is_empty() {
            Some(field)
        } else {
            self.channel_map.get(field).copied()
        }
    }

    /// Decode a frame into samples, or reject it whole.
    pub fn decode(&mut self, frame: &Frame) -> Result<Vec<Sample>, FrameError> {
        let payload = if self.check_enabled {
            self.frame_check.verify(&frame.bytes)?
        } else {
            &frame.bytes[..]
        };

        let values = self.layout.parse(payload).map_err(|reason| FrameError::Decode {
            raw: frame.bytes.clone(),
            reason,
        })?;

        if values.len() < self.min_fields {
            return Err(FrameError::Decode {
                raw: frame.bytes.clone(),
                reason: format!(
                    "expected at least {} fields, found {}",
                    self.min_fields,
                    values.len()
                ),
            });
        }

        let mut samples = Vec::with_capacity(values.len());
        for (field, value) in values.into_iter().enumerate() {
            let Some(channel) = self.channel_for(field) else {
                continue;
            };
            samples.push(Sample {
                channel,
                value,
                seq: self.next_seq,
                frame: frame.index,
                timestamp_us: frame.timestamp_us,
            });
            self.next_seq += 1;
        }
        Ok(samples)
    }
}
