// src/checksums.rs
//
// Checksum algorithms for the optional frame check.
// A checked frame body is `payload ++ trailer`, where the trailer is the
// checksum of the payload in 1 or 2 bytes.

use serde::{Deserialize, Serialize};

use crate::error::FrameError;

// ============================================================================
// Types
// ============================================================================

/// Supported checksum algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumAlgorithm {
    /// XOR of all bytes
    Xor,
    /// sum(bytes) & 0xFF
    Sum8,
    /// CRC-8 polynomial 0x07 (ITU/SMBUS)
    Crc8,
    /// CRC-8 Maxim polynomial 0x31, reflected (1-Wire devices)
    Crc8Maxim,
    /// CRC-16 Modbus polynomial 0x8005, reflected, init 0xFFFF
    Crc16Modbus,
    /// CRC-16 CCITT-FALSE polynomial 0x1021, init 0xFFFF
    Crc16Ccitt,
}

impl Default for ChecksumAlgorithm {
    fn default() -> Self {
        ChecksumAlgorithm::Crc16Modbus
    }
}

impl ChecksumAlgorithm {
    /// Trailer size in bytes for this algorithm.
    pub fn width(&self) -> usize {
        match self {
            ChecksumAlgorithm::Xor
            | ChecksumAlgorithm::Sum8
            | ChecksumAlgorithm::Crc8
            | ChecksumAlgorithm::Crc8Maxim => 1,
            ChecksumAlgorithm::Crc16Modbus | ChecksumAlgorithm::Crc16Ccitt => 2,
        }
    }

    /// Calculate the checksum of `data`. 8-bit results occupy the low byte.
    pub fn calculate(&self, data: &[u8]) -> u16 {
        match self {
            ChecksumAlgorithm::Xor => xor_checksum(data) as u16,
            ChecksumAlgorithm::Sum8 => sum8_checksum(data) as u16,
            ChecksumAlgorithm::Crc8 => crc8_checksum(data) as u16,
            ChecksumAlgorithm::Crc8Maxim => crc8_maxim_checksum(data) as u16,
            ChecksumAlgorithm::Crc16Modbus => crc16_modbus_checksum(data),
            ChecksumAlgorithm::Crc16Ccitt => crc16_ccitt_checksum(data),
        }
    }
}

/// Trailer layout used when the frame check is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameCheck {
    pub algorithm: ChecksumAlgorithm,
    /// Byte order of 2-byte trailers
    pub big_endian: bool,
}

impl Default for FrameCheck {
    fn default() -> Self {
        // Modbus convention: CRC low byte first
        FrameCheck {
            algorithm: ChecksumAlgorithm::Crc16Modbus,
            big_endian: false,
        }
    }
}

impl FrameCheck {
    /// Append the checksum trailer of `payload`.
    pub fn append_trailer(&self, payload: &[u8]) -> Vec<u8> {
        let value = self.algorithm.calculate(payload);
        let mut body = Vec::with_capacity(payload.len() + self.algorithm.width());
        body.extend_from_slice(payload);
        match self.algorithm.width() {
            1 => body.push(value as u8),
            _ if self.big_endian => body.extend_from_slice(&value.to_be_bytes()),
            _ => body.extend_from_slice(&value.to_le_bytes()),
        }
        body
    }

    /// Verify the trailer of a frame body and return the payload without it.
    pub fn verify<'a>(&self, body: &'a [u8]) -> Result<&'a [u8], FrameError> {
        let width = self.algorithm.width();
        if body.len() < width {
            return Err(FrameError::ChecksumMismatch {
                raw: body.to_vec(),
                expected: 0,
                actual: 0,
            });
        }

        let (payload, trailer) = body.split_at(body.len() - width);
        let received = match trailer {
            [b] => *b as u16,
            [a, b] if self.big_endian => u16::from_be_bytes([*a, *b]),
            [a, b] => u16::from_le_bytes([*a, *b]),
            _ => unreachable!("checksum trailers are 1 or 2 bytes"),
        };
        let calculated = self.algorithm.calculate(payload);

        if received == calculated {
            Ok(payload)
        } else {
            Err(FrameError::ChecksumMismatch {
                raw: body.to_vec(),
                expected: calculated,
                actual: received,
            })
        }
    }
}

// ============================================================================
// Algorithms
// ============================================================================

/// XOR of all bytes.
pub fn xor_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0, |acc, &b| acc ^ b)
}

/// Modulo-256 sum of all bytes.
pub fn sum8_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// MSB-first CRC-8.
fn crc8_msb(data: &[u8], polynomial: u8, init: u8) -> u8 {
    let mut crc = init;
    for &byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ polynomial
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// LSB-first CRC-8; `polynomial` is given in its reflected form.
fn crc8_lsb(data: &[u8], polynomial: u8, init: u8) -> u8 {
    let mut crc = init;
    for &byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x01 != 0 {
                (crc >> 1) ^ polynomial
            } else {
                crc >> 1
            };
        }
    }
    crc
}

/// MSB-first CRC-16.
fn crc16_msb(data: &[u8], polynomial: u16, init: u16) -> u16 {
    let mut crc = init;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ polynomial
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// LSB-first CRC-16; `polynomial` is given in its reflected form.
fn crc16_lsb(data: &[u8], polynomial: u16, init: u16) -> u16 {
    let mut crc = init;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            crc = if crc & 0x0001 != 0 {
                (crc >> 1) ^ polynomial
            } else {
                crc >> 1
            };
        }
    }
    crc
}

/// CRC-8 with polynomial 0x07, init 0x00.
pub fn crc8_checksum(data: &[u8]) -> u8 {
    crc8_msb(data, 0x07, 0x00)
}

/// CRC-8 Maxim (0x31 reflected = 0x8C), init 0x00.
pub fn crc8_maxim_checksum(data: &[u8]) -> u8 {
    crc8_lsb(data, 0x8C, 0x00)
}

/// CRC-16 Modbus (0x8005 reflected = 0xA001), init 0xFFFF.
pub fn crc16_modbus_checksum(data: &[u8]) -> u16 {
    crc16_lsb(data, 0xA001, 0xFFFF)
}

/// CRC-16 CCITT-FALSE (0x1021), init 0xFFFF.
pub fn crc16_ccitt_checksum(data: &[u8]) -> u16 {
    crc16_msb(data, 0x1021, 0xFFFF)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const CHECK: &[u8] = b"123456789";

    #[test]
    fn test_xor_checksum() {
        assert_eq!(xor_checksum(&[0x01, 0x02, 0x03, 0x04, 0x05]), 0x01);
        assert_eq!(xor_checksum(&[0xAA, 0x55]), 0xFF);
        assert_eq!(xor_checksum(&[]), 0);
    }

    #[test]
    fn test_sum8_checksum_wrapping() {
        assert_eq!(sum8_checksum(&[0x01, 0x02, 0x03]), 0x06);
        assert_eq!(sum8_checksum(&[0xFF, 0x02]), 0x01);
    }

    #[test]
    fn test_crc_check_values() {
        assert_eq!(crc8_checksum(CHECK), 0xF4);
        assert_eq!(crc8_maxim_checksum(CHECK), 0xA1);
        assert_eq!(crc16_modbus_checksum(CHECK), 0x4B37);
        assert_eq!(crc16_ccitt_checksum(CHECK), 0x29B1);
    }

    #[test]
    fn test_crc16_modbus_request_vector() {
        // Read holding registers request, wire order C5 CD
        let data = [0x01, 0x03, 0x00, 0x00, 0x00, 0x0A];
        assert_eq!(crc16_modbus_checksum(&data), 0xCDC5);
    }

    #[test]
    fn test_calculate_all_algorithms() {
        let data = [0x01, 0x02, 0x03];
        assert_eq!(ChecksumAlgorithm::Xor.calculate(&data), 0x00);
        assert_eq!(ChecksumAlgorithm::Sum8.calculate(&data), 0x06);
        assert_eq!(ChecksumAlgorithm::Crc8.calculate(&data), 0x48);
        assert_eq!(ChecksumAlgorithm::Crc16Modbus.calculate(&data), 0x6161);
        assert_eq!(ChecksumAlgorithm::Crc16Ccitt.calculate(&data), 0xADAD);
    }

    #[test]
    fn test_trailer_little_endian() {
        let check = FrameCheck::default();
        let body = check.append_trailer(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x0A]);
        assert_eq!(&body[6..], &[0xC5, 0xCD]);
        assert_eq!(check.verify(&body).unwrap(), &[0x01, 0x03, 0x00, 0x00, 0x00, 0x0A]);
    }

    #[test]
    fn test_trailer_big_endian() {
        let check = FrameCheck {
            algorithm: ChecksumAlgorithm::Crc16Ccitt,
            big_endian: true,
        };
        let body = check.append_trailer(CHECK);
        assert_eq!(&body[9..], &[0x29, 0xB1]);
        assert!(check.verify(&body).is_ok());
    }

    #[test]
    fn test_verify_reports_mismatch() {
        let check = FrameCheck {
            algorithm: ChecksumAlgorithm::Sum8,
            big_endian: false,
        };
        let err = check.verify(&[0x01, 0x02, 0x03, 0x07]).unwrap_err();
        assert_eq!(
            err,
            FrameError::ChecksumMismatch {
                raw: vec![0x01, 0x02, 0x03, 0x07],
                expected: 0x06,
                actual: 0x07,
            }
        );
    }

    #[test]
    fn test_verify_rejects_short_body() {
        let check = FrameCheck::default();
        assert!(matches!(
            check.verify(&[0x01]),
            Err(FrameError::ChecksumMismatch { .. })
        ));
    }
}
