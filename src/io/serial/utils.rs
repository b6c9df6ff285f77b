// src/io/serial/utils.rs
//
// Conversions from link settings to serialport crate types.
// Values outside what a UART supports are rejected so the open fails with a
// clear reason instead of silently using a default.

use serialport::{DataBits, FlowControl as SpFlowControl, Parity as SpParity, StopBits};

use crate::settings::{FlowControl, Parity};

// ============================================================================
// Conversion Functions
// ============================================================================

/// Convert our Parity enum to serialport crate's Parity type
pub fn to_serialport_parity(p: Parity) -> SpParity {
    match p {
        Parity::None => SpParity::None,
        Parity::Odd => SpParity::Odd,
        Parity::Even => SpParity::Even,
    }
}

pub fn to_serialport_flow_control(flow: FlowControl) -> SpFlowControl {
    match flow {
        FlowControl::None => SpFlowControl::None,
        FlowControl::Software => SpFlowControl::Software,
        FlowControl::Hardware => SpFlowControl::Hardware,
    }
}

/// Convert data bits count (5-8) to serialport crate's DataBits type
pub fn to_serialport_data_bits(bits: u8) -> Result<DataBits, String> {
    match bits {
        5 => Ok(DataBits::Five),
        6 => Ok(DataBits::Six),
        7 => Ok(DataBits::Seven),
        8 => Ok(DataBits::Eight),
        other => Err(format!("unsupported data bits: {}", other)),
    }
}

/// Convert stop bits count (1 or 2) to serialport crate's StopBits type
pub fn to_serialport_stop_bits(bits: u8) -> Result<StopBits, String> {
    match bits {
        1 => Ok(StopBits::One),
        2 => Ok(StopBits::Two),
        other => Err(format!("unsupported stop bits: {}", other)),
    }
}

// ============================================================================
// Tests
// ============================================================================
