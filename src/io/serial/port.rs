// src/io/serial/port.rs
//
// Byte source backed by a real serial port (serialport crate).

use std::io::{Read, Write};
use std::time::Duration;

use serialport::SerialPort;

use super::utils::{
    to_serialport_data_bits, to_serialport_flow_control, to_serialport_parity,
    to_serialport_stop_bits,
};
use crate::error::LinkError;
use crate::io::{ByteSource, LinkOpener};
use crate::settings::LinkConfig;

/// Opens system serial ports.
#[derive(Clone, Copy, Debug, Default)]
pub struct SerialPortOpener;

impl LinkOpener for SerialPortOpener {
    fn open(&self, config: &LinkConfig) -> Result<Box<dyn ByteSource>, LinkError> {
        let open_error = |reason: String| LinkError::Open {
            port: config.port.clone(),
            reason,
        };

        if config.port.is_empty() {
            return Err(open_error("no port selected".to_string()));
        }
        let data_bits = to_serialport_data_bits(config.data_bits).map_err(open_error)?;
        let stop_bits = to_serialport_stop_bits(config.stop_bits).map_err(open_error)?;

        // Short read timeout keeps the worker responsive to cancel and transmit
        let port = serialport::new(&config.port, config.baud_rate)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(to_serialport_parity(config.parity))
            .flow_control(to_serialport_flow_control(config.flow_control))
            .timeout(Duration::from_millis(config.read_timeout_ms.max(1)))
            .open()
            .map_err(|e| open_error(e.to_string()))?;

        tlog!(
            "[serial] Opened {} at {}",
            config.port,
            config.summary()
        );

        Ok(Box::new(SerialPortSource {
            port: Some(port),
            name: config.port.clone(),
        }))
    }
}

struct SerialPortSource {
    port: Option<Box<dyn SerialPort>>,
    name: String,
}

impl ByteSource for SerialPortSource {
    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize, LinkError> {
        let port = self.port.as_mut().ok_or(LinkError::NotOpen)?;
        match port.read(buf) {
            // EOF on a serial port means the device went away
            Ok(0) => Err(LinkError::Disconnected),
            Ok(n) => Ok(n),
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => Ok(0),
            Err(e) => Err(LinkError::Io(e.to_string())),
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<(), LinkError> {
        let port = self.port.as_mut().ok_or(LinkError::NotOpen)?;
        port.write_all(data)
            .and_then(|_| port.flush())
            .map_err(|e| LinkError::Io(format!("Serial write error: {}", e)))
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            tlog!("[serial] Closed {}", self.name);
        }
    }
}
