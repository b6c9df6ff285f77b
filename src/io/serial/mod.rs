// src/io/serial/mod.rs
//
// Serial receive path: framing of the raw byte stream, the blocking receive
// worker, and the serialport-backed byte source.

pub mod framer;
#[cfg(any(target_os = "windows", target_os = "macos", target_os = "linux"))]
mod port;
pub mod reader;
#[cfg(any(target_os = "windows", target_os = "macos", target_os = "linux"))]
pub(crate) mod utils;

pub use framer::{Frame, FramingEncoding, SerialFramer};
#[cfg(any(target_os = "windows", target_os = "macos", target_os = "linux"))]
pub use port::SerialPortOpener;
pub use reader::{run_receive_loop, ReceiverContext, ReceiverExit};
