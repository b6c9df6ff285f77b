// src/lib.rs
//
// uartscope: serial-port monitor core. Reads a byte stream from a serial
// link, cuts it into frames, decodes numeric samples and feeds a live
// multi-series chart model, with a transmit path back to the device.
//
// Pipeline: ByteSource -> SerialFramer -> SampleDecoder -> sample channel
// -> ChartUpdater. The session controller owns the link state machine.

#[macro_use]
pub mod logging;

pub mod channel;
pub mod chart;
pub mod checksums;
pub mod decoder;
pub mod error;
pub mod io;
pub mod session;
pub mod settings;
pub mod transmit;

pub use channel::{sample_channel, Backpressure, SampleReceiver, SampleSender};
pub use chart::{AxisRange, ChartUpdater, ChartView, HoverPoint, Series, XAxis};
pub use checksums::{ChecksumAlgorithm, FrameCheck};
pub use decoder::{FieldType, PayloadLayout, Sample, SampleDecoder};
pub use error::{ConfigError, FrameError, LinkError, SessionError};
pub use io::serial::{Frame, FramingEncoding, SerialFramer};
pub use io::{ByteSource, EventReceiver, LinkOpener, LinkState, MockLink, ScopeEvent};
#[cfg(any(target_os = "windows", target_os = "macos", target_os = "linux"))]
pub use io::SerialPortOpener;
pub use session::ScopeSession;
pub use settings::{LinkConfig, ScopeSettings};
pub use transmit::{LineEnding, TransmitPath};
