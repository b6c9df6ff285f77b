// src/settings.rs
//
// Scope settings: link parameters, framing, decoding, channel, chart and
// transmit options. Stored as TOML; every field has a default so partial
// files are accepted.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::chart::XAxis;
use crate::channel::Backpressure;
use crate::checksums::FrameCheck;
use crate::decoder::PayloadLayout;
use crate::error::ConfigError;
use crate::io::serial::framer::FramingEncoding;
use crate::transmit::LineEnding;

const SETTINGS_DIR: &str = "uartscope";
const SETTINGS_FILE: &str = "settings.toml";

// ============================================================================
// Link
// ============================================================================

/// Parity setting for serial port configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    None,
    Odd,
    Even,
}

impl Default for Parity {
    fn default() -> Self {
        Parity::None
    }
}

impl Parity {
    /// Single-letter form used in "8N1" style summaries.
    pub fn letter(&self) -> char {
        match self {
            Parity::None => 'N',
            Parity::Odd => 'O',
            Parity::Even => 'E',
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowControl {
    None,
    Software,
    Hardware,
}

impl Default for FlowControl {
    fn default() -> Self {
        FlowControl::None
    }
}

/// Serial link parameters. Captured by value when the link opens.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LinkConfig {
    #[serde(default)]
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default)]
    pub parity: Parity,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default)]
    pub flow_control: FlowControl,
    /// Read poll interval of the receive loop
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

fn default_baud_rate() -> u32 {
    115_200
}
fn default_data_bits() -> u8 {
    8
}
fn default_stop_bits() -> u8 {
    1
}
fn default_read_timeout_ms() -> u64 {
    10
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            port: String::new(),
            baud_rate: default_baud_rate(),
            data_bits: default_data_bits(),
            parity: Parity::default(),
            stop_bits: default_stop_bits(),
            flow_control: FlowControl::default(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

impl LinkConfig {
    pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
        LinkConfig {
            port: port.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// "115200 8N1" style summary for logs.
    pub fn summary(&self) -> String {
        format!(
            "{} {}{}{}",
            self.baud_rate,
            self.data_bits,
            self.parity.letter(),
            self.stop_bits
        )
    }
}

// ============================================================================
// Pipeline sections
// ============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DecoderSettings {
    /// Channel index per payload field; empty = field position
    #[serde(default)]
    pub channel_map: Vec<usize>,
    /// Frames decoding to fewer fields are rejected
    #[serde(default = "default_min_fields")]
    pub min_fields: usize,
    /// Initial state of the frame check toggle
    #[serde(default)]
    pub frame_check_enabled: bool,
    #[serde(default)]
    pub layout: PayloadLayout,
    #[serde(default)]
    pub frame_check: FrameCheck,
}

fn default_min_fields() -> usize {
    1
}

impl Default for DecoderSettings {
    fn default() -> Self {
        DecoderSettings {
            channel_map: Vec::new(),
            min_fields: default_min_fields(),
            frame_check_enabled: false,
            layout: PayloadLayout::default(),
            frame_check: FrameCheck::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelSettings {
    #[serde(default = "default_channel_capacity")]
    pub capacity: usize,
    #[serde(default)]
    pub backpressure: Backpressure,
}

fn default_channel_capacity() -> usize {
    4096
}

impl Default for ChannelSettings {
    fn default() -> Self {
        ChannelSettings {
            capacity: default_channel_capacity(),
            backpressure: Backpressure::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChartSettings {
    /// Points retained per series
    #[serde(default = "default_max_points")]
    pub max_points: usize,
    /// Samples drained per UI tick
    #[serde(default = "default_max_per_tick")]
    pub max_per_tick: usize,
    #[serde(default = "default_auto_scale")]
    pub auto_scale: bool,
    #[serde(default)]
    pub x_axis: XAxis,
    /// Channel groups, one per chart. Empty = one chart with every channel.
    #[serde(default)]
    pub charts: Vec<Vec<usize>>,
}

fn default_max_points() -> usize {
    1000
}
fn default_max_per_tick() -> usize {
    2048
}
fn default_auto_scale() -> bool {
    true
}

impl Default for ChartSettings {
    fn default() -> Self {
        ChartSettings {
            max_points: default_max_points(),
            max_per_tick: default_max_per_tick(),
            auto_scale: default_auto_scale(),
            x_axis: XAxis::default(),
            charts: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TransmitSettings {
    /// Wrap outgoing messages in the receive framing (markers + checksum)
    #[serde(default)]
    pub frame_messages: bool,
    /// Appended to unframed messages
    #[serde(default)]
    pub line_ending: LineEnding,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Upper bound on waiting for the chart to drain while closing
    #[serde(default = "default_close_drain_timeout_ms")]
    pub close_drain_timeout_ms: u64,
    /// Minimum spacing of bytes-received events
    #[serde(default = "default_bytes_event_interval_ms")]
    pub bytes_event_interval_ms: u64,
    /// Pending transmit requests before send() reports a full queue
    #[serde(default = "default_transmit_queue")]
    pub transmit_queue: usize,
}

fn default_close_drain_timeout_ms() -> u64 {
    2000
}
fn default_bytes_event_interval_ms() -> u64 {
    25 // ~40 Hz
}
fn default_transmit_queue() -> usize {
    32
}

impl Default for SessionSettings {
    fn default() -> Self {
        SessionSettings {
            close_drain_timeout_ms: default_close_drain_timeout_ms(),
            bytes_event_interval_ms: default_bytes_event_interval_ms(),
            transmit_queue: default_transmit_queue(),
        }
    }
}

// ============================================================================
// Top level
// ============================================================================

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScopeSettings {
    #[serde(default)]
    pub link: LinkConfig,
    #[serde(default)]
    pub framing: FramingEncoding,
    #[serde(default)]
    pub decoder: DecoderSettings,
    #[serde(default)]
    pub channel: ChannelSettings,
    #[serde(default)]
    pub chart: ChartSettings,
    #[serde(default)]
    pub transmit: TransmitSettings,
    #[serde(default)]
    pub session: SessionSettings,
}

impl ScopeSettings {
    /// Reject combinations the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match &self.framing {
            FramingEncoding::Markers {
                start,
                end,
                max_frame_length,
                escape,
            } => {
                if end.is_empty() {
                    return Err(ConfigError::Invalid(
                        "marker framing needs a non-empty end marker".to_string(),
                    ));
                }
                if escape.len() > 1 {
                    return Err(ConfigError::Invalid(
                        "escape must be a single byte or empty".to_string(),
                    ));
                }
                if let Some(byte) = escape.first() {
                    if start.first() == Some(byte) || end.first() == Some(byte) {
                        return Err(ConfigError::Invalid(format!(
                            "escape {:02X} must differ from the first byte of each marker",
                            byte
                        )));
                    }
                }
                if *max_frame_length == 0 {
                    return Err(ConfigError::Invalid(
                        "max_frame_length must be greater than zero".to_string(),
                    ));
                }
            }
            FramingEncoding::FixedLength { start, length, .. } => {
                if start.is_empty() {
                    return Err(ConfigError::Invalid(
                        "fixed-length framing needs a start marker".to_string(),
                    ));
                }
                if *length == 0 {
                    return Err(ConfigError::Invalid(
                        "fixed-length framing needs a length greater than zero".to_string(),
                    ));
                }
            }
        }

        if let PayloadLayout::Text { separators } = &self.decoder.layout {
            if separators.is_empty() {
                return Err(ConfigError::Invalid(
                    "text layout needs at least one separator".to_string(),
                ));
            }
        }
        if self.channel.capacity == 0 {
            return Err(ConfigError::Invalid("channel capacity must be greater than zero".to_string()));
        }
        if self.chart.max_points == 0 || self.chart.max_per_tick == 0 {
            return Err(ConfigError::Invalid(
                "chart max_points and max_per_tick must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parse a hex marker such as "02", "AA55" or "0d0a".
pub fn parse_marker(value: &str) -> Result<Vec<u8>, ConfigError> {
    let trimmed: String = value.chars().filter(|c| !c.is_whitespace()).collect();
    hex::decode(&trimmed).map_err(|source| ConfigError::InvalidMarker {
        value: value.to_string(),
        source,
    })
}

/// `<config dir>/uartscope/settings.toml`, if the platform has a config dir.
pub fn default_settings_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(SETTINGS_DIR).join(SETTINGS_FILE))
}

/// Load settings from `path`. A missing file yields the defaults.
pub fn load_settings(path: &Path) -> Result<ScopeSettings, ConfigError> {
    if !path.exists() {
        tlog!("[settings] {} not found, using defaults", path.display());
        return Ok(ScopeSettings::default());
    }

    let contents = std::fs::read_to_string(path)?;
    let settings: ScopeSettings = toml::from_str(&contents)?;
    settings.validate()?;
    Ok(settings)
}

pub fn save_settings(path: &Path, settings: &ScopeSettings) -> Result<(), ConfigError> {
    settings.validate()?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let contents = toml::to_string_pretty(settings)?;
    std::fs::write(path, contents)?;
    Ok(())
}
