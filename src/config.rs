//! Connection configuration

use crate::dos_heuristics::DEFAULT_MAX_SEQUENTIAL_EMPTY_DATA_FRAMES;
use crate::error::{Error, Result};
use crate::settings::{Settings, SettingsBuilder, SettingsParameter};

/// Default cap on peer-initiated concurrent streams advertised at startup
pub const DEFAULT_MAX_CONCURRENT_STREAMS: u32 = 100;

/// Default SETTINGS_MAX_HEADER_LIST_SIZE advertised at startup
pub const DEFAULT_MAX_HEADER_LIST_SIZE: u32 = 1 << 14;

/// Default outbound control-frame buffer limit
pub const DEFAULT_MAX_BUFFERED_OUTBOUND_CONTROL_FRAMES: usize = 10_000;

/// Options for one connection
///
/// `max_buffered_outbound_control_frames` is enforced by the layer that owns
/// the write buffer; it is carried here so both layers share one source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    initial_settings: Settings,
    header_block_validation: bool,
    content_length_validation: bool,
    max_sequential_empty_data_frames: usize,
    max_buffered_outbound_control_frames: usize,
}

impl ConnectionConfig {
    pub fn builder() -> ConnectionConfigBuilder {
        ConnectionConfigBuilder::new()
    }

    /// SETTINGS sent with the connection preface
    pub fn initial_settings(&self) -> &Settings {
        &self.initial_settings
    }

    pub fn header_block_validation(&self) -> bool {
        self.header_block_validation
    }

    pub fn content_length_validation(&self) -> bool {
        self.content_length_validation
    }

    pub fn max_sequential_empty_data_frames(&self) -> usize {
        self.max_sequential_empty_data_frames
    }

    pub fn max_buffered_outbound_control_frames(&self) -> usize {
        self.max_buffered_outbound_control_frames
    }

    /// Header-list limit the decoder applies until our SETTINGS are acknowledged
    pub fn max_header_list_size(&self) -> usize {
        self.initial_settings
            .get(SettingsParameter::MaxHeaderListSize)
            .unwrap_or(DEFAULT_MAX_HEADER_LIST_SIZE) as usize
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            initial_settings: default_initial_settings(),
            header_block_validation: true,
            content_length_validation: true,
            max_sequential_empty_data_frames: DEFAULT_MAX_SEQUENTIAL_EMPTY_DATA_FRAMES,
            max_buffered_outbound_control_frames: DEFAULT_MAX_BUFFERED_OUTBOUND_CONTROL_FRAMES,
        }
    }
}

fn default_initial_settings() -> Settings {
    let mut settings = Settings::new();
    settings.push(SettingsParameter::MaxConcurrentStreams, DEFAULT_MAX_CONCURRENT_STREAMS);
    settings.push(SettingsParameter::MaxHeaderListSize, DEFAULT_MAX_HEADER_LIST_SIZE);
    settings
}

/// Builder for [`ConnectionConfig`]
#[derive(Debug, Default)]
pub struct ConnectionConfigBuilder {
    config: ConnectionConfig,
}

impl ConnectionConfigBuilder {
    /// Create a builder with default options
    pub fn new() -> Self {
        ConnectionConfigBuilder::default()
    }

    /// Replace the initial SETTINGS
    pub fn initial_settings(mut self, settings: Settings) -> Self {
        self.config.initial_settings = settings;
        self
    }

    /// Replace the initial SETTINGS from a settings builder
    pub fn settings(self, settings: SettingsBuilder) -> Result<Self> {
        Ok(self.initial_settings(settings.build()?))
    }

    /// Validate pseudo-headers and forbidden fields on every header block
    pub fn header_block_validation(mut self, enabled: bool) -> Self {
        self.config.header_block_validation = enabled;
        self
    }

    /// Cross-check DATA against `content-length`
    pub fn content_length_validation(mut self, enabled: bool) -> Self {
        self.config.content_length_validation = enabled;
        self
    }

    /// Consecutive empty DATA frames tolerated before ENHANCE_YOUR_CALM
    pub fn max_sequential_empty_data_frames(mut self, max: usize) -> Self {
        self.config.max_sequential_empty_data_frames = max;
        self
    }

    pub fn max_buffered_outbound_control_frames(mut self, max: usize) -> Self {
        self.config.max_buffered_outbound_control_frames = max;
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<ConnectionConfig> {
        self.config.initial_settings.validate()?;
        if self.config.max_buffered_outbound_control_frames == 0 {
            return Err(Error::InvalidConfig(
                "max_buffered_outbound_control_frames must be non-zero".into(),
            ));
        }
        Ok(self.config)
    }
}
