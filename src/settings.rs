//! HTTP/2 settings management
//!
//! This module implements HTTP/2 SETTINGS parameters as defined in RFC 7540
//! Section 6.5, and the [`SettingsLedger`] that tracks the values in effect for
//! one direction of a connection.

use crate::error::{Error, Result};
use crate::{
    DEFAULT_HEADER_TABLE_SIZE, DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_FRAME_SIZE,
    MAX_ALLOWED_MAX_FRAME_SIZE, MAX_WINDOW_SIZE,
};
use std::collections::VecDeque;
use std::fmt;

/// HTTP/2 settings parameters (RFC 7540 Section 6.5.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingsParameter {
    /// SETTINGS_HEADER_TABLE_SIZE (0x1)
    /// Allows the sender to inform the remote endpoint of the maximum size
    /// of the header compression table
    HeaderTableSize,

    /// SETTINGS_ENABLE_PUSH (0x2)
    /// Used to disable server push
    EnablePush,

    /// SETTINGS_MAX_CONCURRENT_STREAMS (0x3)
    /// Indicates the maximum number of concurrent streams
    MaxConcurrentStreams,

    /// SETTINGS_INITIAL_WINDOW_SIZE (0x4)
    /// Indicates the sender's initial window size for stream-level flow control
    InitialWindowSize,

    /// SETTINGS_MAX_FRAME_SIZE (0x5)
    /// Indicates the size of the largest frame payload
    MaxFrameSize,

    /// SETTINGS_MAX_HEADER_LIST_SIZE (0x6)
    /// Advises peer of the maximum size of header list
    MaxHeaderListSize,

    /// SETTINGS_ENABLE_CONNECT_PROTOCOL (0x8) - RFC 8441
    /// Enables support for CONNECT requests with the :protocol pseudo-header
    EnableConnectProtocol,

    /// SETTINGS_NO_RFC7540_PRIORITIES (0x9) - RFC 9218
    NoRfc7540Priorities,

    /// Any other identifier; preserved on the wire, ignored by the ledger
    Unknown(u16),
}

impl SettingsParameter {
    /// Convert to u16
    pub fn as_u16(self) -> u16 {
        match self {
            SettingsParameter::HeaderTableSize => 0x1,
            SettingsParameter::EnablePush => 0x2,
            SettingsParameter::MaxConcurrentStreams => 0x3,
            SettingsParameter::InitialWindowSize => 0x4,
            SettingsParameter::MaxFrameSize => 0x5,
            SettingsParameter::MaxHeaderListSize => 0x6,
            SettingsParameter::EnableConnectProtocol => 0x8,
            SettingsParameter::NoRfc7540Priorities => 0x9,
            SettingsParameter::Unknown(id) => id,
        }
    }

    /// Create from u16
    pub fn from_u16(value: u16) -> Self {
        match value {
            0x1 => SettingsParameter::HeaderTableSize,
            0x2 => SettingsParameter::EnablePush,
            0x3 => SettingsParameter::MaxConcurrentStreams,
            0x4 => SettingsParameter::InitialWindowSize,
            0x5 => SettingsParameter::MaxFrameSize,
            0x6 => SettingsParameter::MaxHeaderListSize,
            0x8 => SettingsParameter::EnableConnectProtocol,
            0x9 => SettingsParameter::NoRfc7540Priorities,
            other => SettingsParameter::Unknown(other),
        }
    }

    /// Get parameter name
    pub fn name(&self) -> &'static str {
        match self {
            SettingsParameter::HeaderTableSize => "HEADER_TABLE_SIZE",
            SettingsParameter::EnablePush => "ENABLE_PUSH",
            SettingsParameter::MaxConcurrentStreams => "MAX_CONCURRENT_STREAMS",
            SettingsParameter::InitialWindowSize => "INITIAL_WINDOW_SIZE",
            SettingsParameter::MaxFrameSize => "MAX_FRAME_SIZE",
            SettingsParameter::MaxHeaderListSize => "MAX_HEADER_LIST_SIZE",
            SettingsParameter::EnableConnectProtocol => "ENABLE_CONNECT_PROTOCOL",
            SettingsParameter::NoRfc7540Priorities => "NO_RFC7540_PRIORITIES",
            SettingsParameter::Unknown(_) => "UNKNOWN",
        }
    }
}

impl fmt::Display for SettingsParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u16())
    }
}

/// One parameter/value pair of a SETTINGS frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Setting {
    pub parameter: SettingsParameter,
    pub value: u32,
}

impl Setting {
    pub fn new(parameter: SettingsParameter, value: u32) -> Self {
        Setting { parameter, value }
    }

    /// Check the value is legal for its parameter
    pub fn validate(&self) -> Result<()> {
        let valid = match self.parameter {
            SettingsParameter::EnablePush
            | SettingsParameter::EnableConnectProtocol
            | SettingsParameter::NoRfc7540Priorities => self.value <= 1,
            SettingsParameter::InitialWindowSize => self.value <= MAX_WINDOW_SIZE,
            SettingsParameter::MaxFrameSize => {
                (DEFAULT_MAX_FRAME_SIZE..=MAX_ALLOWED_MAX_FRAME_SIZE).contains(&self.value)
            }
            _ => true,
        };

        if valid {
            Ok(())
        } else {
            Err(Error::InvalidSetting { setting: *self })
        }
    }
}

impl fmt::Display for Setting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.parameter, self.value)
    }
}

/// The ordered parameter list of one SETTINGS frame
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    settings: Vec<Setting>,
}

impl Settings {
    /// Create an empty settings list
    pub fn new() -> Self {
        Settings::default()
    }

    /// Append a parameter
    pub fn push(&mut self, parameter: SettingsParameter, value: u32) {
        self.settings.push(Setting::new(parameter, value));
    }

    /// Last value given for `parameter`, if any
    pub fn get(&self, parameter: SettingsParameter) -> Option<u32> {
        self.settings
            .iter()
            .rev()
            .find(|s| s.parameter == parameter)
            .map(|s| s.value)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Setting> {
        self.settings.iter()
    }

    pub fn len(&self) -> usize {
        self.settings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.settings.is_empty()
    }

    /// Validate every value, returning the first offending setting
    pub fn validate(&self) -> Result<()> {
        self.settings.iter().try_for_each(Setting::validate)
    }
}

impl From<Vec<Setting>> for Settings {
    fn from(settings: Vec<Setting>) -> Self {
        Settings { settings }
    }
}

impl FromIterator<Setting> for Settings {
    fn from_iter<I: IntoIterator<Item = Setting>>(iter: I) -> Self {
        Settings {
            settings: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a Settings {
    type Item = &'a Setting;
    type IntoIter = std::slice::Iter<'a, Setting>;

    fn into_iter(self) -> Self::IntoIter {
        self.settings.iter()
    }
}

/// Builder for HTTP/2 settings
#[derive(Debug, Default)]
pub struct SettingsBuilder {
    settings: Settings,
}

impl SettingsBuilder {
    /// Create a new settings builder
    pub fn new() -> Self {
        SettingsBuilder::default()
    }

    /// Set header table size
    pub fn header_table_size(mut self, size: u32) -> Self {
        self.settings.push(SettingsParameter::HeaderTableSize, size);
        self
    }

    /// Set enable push
    pub fn enable_push(mut self, enable: bool) -> Self {
        self.settings.push(SettingsParameter::EnablePush, enable as u32);
        self
    }

    /// Set max concurrent streams
    pub fn max_concurrent_streams(mut self, max: u32) -> Self {
        self.settings.push(SettingsParameter::MaxConcurrentStreams, max);
        self
    }

    /// Set initial window size
    pub fn initial_window_size(mut self, size: u32) -> Self {
        self.settings.push(SettingsParameter::InitialWindowSize, size);
        self
    }

    /// Set max frame size
    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.settings.push(SettingsParameter::MaxFrameSize, size);
        self
    }

    /// Set max header list size
    pub fn max_header_list_size(mut self, size: u32) -> Self {
        self.settings.push(SettingsParameter::MaxHeaderListSize, size);
        self
    }

    /// Set enable CONNECT protocol
    pub fn enable_connect_protocol(mut self, enable: bool) -> Self {
        self.settings
            .push(SettingsParameter::EnableConnectProtocol, enable as u32);
        self
    }

    /// Build the settings
    pub fn build(self) -> Result<Settings> {
        self.settings.validate()?;
        Ok(self.settings)
    }
}

/// Values in effect for one direction of a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsValues {
    pub header_table_size: u32,
    pub enable_push: u32,
    /// `None` means unlimited
    pub max_concurrent_streams: Option<u32>,
    pub initial_window_size: u32,
    pub max_frame_size: u32,
    /// `None` means unlimited
    pub max_header_list_size: Option<u32>,
    pub enable_connect_protocol: u32,
}

impl Default for SettingsValues {
    fn default() -> Self {
        SettingsValues {
            header_table_size: DEFAULT_HEADER_TABLE_SIZE,
            enable_push: 1,
            max_concurrent_streams: None,
            initial_window_size: DEFAULT_INITIAL_WINDOW_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_header_list_size: None,
            enable_connect_protocol: 0,
        }
    }
}

impl SettingsValues {
    /// Current value of a known parameter
    pub fn get(&self, parameter: SettingsParameter) -> Option<u32> {
        match parameter {
            SettingsParameter::HeaderTableSize => Some(self.header_table_size),
            SettingsParameter::EnablePush => Some(self.enable_push),
            SettingsParameter::MaxConcurrentStreams => self.max_concurrent_streams,
            SettingsParameter::InitialWindowSize => Some(self.initial_window_size),
            SettingsParameter::MaxFrameSize => Some(self.max_frame_size),
            SettingsParameter::MaxHeaderListSize => self.max_header_list_size,
            SettingsParameter::EnableConnectProtocol => Some(self.enable_connect_protocol),
            SettingsParameter::NoRfc7540Priorities | SettingsParameter::Unknown(_) => None,
        }
    }

    /// Store a value; returns false for parameters the ledger does not track
    fn set(&mut self, parameter: SettingsParameter, value: u32) -> bool {
        match parameter {
            SettingsParameter::HeaderTableSize => self.header_table_size = value,
            SettingsParameter::EnablePush => self.enable_push = value,
            SettingsParameter::MaxConcurrentStreams => self.max_concurrent_streams = Some(value),
            SettingsParameter::InitialWindowSize => self.initial_window_size = value,
            SettingsParameter::MaxFrameSize => self.max_frame_size = value,
            SettingsParameter::MaxHeaderListSize => self.max_header_list_size = Some(value),
            SettingsParameter::EnableConnectProtocol => self.enable_connect_protocol = value,
            SettingsParameter::NoRfc7540Priorities | SettingsParameter::Unknown(_) => {
                return false
            }
        }
        true
    }
}

/// Settings bookkeeping for one direction of a connection
///
/// The local ledger queues every SETTINGS frame we emit and applies it only when
/// the peer acknowledges it. The remote ledger applies received SETTINGS
/// immediately, since this engine always acknowledges them.
///
/// Each applied value is reported to a callback as
/// `(parameter, old_value, new_value)` so the owner can propagate it.
#[derive(Debug, Clone, Default)]
pub struct SettingsLedger {
    values: SettingsValues,
    pending: VecDeque<Settings>,
}

impl SettingsLedger {
    pub fn new() -> Self {
        SettingsLedger::default()
    }

    pub fn values(&self) -> &SettingsValues {
        &self.values
    }

    pub fn initial_window_size(&self) -> u32 {
        self.values.initial_window_size
    }

    pub fn max_frame_size(&self) -> u32 {
        self.values.max_frame_size
    }

    pub fn header_table_size(&self) -> u32 {
        self.values.header_table_size
    }

    pub fn enable_push(&self) -> bool {
        self.values.enable_push == 1
    }

    pub fn max_concurrent_streams(&self) -> Option<u32> {
        self.values.max_concurrent_streams
    }

    pub fn max_header_list_size(&self) -> Option<u32> {
        self.values.max_header_list_size
    }

    /// Number of emitted SETTINGS frames awaiting ACK
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Queue an outbound SETTINGS frame until it is acknowledged
    pub fn emit_settings(&mut self, settings: Settings) {
        self.pending.push_back(settings);
    }

    /// Apply the oldest outstanding SETTINGS frame
    pub fn receive_settings_ack<F>(&mut self, on_change: F) -> Result<()>
    where
        F: FnMut(SettingsParameter, Option<u32>, u32) -> Result<()>,
    {
        let settings = self.pending.pop_front().ok_or(Error::ReceivedBadSettings)?;
        self.apply(&settings, on_change)
    }

    /// Apply SETTINGS received from the peer
    pub fn receive_settings<F>(&mut self, settings: &Settings, on_change: F) -> Result<()>
    where
        F: FnMut(SettingsParameter, Option<u32>, u32) -> Result<()>,
    {
        self.apply(settings, on_change)
    }

    fn apply<F>(&mut self, settings: &Settings, mut on_change: F) -> Result<()>
    where
        F: FnMut(SettingsParameter, Option<u32>, u32) -> Result<()>,
    {
        for setting in settings {
            let old_value = self.values.get(setting.parameter);
            if self.values.set(setting.parameter, setting.value) {
                on_change(setting.parameter, old_value, setting.value)?;
            }
        }
        Ok(())
    }
}
