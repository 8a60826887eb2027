//! HTTP/2 frame types and utilities
//!
//! This module defines the frame types specified in RFC 7540 Section 6, plus
//! ALTSVC (RFC 7838) and ORIGIN (RFC 8336). CONTINUATION frames never appear
//! as values: the decoder folds them into the HEADERS or PUSH_PROMISE they
//! continue.

use crate::error::ErrorCode;
use crate::headers::Headers;
use crate::settings::Settings;
use crate::stream_id::StreamId;
use bytes::Bytes;
use std::fmt;

/// Frame type codes this crate understands
///
/// Any other code is carried as a raw byte in [`FrameHeader`] and skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Data = 0x0,
    Headers = 0x1,
    Priority = 0x2,
    RstStream = 0x3,
    Settings = 0x4,
    PushPromise = 0x5,
    Ping = 0x6,
    Goaway = 0x7,
    WindowUpdate = 0x8,
    /// Only seen on the wire; folded into the block it continues
    Continuation = 0x9,
    /// RFC 7838
    AltSvc = 0xa,
    /// RFC 8336
    Origin = 0xc,
}

const KNOWN_FRAME_TYPES: [FrameType; 12] = [
    FrameType::Data,
    FrameType::Headers,
    FrameType::Priority,
    FrameType::RstStream,
    FrameType::Settings,
    FrameType::PushPromise,
    FrameType::Ping,
    FrameType::Goaway,
    FrameType::WindowUpdate,
    FrameType::Continuation,
    FrameType::AltSvc,
    FrameType::Origin,
];

impl FrameType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Wire name as written in the RFCs
    pub fn name(&self) -> &'static str {
        match self {
            FrameType::Data => "DATA",
            FrameType::Headers => "HEADERS",
            FrameType::Priority => "PRIORITY",
            FrameType::RstStream => "RST_STREAM",
            FrameType::Settings => "SETTINGS",
            FrameType::PushPromise => "PUSH_PROMISE",
            FrameType::Ping => "PING",
            FrameType::Goaway => "GOAWAY",
            FrameType::WindowUpdate => "WINDOW_UPDATE",
            FrameType::Continuation => "CONTINUATION",
            FrameType::AltSvc => "ALTSVC",
            FrameType::Origin => "ORIGIN",
        }
    }
}

impl TryFrom<u8> for FrameType {
    type Error = u8;

    fn try_from(code: u8) -> std::result::Result<Self, u8> {
        KNOWN_FRAME_TYPES
            .iter()
            .copied()
            .find(|frame_type| frame_type.as_u8() == code)
            .ok_or(code)
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u8())
    }
}

/// Flag byte of a frame header
///
/// Bit meanings depend on the frame type; `ACK` and `END_STREAM` share 0x1.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags(u8);

impl FrameFlags {
    pub const END_STREAM: u8 = 0x1;
    pub const ACK: u8 = 0x1;
    pub const END_HEADERS: u8 = 0x4;
    pub const PADDED: u8 = 0x8;
    pub const PRIORITY: u8 = 0x20;

    pub fn empty() -> Self {
        FrameFlags(0)
    }

    pub fn from_u8(bits: u8) -> Self {
        FrameFlags(bits)
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn contains(&self, flag: u8) -> bool {
        self.0 & flag == flag
    }

    pub fn insert(&mut self, flag: u8) {
        self.0 |= flag;
    }

    /// Insert `flag` when `condition` holds
    pub fn set_if(&mut self, flag: u8, condition: bool) {
        if condition {
            self.insert(flag);
        }
    }
}

/// The fixed 9-byte header preceding every frame (RFC 7540 Section 4.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Payload length (24 bits)
    pub length: usize,
    /// Raw type byte; unknown types are kept so they can be skipped
    pub raw_type: u8,
    pub flags: FrameFlags,
    pub stream_id: StreamId,
}

impl FrameHeader {
    /// Known frame type, if any
    pub fn frame_type(&self) -> Option<FrameType> {
        FrameType::try_from(self.raw_type).ok()
    }
}

/// A complete HTTP/2 frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream_id: StreamId,
    pub payload: FramePayload,
}

impl Frame {
    /// Create a new frame
    pub fn new(stream_id: StreamId, payload: FramePayload) -> Self {
        Frame { stream_id, payload }
    }

    /// DATA frame
    pub fn data(stream_id: StreamId, data: Bytes, end_stream: bool) -> Self {
        Frame::new(stream_id, FramePayload::Data(DataFrame::new(data, end_stream)))
    }

    /// HEADERS frame without priority or padding
    pub fn headers(stream_id: StreamId, headers: Headers, end_stream: bool) -> Self {
        Frame::new(
            stream_id,
            FramePayload::Headers(HeadersFrame::new(headers, end_stream)),
        )
    }

    /// SETTINGS frame
    pub fn settings(settings: Settings) -> Self {
        Frame::new(StreamId::ROOT, FramePayload::Settings(SettingsFrame::Settings(settings)))
    }

    /// SETTINGS ACK frame
    pub fn settings_ack() -> Self {
        Frame::new(StreamId::ROOT, FramePayload::Settings(SettingsFrame::Ack))
    }

    /// PING frame
    pub fn ping(data: [u8; 8], ack: bool) -> Self {
        Frame::new(StreamId::ROOT, FramePayload::Ping(PingFrame { ack, data }))
    }

    /// GOAWAY frame
    pub fn goaway(last_stream_id: StreamId, error_code: ErrorCode, debug_data: Bytes) -> Self {
        Frame::new(
            StreamId::ROOT,
            FramePayload::Goaway(GoawayFrame::new(last_stream_id, error_code, debug_data)),
        )
    }

    /// WINDOW_UPDATE frame
    pub fn window_update(stream_id: StreamId, increment: u32) -> Self {
        Frame::new(stream_id, FramePayload::WindowUpdate(increment))
    }

    /// RST_STREAM frame
    pub fn rst_stream(stream_id: StreamId, error_code: ErrorCode) -> Self {
        Frame::new(stream_id, FramePayload::RstStream(error_code))
    }

    /// Frame type of the payload
    pub fn frame_type(&self) -> FrameType {
        self.payload.frame_type()
    }
}

/// Type-specific frame payloads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramePayload {
    Data(DataFrame),
    Headers(HeadersFrame),
    Priority(PrioritySpec),
    RstStream(ErrorCode),
    Settings(SettingsFrame),
    PushPromise(PushPromiseFrame),
    Ping(PingFrame),
    Goaway(GoawayFrame),
    WindowUpdate(u32),
    AltSvc(AltSvcFrame),
    Origin(Vec<String>),
}

impl FramePayload {
    pub fn frame_type(&self) -> FrameType {
        match self {
            FramePayload::Data(_) => FrameType::Data,
            FramePayload::Headers(_) => FrameType::Headers,
            FramePayload::Priority(_) => FrameType::Priority,
            FramePayload::RstStream(_) => FrameType::RstStream,
            FramePayload::Settings(_) => FrameType::Settings,
            FramePayload::PushPromise(_) => FrameType::PushPromise,
            FramePayload::Ping(_) => FrameType::Ping,
            FramePayload::Goaway(_) => FrameType::Goaway,
            FramePayload::WindowUpdate(_) => FrameType::WindowUpdate,
            FramePayload::AltSvc(_) => FrameType::AltSvc,
            FramePayload::Origin(_) => FrameType::Origin,
        }
    }
}

/// DATA frame (RFC 7540 Section 6.1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    /// Data payload
    pub data: Bytes,
    /// END_STREAM flag
    pub end_stream: bool,
    /// Padding length (if PADDED flag is set); never produced by the decoder
    pub padding: Option<u8>,
}

impl DataFrame {
    /// Create a new DATA frame
    pub fn new(data: Bytes, end_stream: bool) -> Self {
        DataFrame {
            data,
            end_stream,
            padding: None,
        }
    }

    /// Set padding
    pub fn with_padding(mut self, padding: u8) -> Self {
        self.padding = Some(padding);
        self
    }
}

/// HEADERS frame (RFC 7540 Section 6.2)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadersFrame {
    /// Decoded header list
    pub headers: Headers,
    /// END_STREAM flag
    pub end_stream: bool,
    /// Priority information (if PRIORITY flag is set)
    pub priority: Option<PrioritySpec>,
    /// Padding length (if PADDED flag is set); never produced by the decoder
    pub padding: Option<u8>,
}

impl HeadersFrame {
    /// Create a new HEADERS frame
    pub fn new(headers: Headers, end_stream: bool) -> Self {
        HeadersFrame {
            headers,
            end_stream,
            priority: None,
            padding: None,
        }
    }

    /// Set priority
    pub fn with_priority(mut self, priority: PrioritySpec) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Set padding
    pub fn with_padding(mut self, padding: u8) -> Self {
        self.padding = Some(padding);
        self
    }
}

/// Priority specification (RFC 7540 Section 6.3)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrioritySpec {
    /// Stream dependency
    pub stream_dependency: StreamId,
    /// Exclusive flag
    pub exclusive: bool,
    /// Weight as sent on the wire (actual weight minus one)
    pub weight: u8,
}

impl PrioritySpec {
    /// Create a new priority specification
    pub fn new(stream_dependency: StreamId, exclusive: bool, weight: u8) -> Self {
        PrioritySpec {
            stream_dependency,
            exclusive,
            weight,
        }
    }
}

/// SETTINGS frame (RFC 7540 Section 6.5)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingsFrame {
    Settings(Settings),
    Ack,
}

/// PUSH_PROMISE frame (RFC 7540 Section 6.6)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushPromiseFrame {
    /// Promised stream ID
    pub promised_stream_id: StreamId,
    /// Decoded header list of the promised request
    pub headers: Headers,
    /// Padding length (if PADDED flag is set); never produced by the decoder
    pub padding: Option<u8>,
}

impl PushPromiseFrame {
    pub fn new(promised_stream_id: StreamId, headers: Headers) -> Self {
        PushPromiseFrame {
            promised_stream_id,
            headers,
            padding: None,
        }
    }
}

/// PING frame (RFC 7540 Section 6.7)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingFrame {
    /// ACK flag
    pub ack: bool,
    /// Opaque data (8 bytes)
    pub data: [u8; 8],
}

/// GOAWAY frame (RFC 7540 Section 6.8)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoawayFrame {
    /// Last stream ID
    pub last_stream_id: StreamId,
    /// Error code
    pub error_code: ErrorCode,
    /// Debug data
    pub debug_data: Bytes,
}

impl GoawayFrame {
    /// Create a new GOAWAY frame
    pub fn new(last_stream_id: StreamId, error_code: ErrorCode, debug_data: Bytes) -> Self {
        GoawayFrame {
            last_stream_id,
            error_code,
            debug_data,
        }
    }
}

/// ALTSVC frame (RFC 7838 Section 4)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AltSvcFrame {
    /// Origin the alternative applies to; only present on stream 0
    pub origin: Option<String>,
    /// Alt-Svc field value
    pub field: Bytes,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type_codes() {
        for frame_type in KNOWN_FRAME_TYPES {
            assert_eq!(FrameType::try_from(frame_type.as_u8()), Ok(frame_type));
        }
        assert_eq!(FrameType::try_from(0xb), Err(0xb));
        assert_eq!(FrameType::try_from(0xff), Err(0xff));
        assert_eq!(FrameType::Settings.to_string(), "SETTINGS (0x4)");
    }

    #[test]
    fn test_unknown_type_kept_in_header() {
        let header = FrameHeader {
            length: 4,
            raw_type: 0xee,
            flags: FrameFlags::empty(),
            stream_id: StreamId::ROOT,
        };
        assert_eq!(header.frame_type(), None);
    }

    #[test]
    fn test_frame_flags() {
        let mut flags = FrameFlags::from_u8(FrameFlags::END_STREAM);
        assert!(flags.contains(FrameFlags::ACK));
        assert!(!flags.contains(FrameFlags::END_HEADERS));

        flags.set_if(FrameFlags::END_HEADERS, true);
        flags.set_if(FrameFlags::PADDED, false);
        assert!(flags.contains(FrameFlags::END_STREAM | FrameFlags::END_HEADERS));
        assert!(!flags.contains(FrameFlags::PADDED));
        assert_eq!(flags.as_u8(), 0x5);
    }

    #[test]
    fn test_frame_constructors() {
        let frame = Frame::data(StreamId::new(1), Bytes::from("Hello"), true);
        assert_eq!(frame.frame_type(), FrameType::Data);
        match frame.payload {
            FramePayload::Data(data) => {
                assert!(data.end_stream);
                assert_eq!(data.padding, None);
                assert_eq!(data.with_padding(10).padding, Some(10));
            }
            other => panic!("unexpected payload {:?}", other),
        }

        assert_eq!(Frame::settings_ack().stream_id, StreamId::ROOT);
        assert_eq!(Frame::ping([0; 8], true).frame_type(), FrameType::Ping);
    }
}
