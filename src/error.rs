//! HTTP/2 error types
//!
//! This module defines the causes the engine reports and the error codes
//! defined in RFC 7540 Section 7 that are placed on the wire for them.

use crate::settings::{Setting, SettingsParameter};
use crate::stream_id::StreamId;
use std::fmt;

/// HTTP/2 errors
///
/// Each variant names one cause. Whether a cause is fatal to a stream or to the
/// whole connection is decided by the state machine that reports it, see
/// [`crate::effects::StateMachineResult`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// A frame was sent or received before this side's preface step completed
    #[error("Missing connection preface")]
    MissingPreface,

    /// Operation attempted after the connection fully quiesced
    #[error("I/O on closed connection")]
    IoOnClosedConnection,

    /// The client did not open with the connection preface magic
    #[error("Bad client magic")]
    BadClientMagic,

    /// SETTINGS ACK received with no outstanding SETTINGS
    #[error("Received SETTINGS ACK with no SETTINGS outstanding")]
    ReceivedBadSettings,

    /// A SETTINGS value outside its legal range
    #[error("Invalid setting: {setting}")]
    InvalidSetting { setting: Setting },

    /// A stream was opened by a peer that already sent GOAWAY
    #[error("Stream {stream_id} created after GOAWAY")]
    CreatedStreamAfterGoaway { stream_id: StreamId },

    /// Frame for a stream that does not exist
    #[error("No such stream: {stream_id}")]
    NoSuchStream { stream_id: StreamId },

    /// Frame for a stream that has been closed
    #[error("Stream {stream_id} closed")]
    StreamClosed {
        stream_id: StreamId,
        error_code: Option<ErrorCode>,
    },

    /// The frame is not legal in the stream's current state
    #[error("Bad stream state transition from {from}")]
    BadStreamStateTransition { from: &'static str },

    /// Opening the stream would exceed SETTINGS_MAX_CONCURRENT_STREAMS
    #[error("Too many concurrent streams")]
    MaxStreamsViolation,

    /// Stream ID not greater than the last one used by the same initiator
    #[error("Stream ID {stream_id} too small")]
    StreamIdTooSmall { stream_id: StreamId },

    /// Stream ID has the wrong parity for the initiating peer
    #[error("Stream ID {stream_id} is not valid for this peer")]
    InvalidStreamIdForPeer { stream_id: StreamId },

    /// PUSH_PROMISE while the client has disabled push
    #[error("PUSH_PROMISE in violation of SETTINGS_ENABLE_PUSH")]
    PushInViolationOfSetting,

    /// A window change would push a flow-control window past 2^31-1
    #[error("Invalid flow control window size: delta {delta}, current window {current_window_size}")]
    InvalidFlowControlWindowSize { delta: i64, current_window_size: i32 },

    /// WINDOW_UPDATE with an increment of zero
    #[error("Invalid window increment size")]
    InvalidWindowIncrementSize,

    /// More flow-controlled bytes than the window allows
    #[error("Flow control violation")]
    FlowControlViolation,

    /// Trailers header block without END_STREAM
    #[error("Trailers without END_STREAM")]
    TrailersWithoutEndStream,

    /// Pseudo-header field following a regular field
    #[error("Pseudo-header {name} after regular header")]
    PseudoHeaderAfterRegularHeader { name: String },

    /// Pseudo-header not defined by RFC 7540
    #[error("Unknown pseudo-header {name}")]
    UnknownPseudoHeader { name: String },

    /// Same pseudo-header present twice
    #[error("Duplicate pseudo-header {name}")]
    DuplicatePseudoHeader { name: String },

    /// Connection-specific header field, or `te` other than `trailers`
    #[error("Forbidden header field {name}: {value}")]
    ForbiddenHeaderField { name: String, value: String },

    /// Request with an empty `:path`
    #[error("Empty :path header")]
    EmptyPathHeader,

    /// Pseudo-header set not allowed, or incomplete, for the block type
    #[error("Invalid pseudo-headers: {pseudo_headers:?}")]
    InvalidPseudoHeaders { pseudo_headers: Vec<String> },

    /// Header field name with characters outside lowercase `tchar`
    #[error("Invalid header field name: {name}")]
    InvalidHeaderFieldName { name: String },

    /// `:status` that is not a three-digit code
    #[error("Invalid :status value: {value}")]
    InvalidStatusValue { value: String },

    /// Malformed or inconsistent `content-length`
    #[error("Invalid content-length: {value}")]
    InvalidContentLength { value: String },

    /// Body length disagreed with `content-length`
    #[error("Content-length violated")]
    ContentLengthViolated,

    /// Too many consecutive empty DATA frames
    #[error("Excessive empty DATA frames")]
    ExcessiveEmptyDataFrames,

    /// Too many outbound control frames buffered
    #[error("Excessive outbound frame buffering")]
    ExcessiveOutboundFrameBuffering,

    /// Header block larger than the configured limit
    #[error("Excessively large header block: {size} bytes")]
    ExcessivelyLargeHeaderBlock { size: usize },

    /// Frame size error (RFC 7540 Section 7 - Error code 0x6)
    #[error("Frame size error: {0}")]
    FrameSize(String),

    /// Protocol error detected while parsing (RFC 7540 Section 7 - Error code 0x1)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Compression error (RFC 7540 Section 7 - Error code 0x9)
    #[error("Compression error: {0}")]
    Compression(String),

    /// Feature not implemented by this engine
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Default error code placed on the wire for this cause
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Error::InvalidFlowControlWindowSize { .. } | Error::FlowControlViolation => {
                ErrorCode::FlowControlError
            }
            Error::InvalidSetting { setting } => match setting.parameter {
                SettingsParameter::InitialWindowSize => ErrorCode::FlowControlError,
                _ => ErrorCode::ProtocolError,
            },
            Error::StreamClosed { .. } => ErrorCode::StreamClosed,
            Error::MaxStreamsViolation => ErrorCode::RefusedStream,
            Error::FrameSize(_) | Error::ExcessivelyLargeHeaderBlock { .. } => {
                ErrorCode::FrameSizeError
            }
            Error::Compression(_) => ErrorCode::CompressionError,
            Error::ExcessiveEmptyDataFrames | Error::ExcessiveOutboundFrameBuffering => {
                ErrorCode::EnhanceYourCalm
            }
            Error::Unsupported(_) | Error::InvalidConfig(_) => ErrorCode::InternalError,
            _ => ErrorCode::ProtocolError,
        }
    }
}

/// HTTP/2 error codes as defined in RFC 7540 Section 7
///
/// Codes this engine does not know are preserved in [`ErrorCode::Other`]; RFC
/// 7540 requires unknown codes to be treated like `INTERNAL_ERROR` without
/// being rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Graceful shutdown
    NoError,
    /// Protocol error detected
    ProtocolError,
    /// Implementation fault
    InternalError,
    /// Flow-control limits exceeded
    FlowControlError,
    /// Settings not acknowledged
    SettingsTimeout,
    /// Frame received for closed stream
    StreamClosed,
    /// Frame size incorrect
    FrameSizeError,
    /// Stream not processed
    RefusedStream,
    /// Stream cancelled
    Cancel,
    /// Compression state not updated
    CompressionError,
    /// TCP connection error for CONNECT method
    ConnectError,
    /// Processing capacity exceeded
    EnhanceYourCalm,
    /// Negotiated TLS parameters not acceptable
    InadequateSecurity,
    /// Use HTTP/1.1 for the request
    Http11Required,
    /// Code not defined by RFC 7540
    Other(u32),
}

impl ErrorCode {
    /// Convert error code to u32
    pub fn as_u32(self) -> u32 {
        match self {
            ErrorCode::NoError => 0x0,
            ErrorCode::ProtocolError => 0x1,
            ErrorCode::InternalError => 0x2,
            ErrorCode::FlowControlError => 0x3,
            ErrorCode::SettingsTimeout => 0x4,
            ErrorCode::StreamClosed => 0x5,
            ErrorCode::FrameSizeError => 0x6,
            ErrorCode::RefusedStream => 0x7,
            ErrorCode::Cancel => 0x8,
            ErrorCode::CompressionError => 0x9,
            ErrorCode::ConnectError => 0xa,
            ErrorCode::EnhanceYourCalm => 0xb,
            ErrorCode::InadequateSecurity => 0xc,
            ErrorCode::Http11Required => 0xd,
            ErrorCode::Other(code) => code,
        }
    }

    /// Create error code from u32
    pub fn from_u32(code: u32) -> Self {
        match code {
            0x0 => ErrorCode::NoError,
            0x1 => ErrorCode::ProtocolError,
            0x2 => ErrorCode::InternalError,
            0x3 => ErrorCode::FlowControlError,
            0x4 => ErrorCode::SettingsTimeout,
            0x5 => ErrorCode::StreamClosed,
            0x6 => ErrorCode::FrameSizeError,
            0x7 => ErrorCode::RefusedStream,
            0x8 => ErrorCode::Cancel,
            0x9 => ErrorCode::CompressionError,
            0xa => ErrorCode::ConnectError,
            0xb => ErrorCode::EnhanceYourCalm,
            0xc => ErrorCode::InadequateSecurity,
            0xd => ErrorCode::Http11Required,
            other => ErrorCode::Other(other),
        }
    }

    /// Get error name
    pub fn name(&self) -> &'static str {
        match self {
            ErrorCode::NoError => "NO_ERROR",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::FlowControlError => "FLOW_CONTROL_ERROR",
            ErrorCode::SettingsTimeout => "SETTINGS_TIMEOUT",
            ErrorCode::StreamClosed => "STREAM_CLOSED",
            ErrorCode::FrameSizeError => "FRAME_SIZE_ERROR",
            ErrorCode::RefusedStream => "REFUSED_STREAM",
            ErrorCode::Cancel => "CANCEL",
            ErrorCode::CompressionError => "COMPRESSION_ERROR",
            ErrorCode::ConnectError => "CONNECT_ERROR",
            ErrorCode::EnhanceYourCalm => "ENHANCE_YOUR_CALM",
            ErrorCode::InadequateSecurity => "INADEQUATE_SECURITY",
            ErrorCode::Http11Required => "HTTP_1_1_REQUIRED",
            ErrorCode::Other(_) => "UNKNOWN",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u32())
    }
}

/// Result type for HTTP/2 operations
pub type Result<T> = std::result::Result<T, Error>;
