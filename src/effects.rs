//! Outcomes and side effects of state machine operations

use crate::error::{Error, ErrorCode};
use crate::stream_id::StreamId;
use std::fmt;

/// Verdict on one inbound or outbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateMachineResult {
    /// The frame is legal and should be forwarded/written
    Succeed,
    /// The frame is legal but must be dropped (e.g. a straggler on a reset stream)
    Ignore,
    /// The whole connection must be torn down with GOAWAY(`code`)
    ConnectionError { underlying: Error, code: ErrorCode },
    /// One stream must be reset with RST_STREAM(`code`)
    StreamError {
        stream_id: StreamId,
        underlying: Error,
        code: ErrorCode,
    },
}

impl StateMachineResult {
    /// Connection error using the cause's default code
    pub fn connection_error(underlying: Error) -> Self {
        let code = underlying.error_code();
        StateMachineResult::ConnectionError { underlying, code }
    }

    /// Stream error using the cause's default code
    pub fn stream_error(stream_id: StreamId, underlying: Error) -> Self {
        let code = underlying.error_code();
        StateMachineResult::StreamError {
            stream_id,
            underlying,
            code,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StateMachineResult::Succeed)
    }

    pub fn is_connection_error(&self) -> bool {
        matches!(self, StateMachineResult::ConnectionError { .. })
    }

    pub fn is_stream_error(&self) -> bool {
        matches!(self, StateMachineResult::StreamError { .. })
    }

    /// Underlying cause, for either kind of error
    pub fn error(&self) -> Option<&Error> {
        match self {
            StateMachineResult::ConnectionError { underlying, .. }
            | StateMachineResult::StreamError { underlying, .. } => Some(underlying),
            _ => None,
        }
    }

    /// Wire error code, for either kind of error
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            StateMachineResult::ConnectionError { code, .. }
            | StateMachineResult::StreamError { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl fmt::Display for StateMachineResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateMachineResult::Succeed => write!(f, "succeed"),
            StateMachineResult::Ignore => write!(f, "ignore"),
            StateMachineResult::ConnectionError { underlying, code } => {
                write!(f, "connection error {}: {}", code, underlying)
            }
            StateMachineResult::StreamError {
                stream_id,
                underlying,
                code,
            } => write!(f, "stream {} error {}: {}", stream_id, code, underlying),
        }
    }
}

/// A verdict together with the state change it caused
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateMachineResultWithEffect {
    pub result: StateMachineResult,
    pub effect: Option<StateChange>,
}

impl StateMachineResultWithEffect {
    pub fn new(result: StateMachineResult, effect: Option<StateChange>) -> Self {
        StateMachineResultWithEffect { result, effect }
    }

    pub fn succeed(effect: Option<StateChange>) -> Self {
        Self::new(StateMachineResult::Succeed, effect)
    }

    pub fn ignore() -> Self {
        Self::new(StateMachineResult::Ignore, None)
    }

    pub fn connection_error(underlying: Error) -> Self {
        Self::new(StateMachineResult::connection_error(underlying), None)
    }

    pub fn connection_error_with_code(underlying: Error, code: ErrorCode) -> Self {
        Self::new(StateMachineResult::ConnectionError { underlying, code }, None)
    }

    pub fn stream_error(stream_id: StreamId, underlying: Error) -> Self {
        Self::new(StateMachineResult::stream_error(stream_id, underlying), None)
    }
}

impl From<StateMachineResult> for StateMachineResultWithEffect {
    fn from(result: StateMachineResult) -> Self {
        Self::new(result, None)
    }
}

/// An observable change of connection or stream state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateChange {
    /// A stream became active; windows are those it was created with
    StreamCreated(StreamCreated),
    /// An active stream closed
    StreamClosed(StreamClosed),
    /// A stream was opened and closed by a single frame
    StreamCreatedAndClosed { stream_id: StreamId },
    /// Streams dropped by GOAWAY
    BulkStreamClosure { closed_streams: Vec<StreamId> },
    FlowControlChange(FlowControlChange),
    /// The peer acknowledged our SETTINGS
    LocalSettingsChanged(SettingsChange),
    /// We applied the peer's SETTINGS
    RemoteSettingsChanged(SettingsChange),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamCreated {
    pub stream_id: StreamId,
    /// Bytes the peer may send us on this stream, if our side still receives
    pub local_stream_window_size: Option<i32>,
    /// Bytes we may send on this stream, if our side still sends
    pub remote_stream_window_size: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamClosed {
    pub stream_id: StreamId,
    /// RST_STREAM code, `None` for a clean close
    pub reason: Option<ErrorCode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowControlChange {
    pub local_connection_window_size: i32,
    pub remote_connection_window_size: i32,
    pub stream: Option<StreamWindowSizeChange>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamWindowSizeChange {
    pub stream_id: StreamId,
    pub local_stream_window_size: Option<i32>,
    pub remote_stream_window_size: Option<i32>,
}

/// Settings that took effect, for updating the codec
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SettingsChange {
    /// Delta applied to every stream window in the affected direction
    pub stream_window_size_change: i32,
    pub new_max_frame_size: Option<u32>,
    pub new_max_concurrent_streams: Option<u32>,
    pub new_header_table_size: Option<u32>,
    pub new_max_header_list_size: Option<u32>,
}
