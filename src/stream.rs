//! HTTP/2 stream state machine (RFC 7540 Section 5.1)
//!
//! Each state carries only the flow-control windows and content-length
//! verifiers that are meaningful in it. "Local" is this endpoint and "remote"
//! the peer: the local window counts bytes the peer may still send us, the
//! remote window bytes we may still send.
//!
//! ```text
//!                              +--------+
//!                      send PP |        | recv PP
//!                     ,--------|  idle  |--------.
//!                    /         |        |         \
//!                   v          +--------+          v
//!            +----------+          |           +----------+
//!            |          |          | send H /  |          |
//!     ,------| reserved |          | recv H    | reserved |------.
//!     |      | (local)  |          |           | (remote) |      |
//!     |      +----------+          v           +----------+      |
//!     |          |             +--------+             |          |
//!     |          |     recv ES |        | send ES     |          |
//!     |   send H |     ,-------|  open  |-------.     | recv H   |
//!     |          |    /        |        |        \    |          |
//!     |          v   v         +--------+         v   v          |
//!     |      +----------+          |           +----------+      |
//!     |      |   half   |          |           |   half   |      |
//!     |      |  closed  |          | send R /  |  closed  |      |
//!     |      | (remote) |          | recv R    | (local)  |      |
//!     |      +----------+          |           +----------+      |
//!     |           |                |                 |           |
//!     |           | send ES /      |       recv ES / |           |
//!     |           | send R /       v        send R / |           |
//!     |           | recv R     +--------+   recv R   |           |
//!     | send R /  `----------->|        |<-----------'  send R / |
//!     | recv R                 | closed |               recv R   |
//!     `----------------------->|        |<----------------------'
//!                              +--------+
//! ```
//!
//! "open" and the half-closed states are split further by whether the other
//! side has sent its headers yet, since that decides which verifiers exist.

use crate::connection::ConnectionRole;
use crate::content_length::ContentLengthVerifier;
use crate::effects::{
    StateChange, StateMachineResult, StateMachineResultWithEffect, StreamClosed, StreamCreated,
};
use crate::error::{Error, ErrorCode, Result};
use crate::flow_control::FlowControlWindow;
use crate::header_validation::{self, HeaderBlockType};
use crate::headers::Headers;
use crate::stream_id::StreamId;

/// Lifecycle state of one stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle {
        local_window: FlowControlWindow,
        remote_window: FlowControlWindow,
    },
    /// The peer promised this stream; we will only receive on it
    ReservedRemote { local_window: FlowControlWindow },
    /// We promised this stream; we will only send on it
    ReservedLocal { remote_window: FlowControlWindow },
    /// We sent headers, the peer has not
    HalfOpenLocalPeerIdle {
        local_window: FlowControlWindow,
        local_content_length: ContentLengthVerifier,
        remote_window: FlowControlWindow,
    },
    /// The peer sent headers, we have not
    HalfOpenRemoteLocalIdle {
        local_window: FlowControlWindow,
        remote_content_length: ContentLengthVerifier,
        remote_window: FlowControlWindow,
    },
    FullyOpen {
        local_content_length: ContentLengthVerifier,
        remote_content_length: ContentLengthVerifier,
        local_window: FlowControlWindow,
        remote_window: FlowControlWindow,
    },
    /// We ended our side before the peer sent headers
    HalfClosedLocalPeerIdle { local_window: FlowControlWindow },
    /// We ended our side, the peer is still sending
    HalfClosedLocalPeerActive {
        remote_content_length: ContentLengthVerifier,
        local_window: FlowControlWindow,
    },
    /// The peer ended its side before we sent headers
    HalfClosedRemoteLocalIdle { remote_window: FlowControlWindow },
    /// The peer ended its side, we are still sending
    HalfClosedRemoteLocalActive {
        local_content_length: ContentLengthVerifier,
        remote_window: FlowControlWindow,
    },
    /// `reason` is the RST_STREAM code, `None` after a clean close
    Closed { reason: Option<ErrorCode> },
}

impl StreamState {
    pub fn name(&self) -> &'static str {
        match self {
            StreamState::Idle { .. } => "idle",
            StreamState::ReservedRemote { .. } => "reservedRemote",
            StreamState::ReservedLocal { .. } => "reservedLocal",
            StreamState::HalfOpenLocalPeerIdle { .. } => "halfOpenLocalPeerIdle",
            StreamState::HalfOpenRemoteLocalIdle { .. } => "halfOpenRemoteLocalIdle",
            StreamState::FullyOpen { .. } => "fullyOpen",
            StreamState::HalfClosedLocalPeerIdle { .. } => "halfClosedLocalPeerIdle",
            StreamState::HalfClosedLocalPeerActive { .. } => "halfClosedLocalPeerActive",
            StreamState::HalfClosedRemoteLocalIdle { .. } => "halfClosedRemoteLocalIdle",
            StreamState::HalfClosedRemoteLocalActive { .. } => "halfClosedRemoteLocalActive",
            StreamState::Closed { .. } => "closed",
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, StreamState::Closed { .. })
    }

    /// Idle or reserved: not yet counted as open
    pub fn is_inactive(&self) -> bool {
        matches!(
            self,
            StreamState::Idle { .. } | StreamState::ReservedRemote { .. } | StreamState::ReservedLocal { .. }
        )
    }

    pub fn is_active(&self) -> bool {
        !self.is_inactive() && !self.is_closed()
    }

    /// Bytes the peer may still send us, if the peer can still send
    pub fn local_window_size(&self) -> Option<i32> {
        self.local_window().map(|w| w.size())
    }

    /// Bytes we may still send, if we can still send
    pub fn remote_window_size(&self) -> Option<i32> {
        self.remote_window().map(|w| w.size())
    }

    fn local_window(&self) -> Option<FlowControlWindow> {
        match *self {
            StreamState::Idle { local_window, .. }
            | StreamState::ReservedRemote { local_window }
            | StreamState::HalfOpenLocalPeerIdle { local_window, .. }
            | StreamState::HalfOpenRemoteLocalIdle { local_window, .. }
            | StreamState::FullyOpen { local_window, .. }
            | StreamState::HalfClosedLocalPeerIdle { local_window }
            | StreamState::HalfClosedLocalPeerActive { local_window, .. } => Some(local_window),
            _ => None,
        }
    }

    fn remote_window(&self) -> Option<FlowControlWindow> {
        match *self {
            StreamState::Idle { remote_window, .. }
            | StreamState::ReservedLocal { remote_window }
            | StreamState::HalfOpenLocalPeerIdle { remote_window, .. }
            | StreamState::HalfOpenRemoteLocalIdle { remote_window, .. }
            | StreamState::FullyOpen { remote_window, .. }
            | StreamState::HalfClosedRemoteLocalIdle { remote_window }
            | StreamState::HalfClosedRemoteLocalActive { remote_window, .. } => Some(remote_window),
            _ => None,
        }
    }

    fn local_window_mut(&mut self) -> Option<&mut FlowControlWindow> {
        match self {
            StreamState::Idle { local_window, .. }
            | StreamState::ReservedRemote { local_window }
            | StreamState::HalfOpenLocalPeerIdle { local_window, .. }
            | StreamState::HalfOpenRemoteLocalIdle { local_window, .. }
            | StreamState::FullyOpen { local_window, .. }
            | StreamState::HalfClosedLocalPeerIdle { local_window }
            | StreamState::HalfClosedLocalPeerActive { local_window, .. } => Some(local_window),
            _ => None,
        }
    }

    fn remote_window_mut(&mut self) -> Option<&mut FlowControlWindow> {
        match self {
            StreamState::Idle { remote_window, .. }
            | StreamState::ReservedLocal { remote_window }
            | StreamState::HalfOpenLocalPeerIdle { remote_window, .. }
            | StreamState::HalfOpenRemoteLocalIdle { remote_window, .. }
            | StreamState::FullyOpen { remote_window, .. }
            | StreamState::HalfClosedRemoteLocalIdle { remote_window }
            | StreamState::HalfClosedRemoteLocalActive { remote_window, .. } => Some(remote_window),
            _ => None,
        }
    }
}

/// Validation switches taken from the connection configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamValidation {
    pub headers: bool,
    pub content_length: bool,
}

impl Default for StreamValidation {
    fn default() -> Self {
        StreamValidation {
            headers: true,
            content_length: true,
        }
    }
}

type Step = std::result::Result<StreamState, StateMachineResult>;

/// Per-stream protocol state
#[derive(Debug, Clone)]
pub struct StreamStateMachine {
    stream_id: StreamId,
    local_role: ConnectionRole,
    validation: StreamValidation,
    /// Set once a HEAD request is seen, so the response expects no body
    request_is_head: bool,
    state: StreamState,
}

impl StreamStateMachine {
    /// A stream that has not seen any frame yet
    pub fn new(
        stream_id: StreamId,
        local_role: ConnectionRole,
        local_window_size: u32,
        remote_window_size: u32,
        validation: StreamValidation,
    ) -> Self {
        Self::with_state(
            stream_id,
            local_role,
            validation,
            StreamState::Idle {
                local_window: FlowControlWindow::new(local_window_size),
                remote_window: FlowControlWindow::new(remote_window_size),
            },
        )
    }

    /// A stream we promised to the peer
    pub fn reserved_local(
        stream_id: StreamId,
        local_role: ConnectionRole,
        remote_window_size: u32,
        validation: StreamValidation,
    ) -> Self {
        Self::with_state(
            stream_id,
            local_role,
            validation,
            StreamState::ReservedLocal {
                remote_window: FlowControlWindow::new(remote_window_size),
            },
        )
    }

    /// A stream the peer promised us
    pub fn reserved_remote(
        stream_id: StreamId,
        local_role: ConnectionRole,
        local_window_size: u32,
        validation: StreamValidation,
    ) -> Self {
        Self::with_state(
            stream_id,
            local_role,
            validation,
            StreamState::ReservedRemote {
                local_window: FlowControlWindow::new(local_window_size),
            },
        )
    }

    fn with_state(
        stream_id: StreamId,
        local_role: ConnectionRole,
        validation: StreamValidation,
        state: StreamState,
    ) -> Self {
        StreamStateMachine {
            stream_id,
            local_role,
            validation,
            request_is_head: false,
            state,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn state(&self) -> &StreamState {
        &self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    pub fn local_window_size(&self) -> Option<i32> {
        self.state.local_window_size()
    }

    pub fn remote_window_size(&self) -> Option<i32> {
        self.state.remote_window_size()
    }

    /// The role that opened this stream
    pub fn initiated_by(&self) -> ConnectionRole {
        if self.stream_id.is_client_initiated() {
            ConnectionRole::Client
        } else {
            ConnectionRole::Server
        }
    }

    // Headers

    pub fn send_headers(&mut self, headers: &Headers, end_stream: bool) -> StateMachineResultWithEffect {
        let is_head = is_head_request(headers);
        self.apply(|this, state| {
            let next = match state {
                StreamState::Idle {
                    local_window,
                    remote_window,
                } => {
                    if this.local_role == ConnectionRole::Server {
                        return Err(this.bad_local_transition(&state));
                    }
                    this.validate_headers(headers, HeaderBlockType::Request)?;
                    let verifier = this.request_verifier(headers)?;
                    this.request_is_head = is_head;
                    if end_stream {
                        this.check_end_of_stream(&verifier)?;
                        StreamState::HalfClosedLocalPeerIdle { local_window }
                    } else {
                        StreamState::HalfOpenLocalPeerIdle {
                            local_window,
                            local_content_length: verifier,
                            remote_window,
                        }
                    }
                }
                StreamState::HalfOpenRemoteLocalIdle {
                    local_window,
                    remote_content_length,
                    remote_window,
                } => {
                    this.validate_headers(headers, HeaderBlockType::Response)?;
                    if this.is_informational(headers, end_stream)? {
                        return Ok(state);
                    }
                    let verifier = this.response_verifier(headers)?;
                    if end_stream {
                        this.check_end_of_stream(&verifier)?;
                        StreamState::HalfClosedLocalPeerActive {
                            remote_content_length,
                            local_window,
                        }
                    } else {
                        StreamState::FullyOpen {
                            local_content_length: verifier,
                            remote_content_length,
                            local_window,
                            remote_window,
                        }
                    }
                }
                StreamState::HalfOpenLocalPeerIdle {
                    local_window,
                    local_content_length,
                    ..
                } => {
                    this.check_trailers(headers, end_stream, &local_content_length)?;
                    StreamState::HalfClosedLocalPeerIdle { local_window }
                }
                StreamState::FullyOpen {
                    local_content_length,
                    remote_content_length,
                    local_window,
                    ..
                } => {
                    this.check_trailers(headers, end_stream, &local_content_length)?;
                    StreamState::HalfClosedLocalPeerActive {
                        remote_content_length,
                        local_window,
                    }
                }
                StreamState::ReservedLocal { remote_window } => {
                    this.validate_headers(headers, HeaderBlockType::Response)?;
                    let verifier = this.response_verifier(headers)?;
                    if end_stream {
                        this.check_end_of_stream(&verifier)?;
                        StreamState::Closed { reason: None }
                    } else {
                        StreamState::HalfClosedRemoteLocalActive {
                            local_content_length: verifier,
                            remote_window,
                        }
                    }
                }
                StreamState::HalfClosedRemoteLocalIdle { remote_window } => {
                    this.validate_headers(headers, HeaderBlockType::Response)?;
                    if this.is_informational(headers, end_stream)? {
                        return Ok(state);
                    }
                    let verifier = this.response_verifier(headers)?;
                    if end_stream {
                        this.check_end_of_stream(&verifier)?;
                        StreamState::Closed { reason: None }
                    } else {
                        StreamState::HalfClosedRemoteLocalActive {
                            local_content_length: verifier,
                            remote_window,
                        }
                    }
                }
                StreamState::HalfClosedRemoteLocalActive {
                    local_content_length,
                    ..
                } => {
                    this.check_trailers(headers, end_stream, &local_content_length)?;
                    StreamState::Closed { reason: None }
                }
                StreamState::Closed { reason } => return Err(this.closed(reason)),
                StreamState::ReservedRemote { .. }
                | StreamState::HalfClosedLocalPeerIdle { .. }
                | StreamState::HalfClosedLocalPeerActive { .. } => {
                    return Err(this.bad_local_transition(&state))
                }
            };
            Ok(next)
        })
    }

    pub fn receive_headers(&mut self, headers: &Headers, end_stream: bool) -> StateMachineResultWithEffect {
        let is_head = is_head_request(headers);
        self.apply(|this, state| {
            let next = match state {
                StreamState::Idle {
                    local_window,
                    remote_window,
                } => {
                    if this.local_role == ConnectionRole::Client {
                        return Err(this.bad_remote_transition(&state));
                    }
                    this.validate_headers(headers, HeaderBlockType::Request)?;
                    let verifier = this.request_verifier(headers)?;
                    this.request_is_head = is_head;
                    if end_stream {
                        this.check_end_of_stream(&verifier)?;
                        StreamState::HalfClosedRemoteLocalIdle { remote_window }
                    } else {
                        StreamState::HalfOpenRemoteLocalIdle {
                            local_window,
                            remote_content_length: verifier,
                            remote_window,
                        }
                    }
                }
                StreamState::HalfOpenLocalPeerIdle {
                    local_window,
                    local_content_length,
                    remote_window,
                } => {
                    this.validate_headers(headers, HeaderBlockType::Response)?;
                    if this.is_informational(headers, end_stream)? {
                        return Ok(state);
                    }
                    let verifier = this.response_verifier(headers)?;
                    if end_stream {
                        this.check_end_of_stream(&verifier)?;
                        StreamState::HalfClosedRemoteLocalActive {
                            local_content_length,
                            remote_window,
                        }
                    } else {
                        StreamState::FullyOpen {
                            local_content_length,
                            remote_content_length: verifier,
                            local_window,
                            remote_window,
                        }
                    }
                }
                StreamState::HalfOpenRemoteLocalIdle {
                    remote_content_length,
                    remote_window,
                    ..
                } => {
                    this.check_trailers(headers, end_stream, &remote_content_length)?;
                    StreamState::HalfClosedRemoteLocalIdle { remote_window }
                }
                StreamState::FullyOpen {
                    local_content_length,
                    remote_content_length,
                    remote_window,
                    ..
                } => {
                    this.check_trailers(headers, end_stream, &remote_content_length)?;
                    StreamState::HalfClosedRemoteLocalActive {
                        local_content_length,
                        remote_window,
                    }
                }
                StreamState::ReservedRemote { local_window } => {
                    this.validate_headers(headers, HeaderBlockType::Response)?;
                    let verifier = this.response_verifier(headers)?;
                    if end_stream {
                        this.check_end_of_stream(&verifier)?;
                        StreamState::Closed { reason: None }
                    } else {
                        StreamState::HalfClosedLocalPeerActive {
                            remote_content_length: verifier,
                            local_window,
                        }
                    }
                }
                StreamState::HalfClosedLocalPeerIdle { local_window } => {
                    this.validate_headers(headers, HeaderBlockType::Response)?;
                    if this.is_informational(headers, end_stream)? {
                        return Ok(state);
                    }
                    let verifier = this.response_verifier(headers)?;
                    if end_stream {
                        this.check_end_of_stream(&verifier)?;
                        StreamState::Closed { reason: None }
                    } else {
                        StreamState::HalfClosedLocalPeerActive {
                            remote_content_length: verifier,
                            local_window,
                        }
                    }
                }
                StreamState::HalfClosedLocalPeerActive {
                    remote_content_length,
                    ..
                } => {
                    this.check_trailers(headers, end_stream, &remote_content_length)?;
                    StreamState::Closed { reason: None }
                }
                StreamState::HalfClosedRemoteLocalIdle { .. }
                | StreamState::HalfClosedRemoteLocalActive { .. } => {
                    return Err(this.closed(None))
                }
                StreamState::Closed { reason } => return Err(this.closed(reason)),
                StreamState::ReservedLocal { .. } => return Err(this.bad_remote_transition(&state)),
            };
            Ok(next)
        })
    }

    // Data

    /// Account for outbound DATA
    ///
    /// `content_length` is the body bytes, `flow_controlled_length` what the
    /// frame costs against the window.
    pub fn send_data(
        &mut self,
        content_length: usize,
        flow_controlled_length: usize,
        end_stream: bool,
    ) -> StateMachineResultWithEffect {
        self.apply(|this, state| {
            let next = match state {
                StreamState::HalfOpenLocalPeerIdle {
                    local_window,
                    mut local_content_length,
                    mut remote_window,
                } => {
                    this.consume(&mut remote_window, flow_controlled_length)?;
                    this.body_chunk(&mut local_content_length, content_length, end_stream)?;
                    if end_stream {
                        StreamState::HalfClosedLocalPeerIdle { local_window }
                    } else {
                        StreamState::HalfOpenLocalPeerIdle {
                            local_window,
                            local_content_length,
                            remote_window,
                        }
                    }
                }
                StreamState::FullyOpen {
                    mut local_content_length,
                    remote_content_length,
                    local_window,
                    mut remote_window,
                } => {
                    this.consume(&mut remote_window, flow_controlled_length)?;
                    this.body_chunk(&mut local_content_length, content_length, end_stream)?;
                    if end_stream {
                        StreamState::HalfClosedLocalPeerActive {
                            remote_content_length,
                            local_window,
                        }
                    } else {
                        StreamState::FullyOpen {
                            local_content_length,
                            remote_content_length,
                            local_window,
                            remote_window,
                        }
                    }
                }
                StreamState::HalfClosedRemoteLocalActive {
                    mut local_content_length,
                    mut remote_window,
                } => {
                    this.consume(&mut remote_window, flow_controlled_length)?;
                    this.body_chunk(&mut local_content_length, content_length, end_stream)?;
                    if end_stream {
                        StreamState::Closed { reason: None }
                    } else {
                        StreamState::HalfClosedRemoteLocalActive {
                            local_content_length,
                            remote_window,
                        }
                    }
                }
                StreamState::Closed { reason } => return Err(this.closed(reason)),
                StreamState::HalfClosedLocalPeerIdle { .. }
                | StreamState::HalfClosedLocalPeerActive { .. } => return Err(this.closed(None)),
                _ => return Err(this.bad_local_transition(&state)),
            };
            Ok(next)
        })
    }

    /// Account for inbound DATA
    pub fn receive_data(
        &mut self,
        content_length: usize,
        flow_controlled_length: usize,
        end_stream: bool,
    ) -> StateMachineResultWithEffect {
        self.apply(|this, state| {
            let next = match state {
                StreamState::HalfOpenRemoteLocalIdle {
                    mut local_window,
                    mut remote_content_length,
                    remote_window,
                } => {
                    this.consume(&mut local_window, flow_controlled_length)?;
                    this.body_chunk(&mut remote_content_length, content_length, end_stream)?;
                    if end_stream {
                        StreamState::HalfClosedRemoteLocalIdle { remote_window }
                    } else {
                        StreamState::HalfOpenRemoteLocalIdle {
                            local_window,
                            remote_content_length,
                            remote_window,
                        }
                    }
                }
                StreamState::FullyOpen {
                    local_content_length,
                    mut remote_content_length,
                    mut local_window,
                    remote_window,
                } => {
                    this.consume(&mut local_window, flow_controlled_length)?;
                    this.body_chunk(&mut remote_content_length, content_length, end_stream)?;
                    if end_stream {
                        StreamState::HalfClosedRemoteLocalActive {
                            local_content_length,
                            remote_window,
                        }
                    } else {
                        StreamState::FullyOpen {
                            local_content_length,
                            remote_content_length,
                            local_window,
                            remote_window,
                        }
                    }
                }
                StreamState::HalfClosedLocalPeerActive {
                    mut remote_content_length,
                    mut local_window,
                } => {
                    this.consume(&mut local_window, flow_controlled_length)?;
                    this.body_chunk(&mut remote_content_length, content_length, end_stream)?;
                    if end_stream {
                        StreamState::Closed { reason: None }
                    } else {
                        StreamState::HalfClosedLocalPeerActive {
                            remote_content_length,
                            local_window,
                        }
                    }
                }
                StreamState::Idle { .. } => return Err(this.bad_remote_transition(&state)),
                StreamState::Closed { reason } => return Err(this.closed(reason)),
                _ => return Err(this.closed(None)),
            };
            Ok(next)
        })
    }

    // Push

    /// Check that a PUSH_PROMISE may be sent on this (parent) stream
    pub fn send_push_promise(&mut self, headers: &Headers) -> StateMachineResultWithEffect {
        self.apply(|this, state| {
            let request_open = matches!(
                state,
                StreamState::HalfOpenRemoteLocalIdle { .. }
                    | StreamState::FullyOpen { .. }
                    | StreamState::HalfClosedRemoteLocalIdle { .. }
                    | StreamState::HalfClosedRemoteLocalActive { .. }
            );
            if this.local_role != ConnectionRole::Server || !request_open {
                return match state {
                    StreamState::Closed { reason } => Err(this.closed(reason)),
                    _ => Err(this.bad_local_transition(&state)),
                };
            }
            this.validate_headers(headers, HeaderBlockType::Request)?;
            Ok(state)
        })
    }

    /// Check that a PUSH_PROMISE may be received on this (parent) stream
    pub fn receive_push_promise(&mut self, headers: &Headers) -> StateMachineResultWithEffect {
        self.apply(|this, state| {
            let request_open = matches!(
                state,
                StreamState::HalfOpenLocalPeerIdle { .. }
                    | StreamState::FullyOpen { .. }
                    | StreamState::HalfClosedLocalPeerIdle { .. }
                    | StreamState::HalfClosedLocalPeerActive { .. }
            );
            if this.local_role != ConnectionRole::Client || !request_open {
                return match state {
                    StreamState::Closed { reason } => Err(this.closed(reason)),
                    _ => Err(this.bad_remote_transition(&state)),
                };
            }
            this.validate_headers(headers, HeaderBlockType::Request)?;
            Ok(state)
        })
    }

    // Window updates

    /// We grant the peer more room
    pub fn send_window_update(&mut self, increment: u32) -> StateMachineResultWithEffect {
        self.apply(|this, mut state| {
            if increment == 0 {
                return Err(this.stream_error(Error::InvalidWindowIncrementSize));
            }
            match state {
                StreamState::Idle { .. } | StreamState::ReservedLocal { .. } => {
                    return Err(this.bad_local_transition(&state))
                }
                StreamState::Closed { reason } => return Err(this.closed(reason)),
                _ => {}
            }
            // Half-closed (remote) has no inbound window left to grow
            if let Some(window) = state.local_window_mut() {
                window
                    .window_update(increment)
                    .map_err(|e| this.stream_error(e))?;
            }
            Ok(state)
        })
    }

    /// The peer grants us more room
    pub fn receive_window_update(&mut self, increment: u32) -> StateMachineResultWithEffect {
        self.apply(|this, mut state| {
            if increment == 0 {
                return Err(this.stream_error(Error::InvalidWindowIncrementSize));
            }
            match state {
                StreamState::Idle { .. } | StreamState::ReservedRemote { .. } => {
                    return Err(this.bad_remote_transition(&state))
                }
                StreamState::Closed { reason } => return Err(this.closed(reason)),
                _ => {}
            }
            // Once we have half-closed there is nothing left to send; a late
            // update is tolerated and dropped.
            if let Some(window) = state.remote_window_mut() {
                window
                    .window_update(increment)
                    .map_err(|e| this.stream_error(e))?;
            }
            Ok(state)
        })
    }

    // Reset

    /// Always legal, including on idle streams for locally detected errors
    pub fn send_rst_stream(&mut self, reason: ErrorCode) -> StateMachineResultWithEffect {
        self.apply(|_, state| match state {
            StreamState::Closed { .. } => Ok(state),
            _ => Ok(StreamState::Closed {
                reason: Some(reason),
            }),
        })
    }

    pub fn receive_rst_stream(&mut self, reason: ErrorCode) -> StateMachineResultWithEffect {
        self.apply(|this, state| match state {
            StreamState::Idle { .. } => Err(this.bad_remote_transition(&state)),
            StreamState::Closed { .. } => Ok(state),
            _ => Ok(StreamState::Closed {
                reason: Some(reason),
            }),
        })
    }

    // Settings

    /// Our SETTINGS_INITIAL_WINDOW_SIZE changed by `delta`
    pub fn local_initial_window_size_changed(&mut self, delta: i32) -> Result<()> {
        if let Some(window) = self.state.local_window_mut() {
            window.initial_size_changed(delta)?;
        }
        Ok(())
    }

    /// The peer's SETTINGS_INITIAL_WINDOW_SIZE changed by `delta`
    pub fn remote_initial_window_size_changed(&mut self, delta: i32) -> Result<()> {
        if let Some(window) = self.state.remote_window_mut() {
            window.initial_size_changed(delta)?;
        }
        Ok(())
    }

    /// Run a transition; the state is only replaced if it succeeds
    fn apply<F>(&mut self, transition: F) -> StateMachineResultWithEffect
    where
        F: FnOnce(&mut Self, StreamState) -> Step,
    {
        let before = self.state;
        match transition(self, before) {
            Ok(after) => {
                self.state = after;
                StateMachineResultWithEffect::succeed(self.lifecycle_effect(&before, &after))
            }
            Err(result) => StateMachineResultWithEffect::new(result, None),
        }
    }

    fn lifecycle_effect(&self, before: &StreamState, after: &StreamState) -> Option<StateChange> {
        let stream_id = self.stream_id;
        if before.is_inactive() && after.is_closed() {
            Some(StateChange::StreamCreatedAndClosed { stream_id })
        } else if before.is_inactive() && after.is_active() {
            Some(StateChange::StreamCreated(StreamCreated {
                stream_id,
                local_stream_window_size: before.local_window_size(),
                remote_stream_window_size: before.remote_window_size(),
            }))
        } else if let (true, StreamState::Closed { reason }) = (before.is_active(), after) {
            Some(StateChange::StreamClosed(StreamClosed {
                stream_id,
                reason: *reason,
            }))
        } else {
            None
        }
    }


    fn stream_error(&self, error: Error) -> StateMachineResult {
        StateMachineResult::stream_error(self.stream_id, error)
    }

    fn closed(&self, reason: Option<ErrorCode>) -> StateMachineResult {
        self.stream_error(Error::StreamClosed {
            stream_id: self.stream_id,
            error_code: reason,
        })
    }

    /// Something we tried to send that this state does not allow
    fn bad_local_transition(&self, state: &StreamState) -> StateMachineResult {
        self.stream_error(Error::BadStreamStateTransition { from: state.name() })
    }

    /// Something the peer sent that this state does not allow
    fn bad_remote_transition(&self, state: &StreamState) -> StateMachineResult {
        StateMachineResult::connection_error(Error::BadStreamStateTransition { from: state.name() })
    }

    fn validate_headers(&self, headers: &Headers, block_type: HeaderBlockType) -> Check {
        if self.validation.headers {
            header_validation::validate(headers, block_type).map_err(|e| self.stream_error(e))?;
        }
        Ok(())
    }

    /// Whether this is a 1xx block that leaves the state unchanged
    fn is_informational(
        &self,
        headers: &Headers,
        end_stream: bool,
    ) -> std::result::Result<bool, StateMachineResult> {
        if !header_validation::is_informational_response(headers) {
            return Ok(false);
        }
        if end_stream {
            return Err(self.stream_error(Error::Protocol(
                "informational response with END_STREAM".into(),
            )));
        }
        Ok(true)
    }

    fn request_verifier(
        &self,
        headers: &Headers,
    ) -> std::result::Result<ContentLengthVerifier, StateMachineResult> {
        if !self.validation.content_length {
            return Ok(ContentLengthVerifier::DISABLED);
        }
        ContentLengthVerifier::from_headers(headers).map_err(|e| self.stream_error(e))
    }

    fn response_verifier(
        &self,
        headers: &Headers,
    ) -> std::result::Result<ContentLengthVerifier, StateMachineResult> {
        if !self.validation.content_length {
            return Ok(ContentLengthVerifier::DISABLED);
        }
        ContentLengthVerifier::for_response(headers, self.request_is_head)
            .map_err(|e| self.stream_error(e))
    }

    fn check_end_of_stream(&self, verifier: &ContentLengthVerifier) -> Check {
        verifier.end_of_stream().map_err(|e| self.stream_error(e))
    }

    fn check_trailers(
        &self,
        headers: &Headers,
        end_stream: bool,
        verifier: &ContentLengthVerifier,
    ) -> Check {
        if !end_stream {
            return Err(self.stream_error(Error::TrailersWithoutEndStream));
        }
        self.validate_headers(headers, HeaderBlockType::Trailers)?;
        self.check_end_of_stream(verifier)
    }

    fn consume(&self, window: &mut FlowControlWindow, length: usize) -> Check {
        window.consume(length).map_err(|e| self.stream_error(e))
    }

    fn body_chunk(
        &self,
        verifier: &mut ContentLengthVerifier,
        length: usize,
        end_stream: bool,
    ) -> Check {
        verifier
            .received_data_chunk(length)
            .map_err(|e| self.stream_error(e))?;
        if end_stream {
            self.check_end_of_stream(verifier)?;
        }
        Ok(())
    }
}

type Check = std::result::Result<(), StateMachineResult>;

fn is_head_request(headers: &Headers) -> bool {
    headers.get(":method") == Some(&b"HEAD"[..])
}
