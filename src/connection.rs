//! HTTP/2 connection state machine
//!
//! [`ConnectionStateMachine`] validates every frame sent or received on one
//! connection. It tracks the preface exchange, both SETTINGS ledgers, the
//! connection-level flow-control windows, the stream collection and the
//! GOAWAY-driven shutdown. It performs no I/O: callers feed it decoded frames
//! and act on the returned [`StateMachineResultWithEffect`].
//!
//! ```text
//!               send SETTINGS              recv SETTINGS
//!   Idle ------------------> PrefaceSent ---------------> Active
//!     |                                                   ^   |
//!     | recv SETTINGS                       send SETTINGS |   | GOAWAY
//!     +-------------------> PrefaceReceived --------------+   v
//!                                          LocallyQuiesced / RemotelyQuiesced
//!                                                   |
//!                                             BothQuiescing
//!                                                   |
//!                                             FullyQuiesced
//! ```

use crate::config::ConnectionConfig;
use crate::dos_heuristics::DosHeuristics;
use crate::effects::{
    FlowControlChange, SettingsChange, StateChange, StateMachineResult,
    StateMachineResultWithEffect, StreamWindowSizeChange,
};
use crate::error::{Error, ErrorCode, Result};
use crate::flow_control::FlowControlWindow;
use crate::frames::{Frame, FramePayload, SettingsFrame};
use crate::headers::Headers;
use crate::settings::{Settings, SettingsLedger, SettingsParameter, SettingsValues};
use crate::stream::{StreamState, StreamStateMachine, StreamValidation};
use crate::stream_collection::{MissingStreamPolicy, StreamCollection};
use crate::stream_id::StreamId;
use crate::DEFAULT_INITIAL_WINDOW_SIZE;
use std::fmt;
use tracing::{debug, warn};

/// Which end of the connection we are
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionRole {
    Client,
    Server,
}

impl ConnectionRole {
    /// The role of the other endpoint
    pub fn peer(self) -> Self {
        match self {
            ConnectionRole::Client => ConnectionRole::Server,
            ConnectionRole::Server => ConnectionRole::Client,
        }
    }

    /// Whether streams with this ID are opened by this role
    pub fn initiates(self, stream_id: StreamId) -> bool {
        match self {
            ConnectionRole::Client => stream_id.is_client_initiated(),
            ConnectionRole::Server => stream_id.is_server_initiated(),
        }
    }
}

impl fmt::Display for ConnectionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionRole::Client => write!(f, "client"),
            ConnectionRole::Server => write!(f, "server"),
        }
    }
}

/// Follow-up the caller must perform after an inbound frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostFrameOperation {
    Nothing,
    /// Write a SETTINGS or PING acknowledgement
    SendAck,
}

/// Lifecycle phase of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStateKind {
    Idle,
    PrefaceSent,
    PrefaceReceived,
    Active,
    /// We sent GOAWAY
    LocallyQuiesced,
    /// The peer sent GOAWAY
    RemotelyQuiesced,
    BothQuiescing,
    /// We sent our preface and GOAWAY before the peer's preface arrived
    QuiescingPrefaceSent,
    /// The peer sent its preface and GOAWAY before we sent ours
    QuiescingPrefaceReceived,
    FullyQuiesced,
}

impl ConnectionStateKind {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionStateKind::Idle => "idle",
            ConnectionStateKind::PrefaceSent => "prefaceSent",
            ConnectionStateKind::PrefaceReceived => "prefaceReceived",
            ConnectionStateKind::Active => "active",
            ConnectionStateKind::LocallyQuiesced => "locallyQuiesced",
            ConnectionStateKind::RemotelyQuiesced => "remotelyQuiesced",
            ConnectionStateKind::BothQuiescing => "bothQuiescing",
            ConnectionStateKind::QuiescingPrefaceSent => "quiescingPrefaceSent",
            ConnectionStateKind::QuiescingPrefaceReceived => "quiescingPrefaceReceived",
            ConnectionStateKind::FullyQuiesced => "fullyQuiesced",
        }
    }

    /// Whether our preface has gone out
    pub fn has_sent_preface(&self) -> bool {
        !matches!(
            self,
            ConnectionStateKind::Idle
                | ConnectionStateKind::PrefaceReceived
                | ConnectionStateKind::QuiescingPrefaceReceived
                | ConnectionStateKind::FullyQuiesced
        )
    }

    /// Whether the peer's preface has arrived
    pub fn has_received_preface(&self) -> bool {
        !matches!(
            self,
            ConnectionStateKind::Idle
                | ConnectionStateKind::PrefaceSent
                | ConnectionStateKind::QuiescingPrefaceSent
                | ConnectionStateKind::FullyQuiesced
        )
    }

    pub fn is_quiescing(&self) -> bool {
        matches!(
            self,
            ConnectionStateKind::LocallyQuiesced
                | ConnectionStateKind::RemotelyQuiesced
                | ConnectionStateKind::BothQuiescing
                | ConnectionStateKind::QuiescingPrefaceSent
                | ConnectionStateKind::QuiescingPrefaceReceived
        )
    }
}

impl fmt::Display for ConnectionStateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Everything a connection tracks once either preface is under way
#[derive(Debug, Clone)]
struct ConnectionData {
    /// SETTINGS we sent; values take effect on ACK
    local_settings: SettingsLedger,
    /// SETTINGS the peer sent
    remote_settings: SettingsLedger,
    streams: StreamCollection,
    /// Bytes the peer may still send on the connection
    local_window: FlowControlWindow,
    /// Bytes we may still send on the connection
    remote_window: FlowControlWindow,
}

impl ConnectionData {
    fn new(role: ConnectionRole) -> Self {
        ConnectionData {
            local_settings: SettingsLedger::new(),
            remote_settings: SettingsLedger::new(),
            streams: StreamCollection::new(role),
            local_window: FlowControlWindow::new(DEFAULT_INITIAL_WINDOW_SIZE),
            remote_window: FlowControlWindow::new(DEFAULT_INITIAL_WINDOW_SIZE),
        }
    }

    fn flow_control_change(&self, stream_id: Option<StreamId>) -> StateChange {
        let stream = stream_id.map(|stream_id| {
            let stream = self.streams.get(stream_id);
            StreamWindowSizeChange {
                stream_id,
                local_stream_window_size: stream.and_then(|s| s.local_window_size()),
                remote_stream_window_size: stream.and_then(|s| s.remote_window_size()),
            }
        });
        StateChange::FlowControlChange(FlowControlChange {
            local_connection_window_size: self.local_window.size(),
            remote_connection_window_size: self.remote_window.size(),
            stream,
        })
    }

    /// Drop streams opened by `initiator` above `last_stream_id`
    fn quiesce(&mut self, last_stream_id: StreamId, initiator: ConnectionRole) -> Option<StateChange> {
        let closed_streams = self
            .streams
            .drop_all_streams_with_id_higher_than(last_stream_id, initiator);
        if closed_streams.is_empty() {
            None
        } else {
            Some(StateChange::BulkStreamClosure { closed_streams })
        }
    }
}

#[derive(Debug, Clone)]
enum ConnectionState {
    Idle,
    PrefaceSent(ConnectionData),
    PrefaceReceived(ConnectionData),
    Active(ConnectionData),
    LocallyQuiesced {
        data: ConnectionData,
        /// Highest peer stream we promised to process
        last_peer_stream_id: StreamId,
    },
    RemotelyQuiesced {
        data: ConnectionData,
        /// Highest of our streams the peer will process
        last_local_stream_id: StreamId,
    },
    BothQuiescing {
        data: ConnectionData,
        last_peer_stream_id: StreamId,
        last_local_stream_id: StreamId,
    },
    QuiescingPrefaceSent {
        data: ConnectionData,
        last_peer_stream_id: StreamId,
    },
    QuiescingPrefaceReceived {
        data: ConnectionData,
        last_local_stream_id: StreamId,
    },
    FullyQuiesced,
    /// Held only while a transition is computed
    Modifying,
}

impl ConnectionState {
    fn kind(&self) -> ConnectionStateKind {
        match self {
            ConnectionState::Idle => ConnectionStateKind::Idle,
            ConnectionState::PrefaceSent(_) => ConnectionStateKind::PrefaceSent,
            ConnectionState::PrefaceReceived(_) => ConnectionStateKind::PrefaceReceived,
            ConnectionState::Active(_) => ConnectionStateKind::Active,
            ConnectionState::LocallyQuiesced { .. } => ConnectionStateKind::LocallyQuiesced,
            ConnectionState::RemotelyQuiesced { .. } => ConnectionStateKind::RemotelyQuiesced,
            ConnectionState::BothQuiescing { .. } => ConnectionStateKind::BothQuiescing,
            ConnectionState::QuiescingPrefaceSent { .. } => {
                ConnectionStateKind::QuiescingPrefaceSent
            }
            ConnectionState::QuiescingPrefaceReceived { .. } => {
                ConnectionStateKind::QuiescingPrefaceReceived
            }
            ConnectionState::FullyQuiesced => ConnectionStateKind::FullyQuiesced,
            ConnectionState::Modifying => {
                unreachable!("connection state observed mid-transition")
            }
        }
    }

    fn data(&self) -> Option<&ConnectionData> {
        match self {
            ConnectionState::PrefaceSent(data)
            | ConnectionState::PrefaceReceived(data)
            | ConnectionState::Active(data)
            | ConnectionState::LocallyQuiesced { data, .. }
            | ConnectionState::RemotelyQuiesced { data, .. }
            | ConnectionState::BothQuiescing { data, .. }
            | ConnectionState::QuiescingPrefaceSent { data, .. }
            | ConnectionState::QuiescingPrefaceReceived { data, .. } => Some(data),
            _ => None,
        }
    }

    fn data_mut(&mut self) -> Option<&mut ConnectionData> {
        match self {
            ConnectionState::PrefaceSent(data)
            | ConnectionState::PrefaceReceived(data)
            | ConnectionState::Active(data)
            | ConnectionState::LocallyQuiesced { data, .. }
            | ConnectionState::RemotelyQuiesced { data, .. }
            | ConnectionState::BothQuiescing { data, .. }
            | ConnectionState::QuiescingPrefaceSent { data, .. }
            | ConnectionState::QuiescingPrefaceReceived { data, .. } => Some(data),
            _ => None,
        }
    }

    /// Last stream ID from a GOAWAY we sent
    fn sent_goaway(&self) -> Option<StreamId> {
        match self {
            ConnectionState::LocallyQuiesced {
                last_peer_stream_id,
                ..
            }
            | ConnectionState::BothQuiescing {
                last_peer_stream_id,
                ..
            }
            | ConnectionState::QuiescingPrefaceSent {
                last_peer_stream_id,
                ..
            } => Some(*last_peer_stream_id),
            _ => None,
        }
    }

    /// Last stream ID from a GOAWAY the peer sent
    fn received_goaway(&self) -> Option<StreamId> {
        match self {
            ConnectionState::RemotelyQuiesced {
                last_local_stream_id,
                ..
            }
            | ConnectionState::BothQuiescing {
                last_local_stream_id,
                ..
            }
            | ConnectionState::QuiescingPrefaceReceived {
                last_local_stream_id,
                ..
            } => Some(*last_local_stream_id),
            _ => None,
        }
    }
}

/// Lower the advertised last stream ID; never raise it
fn ratchet(current: &mut StreamId, requested: StreamId) -> bool {
    if requested < *current {
        *current = requested;
        true
    } else {
        false
    }
}

#[derive(Debug, Clone, Copy)]
enum SettingsSide {
    /// Our SETTINGS, applied on ACK
    Local,
    /// The peer's SETTINGS, applied on receipt
    Remote,
}

/// Feed one settings change into the stream collection and the change summary
fn apply_setting(
    side: SettingsSide,
    role: ConnectionRole,
    streams: &mut StreamCollection,
    change: &mut SettingsChange,
    parameter: SettingsParameter,
    old: Option<u32>,
    new: u32,
) -> Result<()> {
    match parameter {
        SettingsParameter::InitialWindowSize => {
            let old = old.unwrap_or(DEFAULT_INITIAL_WINDOW_SIZE);
            let delta = (i64::from(new) - i64::from(old)) as i32;
            match side {
                SettingsSide::Local => streams.local_initial_window_size_changed(delta)?,
                SettingsSide::Remote => streams.remote_initial_window_size_changed(delta)?,
            }
            change.stream_window_size_change += delta;
        }
        SettingsParameter::MaxConcurrentStreams => {
            // Our value caps the peer's streams, theirs caps ours
            let limited = match side {
                SettingsSide::Local => role.peer(),
                SettingsSide::Remote => role,
            };
            streams.set_max_streams(limited, Some(new));
            change.new_max_concurrent_streams = Some(new);
        }
        SettingsParameter::HeaderTableSize => change.new_header_table_size = Some(new),
        SettingsParameter::MaxFrameSize => change.new_max_frame_size = Some(new),
        SettingsParameter::MaxHeaderListSize => change.new_max_header_list_size = Some(new),
        _ => {}
    }
    Ok(())
}

type Guard = std::result::Result<(), StateMachineResultWithEffect>;

/// Protocol state of one HTTP/2 connection
#[derive(Debug, Clone)]
pub struct ConnectionStateMachine {
    role: ConnectionRole,
    validation: StreamValidation,
    dos_heuristics: DosHeuristics,
    state: ConnectionState,
}

impl ConnectionStateMachine {
    /// Create a connection in the idle state
    pub fn new(role: ConnectionRole, config: &ConnectionConfig) -> Self {
        ConnectionStateMachine {
            role,
            validation: StreamValidation {
                headers: config.header_block_validation(),
                content_length: config.content_length_validation(),
            },
            dos_heuristics: DosHeuristics::new(config.max_sequential_empty_data_frames()),
            state: ConnectionState::Idle,
        }
    }

    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    pub fn state(&self) -> ConnectionStateKind {
        self.state.kind()
    }

    /// State of a stream still tracked by the connection
    pub fn stream_state(&self, stream_id: StreamId) -> Option<&StreamState> {
        self.state
            .data()
            .and_then(|data| data.streams.get(stream_id))
            .map(|stream| stream.state())
    }

    /// Number of streams not yet closed
    pub fn open_streams(&self) -> usize {
        self.state.data().map_or(0, |data| data.streams.len())
    }

    /// Highest stream ID the peer has opened
    pub fn last_peer_initiated_stream_id(&self) -> StreamId {
        self.state.data().map_or(StreamId::ROOT, |data| {
            data.streams.last_stream_id(self.role.peer())
        })
    }

    /// Bytes the peer may still send on the connection
    pub fn local_connection_window_size(&self) -> Option<i32> {
        self.state.data().map(|data| data.local_window.size())
    }

    /// Bytes we may still send on the connection
    pub fn remote_connection_window_size(&self) -> Option<i32> {
        self.state.data().map(|data| data.remote_window.size())
    }

    /// Our acknowledged SETTINGS
    pub fn local_settings(&self) -> Option<&SettingsValues> {
        self.state.data().map(|data| data.local_settings.values())
    }

    /// The peer's SETTINGS
    pub fn remote_settings(&self) -> Option<&SettingsValues> {
        self.state.data().map(|data| data.remote_settings.values())
    }

    // Frame dispatch

    /// Validate an inbound frame
    ///
    /// `flow_controlled_length` is the frame's flow-controlled size as
    /// reported by the decoder; it only matters for DATA.
    pub fn receive_frame(
        &mut self,
        frame: &Frame,
        flow_controlled_length: usize,
    ) -> (StateMachineResultWithEffect, PostFrameOperation) {
        let stream_id = frame.stream_id;
        let outcome = match &frame.payload {
            FramePayload::Data(data) => self.receive_data(
                stream_id,
                data.data.len(),
                flow_controlled_length,
                data.end_stream,
            ),
            FramePayload::Headers(headers) => {
                self.receive_headers(stream_id, &headers.headers, headers.end_stream)
            }
            FramePayload::Priority(_) => self.receive_priority(),
            FramePayload::RstStream(code) => self.receive_rst_stream(stream_id, *code),
            FramePayload::Settings(settings) => return self.receive_settings(settings),
            FramePayload::PushPromise(push) => {
                self.receive_push_promise(stream_id, push.promised_stream_id, &push.headers)
            }
            FramePayload::Ping(ping) => return self.receive_ping(ping.ack),
            FramePayload::Goaway(goaway) => self.receive_goaway(goaway.last_stream_id),
            FramePayload::WindowUpdate(increment) => {
                self.receive_window_update(stream_id, *increment)
            }
            FramePayload::AltSvc(_) => self.receive_alt_svc(stream_id),
            FramePayload::Origin(_) => self.receive_origin(stream_id),
        };
        (outcome, PostFrameOperation::Nothing)
    }

    /// Validate an outbound frame
    pub fn send_frame(&mut self, frame: &Frame) -> StateMachineResultWithEffect {
        let stream_id = frame.stream_id;
        match &frame.payload {
            FramePayload::Data(data) => {
                let padding = data.padding.map_or(0, |pad| usize::from(pad) + 1);
                self.send_data(
                    stream_id,
                    data.data.len(),
                    data.data.len() + padding,
                    data.end_stream,
                )
            }
            FramePayload::Headers(headers) => {
                self.send_headers(stream_id, &headers.headers, headers.end_stream)
            }
            FramePayload::Priority(_) => self.send_priority(),
            FramePayload::RstStream(code) => self.send_rst_stream(stream_id, *code),
            FramePayload::Settings(SettingsFrame::Settings(settings)) => {
                self.send_settings(settings.clone())
            }
            FramePayload::Settings(SettingsFrame::Ack) => self.send_settings_ack(),
            FramePayload::PushPromise(push) => {
                self.send_push_promise(stream_id, push.promised_stream_id, &push.headers)
            }
            FramePayload::Ping(_) => self.send_ping(),
            FramePayload::Goaway(goaway) => self.send_goaway(goaway.last_stream_id),
            FramePayload::WindowUpdate(increment) => self.send_window_update(stream_id, *increment),
            FramePayload::AltSvc(_) => self.send_alt_svc(),
            FramePayload::Origin(_) => self.send_origin(stream_id),
        }
    }

    // SETTINGS

    /// Send SETTINGS; the first call is our connection preface
    pub fn send_settings(&mut self, settings: Settings) -> StateMachineResultWithEffect {
        if let Err(error) = settings.validate() {
            return self.finish("send SETTINGS", StateMachineResultWithEffect::connection_error(error));
        }
        let role = self.role;
        let outcome = self.transition(|state| match state {
            ConnectionState::Idle => {
                let mut data = ConnectionData::new(role);
                data.local_settings.emit_settings(settings);
                (ConnectionState::PrefaceSent(data), StateMachineResultWithEffect::succeed(None))
            }
            ConnectionState::PrefaceReceived(mut data) => {
                data.local_settings.emit_settings(settings);
                (ConnectionState::Active(data), StateMachineResultWithEffect::succeed(None))
            }
            ConnectionState::QuiescingPrefaceReceived {
                mut data,
                last_local_stream_id,
            } => {
                data.local_settings.emit_settings(settings);
                (
                    ConnectionState::RemotelyQuiesced {
                        data,
                        last_local_stream_id,
                    },
                    StateMachineResultWithEffect::succeed(None),
                )
            }
            ConnectionState::FullyQuiesced => (
                ConnectionState::FullyQuiesced,
                StateMachineResultWithEffect::connection_error(Error::IoOnClosedConnection),
            ),
            mut state => {
                if let Some(data) = state.data_mut() {
                    data.local_settings.emit_settings(settings);
                }
                (state, StateMachineResultWithEffect::succeed(None))
            }
        });
        self.close_if_needed();
        self.finish("send SETTINGS", outcome)
    }

    pub fn send_settings_ack(&mut self) -> StateMachineResultWithEffect {
        if let Err(outcome) = self.guard_send() {
            return self.finish("send SETTINGS ACK", outcome);
        }
        StateMachineResultWithEffect::succeed(None)
    }

    /// Handle an inbound SETTINGS frame or acknowledgement
    pub fn receive_settings(
        &mut self,
        frame: &SettingsFrame,
    ) -> (StateMachineResultWithEffect, PostFrameOperation) {
        match frame {
            SettingsFrame::Ack => (self.receive_settings_ack(), PostFrameOperation::Nothing),
            SettingsFrame::Settings(settings) => self.receive_peer_settings(settings),
        }
    }

    fn receive_settings_ack(&mut self) -> StateMachineResultWithEffect {
        if let Err(outcome) = self.guard_receive() {
            return self.finish("receive SETTINGS ACK", outcome);
        }
        let role = self.role;
        let Some(data) = self.state.data_mut() else {
            return StateMachineResultWithEffect::connection_error(Error::MissingPreface);
        };

        let mut change = SettingsChange::default();
        let ConnectionData {
            local_settings,
            streams,
            ..
        } = data;
        let applied = local_settings.receive_settings_ack(|parameter, old, new| {
            apply_setting(SettingsSide::Local, role, streams, &mut change, parameter, old, new)
        });

        let outcome = match applied {
            Ok(()) => StateMachineResultWithEffect::succeed(Some(
                StateChange::LocalSettingsChanged(change),
            )),
            Err(error) => StateMachineResultWithEffect::connection_error(error),
        };
        self.finish("receive SETTINGS ACK", outcome)
    }

    fn receive_peer_settings(
        &mut self,
        settings: &Settings,
    ) -> (StateMachineResultWithEffect, PostFrameOperation) {
        if let Err(error) = settings.validate() {
            let outcome = StateMachineResultWithEffect::connection_error(error);
            return (self.finish("receive SETTINGS", outcome), PostFrameOperation::Nothing);
        }

        let role = self.role;
        let moved = self.transition(|state| match state {
            ConnectionState::Idle => (ConnectionState::PrefaceReceived(ConnectionData::new(role)), Ok(())),
            ConnectionState::PrefaceSent(data) => (ConnectionState::Active(data), Ok(())),
            ConnectionState::QuiescingPrefaceSent {
                data,
                last_peer_stream_id,
            } => (
                ConnectionState::LocallyQuiesced {
                    data,
                    last_peer_stream_id,
                },
                Ok(()),
            ),
            ConnectionState::FullyQuiesced => {
                (ConnectionState::FullyQuiesced, Err(Error::IoOnClosedConnection))
            }
            state => (state, Ok(())),
        });
        if let Err(error) = moved {
            let outcome = StateMachineResultWithEffect::connection_error(error);
            return (self.finish("receive SETTINGS", outcome), PostFrameOperation::Nothing);
        }

        let Some(data) = self.state.data_mut() else {
            let outcome = StateMachineResultWithEffect::connection_error(Error::IoOnClosedConnection);
            return (outcome, PostFrameOperation::Nothing);
        };
        let mut change = SettingsChange::default();
        let ConnectionData {
            remote_settings,
            streams,
            ..
        } = data;
        let applied = remote_settings.receive_settings(settings, |parameter, old, new| {
            apply_setting(SettingsSide::Remote, role, streams, &mut change, parameter, old, new)
        });

        match applied {
            Ok(()) => {
                self.close_if_needed();
                let outcome = StateMachineResultWithEffect::succeed(Some(
                    StateChange::RemoteSettingsChanged(change),
                ));
                (outcome, PostFrameOperation::SendAck)
            }
            Err(error) => {
                let outcome = StateMachineResultWithEffect::connection_error(error);
                (self.finish("receive SETTINGS", outcome), PostFrameOperation::Nothing)
            }
        }
    }

    // HEADERS

    pub fn send_headers(
        &mut self,
        stream_id: StreamId,
        headers: &Headers,
        end_stream: bool,
    ) -> StateMachineResultWithEffect {
        if let Err(outcome) = self.guard_send() {
            return self.finish("send HEADERS", outcome);
        }
        let (role, validation) = (self.role, self.validation);
        let quiescing = self.state.kind().is_quiescing();
        let Some(data) = self.state.data_mut() else {
            return StateMachineResultWithEffect::connection_error(Error::MissingPreface);
        };

        let outcome = if role.initiates(stream_id) {
            if quiescing && data.streams.is_idle(stream_id) {
                StateMachineResultWithEffect::stream_error(
                    stream_id,
                    Error::CreatedStreamAfterGoaway { stream_id },
                )
            } else {
                let local_window = data.local_settings.initial_window_size();
                let remote_window = data.remote_settings.initial_window_size();
                data.streams.modify_create_if_needed(
                    stream_id,
                    role,
                    |id| StreamStateMachine::new(id, role, local_window, remote_window, validation),
                    |stream| stream.send_headers(headers, end_stream),
                )
            }
        } else {
            data.streams
                .modify(stream_id, MissingStreamPolicy::Error, |stream| {
                    stream.send_headers(headers, end_stream)
                })
        };

        self.close_if_needed();
        self.finish("send HEADERS", outcome)
    }

    pub fn receive_headers(
        &mut self,
        stream_id: StreamId,
        headers: &Headers,
        end_stream: bool,
    ) -> StateMachineResultWithEffect {
        if let Err(outcome) = self.guard_receive() {
            return self.finish("receive HEADERS", outcome);
        }
        self.dos_heuristics.received_headers();
        if self.ignores_peer_stream(stream_id) {
            return StateMachineResultWithEffect::ignore();
        }

        let (role, validation) = (self.role, self.validation);
        let peer = role.peer();
        let peer_quiesced = self.state.received_goaway().is_some();
        let Some(data) = self.state.data_mut() else {
            return StateMachineResultWithEffect::connection_error(Error::MissingPreface);
        };

        let outcome = if peer.initiates(stream_id) {
            if peer_quiesced && data.streams.is_idle(stream_id) {
                StateMachineResultWithEffect::connection_error_with_code(
                    Error::CreatedStreamAfterGoaway { stream_id },
                    ErrorCode::ProtocolError,
                )
            } else {
                let local_window = data.local_settings.initial_window_size();
                let remote_window = data.remote_settings.initial_window_size();
                data.streams.modify_create_if_needed(
                    stream_id,
                    peer,
                    |id| StreamStateMachine::new(id, role, local_window, remote_window, validation),
                    |stream| stream.receive_headers(headers, end_stream),
                )
            }
        } else if data.streams.is_idle(stream_id) {
            StateMachineResultWithEffect::connection_error_with_code(
                Error::InvalidStreamIdForPeer { stream_id },
                ErrorCode::ProtocolError,
            )
        } else {
            data.streams
                .modify(stream_id, MissingStreamPolicy::Error, |stream| {
                    stream.receive_headers(headers, end_stream)
                })
        };

        self.close_if_needed();
        self.finish("receive HEADERS", outcome)
    }

    // DATA

    /// Send DATA carrying `content_length` body bytes
    pub fn send_data(
        &mut self,
        stream_id: StreamId,
        content_length: usize,
        flow_controlled_length: usize,
        end_stream: bool,
    ) -> StateMachineResultWithEffect {
        if let Err(outcome) = self.guard_send() {
            return self.finish("send DATA", outcome);
        }
        let Some(data) = self.state.data_mut() else {
            return StateMachineResultWithEffect::connection_error(Error::MissingPreface);
        };

        if i64::from(data.remote_window.size()) < flow_controlled_length as i64 {
            let outcome = StateMachineResultWithEffect::stream_error(stream_id, Error::FlowControlViolation);
            return self.finish("send DATA", outcome);
        }

        let mut outcome = data.streams.modify(stream_id, MissingStreamPolicy::Error, |stream| {
            stream.send_data(content_length, flow_controlled_length, end_stream)
        });
        if outcome.result.is_success() {
            if let Err(error) = data.remote_window.consume(flow_controlled_length) {
                return self.finish("send DATA", StateMachineResultWithEffect::connection_error(error));
            }
            if outcome.effect.is_none() {
                outcome.effect = Some(data.flow_control_change(Some(stream_id)));
            }
        }

        self.close_if_needed();
        self.finish("send DATA", outcome)
    }

    /// Receive DATA carrying `content_length` body bytes
    ///
    /// The connection window is charged even when the stream itself is gone.
    pub fn receive_data(
        &mut self,
        stream_id: StreamId,
        content_length: usize,
        flow_controlled_length: usize,
        end_stream: bool,
    ) -> StateMachineResultWithEffect {
        if let Err(outcome) = self.guard_receive() {
            return self.finish("receive DATA", outcome);
        }
        if let Err(error) = self.dos_heuristics.received_data(content_length, end_stream) {
            return self.finish("receive DATA", StateMachineResultWithEffect::connection_error(error));
        }
        let ignored = self.ignores_peer_stream(stream_id);
        let Some(data) = self.state.data_mut() else {
            return StateMachineResultWithEffect::connection_error(Error::MissingPreface);
        };

        if let Err(error) = data.local_window.consume(flow_controlled_length) {
            return self.finish("receive DATA", StateMachineResultWithEffect::connection_error(error));
        }
        if ignored {
            return StateMachineResultWithEffect::ignore();
        }

        let mut outcome = data.streams.modify(stream_id, MissingStreamPolicy::Error, |stream| {
            stream.receive_data(content_length, flow_controlled_length, end_stream)
        });
        if outcome.result.is_success() && outcome.effect.is_none() {
            outcome.effect = Some(data.flow_control_change(Some(stream_id)));
        }

        self.close_if_needed();
        self.finish("receive DATA", outcome)
    }

    // PUSH_PROMISE

    /// Promise `promised_stream_id` on the open stream `stream_id`
    pub fn send_push_promise(
        &mut self,
        stream_id: StreamId,
        promised_stream_id: StreamId,
        headers: &Headers,
    ) -> StateMachineResultWithEffect {
        if let Err(outcome) = self.guard_send() {
            return self.finish("send PUSH_PROMISE", outcome);
        }
        let (role, validation) = (self.role, self.validation);
        let quiescing = self.state.kind().is_quiescing();
        let Some(data) = self.state.data_mut() else {
            return StateMachineResultWithEffect::connection_error(Error::MissingPreface);
        };

        if !data.remote_settings.enable_push() {
            let outcome = StateMachineResultWithEffect::stream_error(stream_id, Error::PushInViolationOfSetting);
            return self.finish("send PUSH_PROMISE", outcome);
        }
        if quiescing {
            let outcome = StateMachineResultWithEffect::stream_error(
                promised_stream_id,
                Error::CreatedStreamAfterGoaway {
                    stream_id: promised_stream_id,
                },
            );
            return self.finish("send PUSH_PROMISE", outcome);
        }

        let outcome = data.streams.modify(stream_id, MissingStreamPolicy::Error, |stream| {
            stream.send_push_promise(headers)
        });
        if !outcome.result.is_success() {
            return self.finish("send PUSH_PROMISE", outcome);
        }

        let remote_window = data.remote_settings.initial_window_size();
        let pushed = StreamStateMachine::reserved_local(promised_stream_id, role, remote_window, validation);
        let outcome = match data.streams.insert_reserved(pushed) {
            Ok(()) => outcome,
            Err(error) => {
                let code = match error {
                    Error::MaxStreamsViolation => ErrorCode::RefusedStream,
                    _ => ErrorCode::ProtocolError,
                };
                StateMachineResult::StreamError {
                    stream_id: promised_stream_id,
                    underlying: error,
                    code,
                }
                .into()
            }
        };
        self.finish("send PUSH_PROMISE", outcome)
    }

    pub fn receive_push_promise(
        &mut self,
        stream_id: StreamId,
        promised_stream_id: StreamId,
        headers: &Headers,
    ) -> StateMachineResultWithEffect {
        if let Err(outcome) = self.guard_receive() {
            return self.finish("receive PUSH_PROMISE", outcome);
        }
        if self.role == ConnectionRole::Server {
            let outcome = StateMachineResultWithEffect::connection_error(Error::Protocol(
                "PUSH_PROMISE sent by a client".into(),
            ));
            return self.finish("receive PUSH_PROMISE", outcome);
        }
        if let Some(last_stream_id) = self.state.received_goaway() {
            if promised_stream_id > last_stream_id {
                let outcome = StateMachineResultWithEffect::connection_error_with_code(
                    Error::CreatedStreamAfterGoaway {
                        stream_id: promised_stream_id,
                    },
                    ErrorCode::ProtocolError,
                );
                return self.finish("receive PUSH_PROMISE", outcome);
            }
        }
        if self.ignores_peer_stream(promised_stream_id) {
            return StateMachineResultWithEffect::ignore();
        }

        let (role, validation) = (self.role, self.validation);
        let Some(data) = self.state.data_mut() else {
            return StateMachineResultWithEffect::connection_error(Error::MissingPreface);
        };
        if !data.local_settings.enable_push() {
            let outcome = StateMachineResultWithEffect::connection_error(Error::PushInViolationOfSetting);
            return self.finish("receive PUSH_PROMISE", outcome);
        }

        let outcome = data.streams.modify(stream_id, MissingStreamPolicy::Error, |stream| {
            stream.receive_push_promise(headers)
        });
        if !outcome.result.is_success() {
            return self.finish("receive PUSH_PROMISE", outcome);
        }

        let local_window = data.local_settings.initial_window_size();
        let pushed = StreamStateMachine::reserved_remote(promised_stream_id, role, local_window, validation);
        let outcome = match data.streams.insert_reserved(pushed) {
            Ok(()) => outcome,
            Err(error) => {
                StateMachineResultWithEffect::connection_error_with_code(error, ErrorCode::ProtocolError)
            }
        };
        self.finish("receive PUSH_PROMISE", outcome)
    }

    // WINDOW_UPDATE

    pub fn send_window_update(&mut self, stream_id: StreamId, increment: u32) -> StateMachineResultWithEffect {
        if let Err(outcome) = self.guard_send() {
            return self.finish("send WINDOW_UPDATE", outcome);
        }
        let Some(data) = self.state.data_mut() else {
            return StateMachineResultWithEffect::connection_error(Error::MissingPreface);
        };

        let outcome = if stream_id.is_root() {
            match data.local_window.window_update(increment) {
                Ok(()) => StateMachineResultWithEffect::succeed(Some(data.flow_control_change(None))),
                Err(error) => StateMachineResultWithEffect::connection_error(error),
            }
        } else {
            let mut outcome = data
                .streams
                .modify(stream_id, MissingStreamPolicy::IgnoreClosed, |stream| {
                    stream.send_window_update(increment)
                });
            if outcome.result.is_success() {
                outcome.effect = Some(data.flow_control_change(Some(stream_id)));
            }
            outcome
        };
        self.finish("send WINDOW_UPDATE", outcome)
    }

    pub fn receive_window_update(&mut self, stream_id: StreamId, increment: u32) -> StateMachineResultWithEffect {
        if let Err(outcome) = self.guard_receive() {
            return self.finish("receive WINDOW_UPDATE", outcome);
        }
        if self.ignores_peer_stream(stream_id) {
            return StateMachineResultWithEffect::ignore();
        }
        let Some(data) = self.state.data_mut() else {
            return StateMachineResultWithEffect::connection_error(Error::MissingPreface);
        };

        let outcome = if stream_id.is_root() {
            match data.remote_window.window_update(increment) {
                Ok(()) => StateMachineResultWithEffect::succeed(Some(data.flow_control_change(None))),
                Err(error) => StateMachineResultWithEffect::connection_error(error),
            }
        } else {
            let mut outcome = data
                .streams
                .modify(stream_id, MissingStreamPolicy::IgnoreClosed, |stream| {
                    stream.receive_window_update(increment)
                });
            if outcome.result.is_success() {
                outcome.effect = Some(data.flow_control_change(Some(stream_id)));
            }
            outcome
        };
        self.finish("receive WINDOW_UPDATE", outcome)
    }

    // RST_STREAM

    pub fn send_rst_stream(&mut self, stream_id: StreamId, reason: ErrorCode) -> StateMachineResultWithEffect {
        if let Err(outcome) = self.guard_send() {
            return self.finish("send RST_STREAM", outcome);
        }
        let Some(data) = self.state.data_mut() else {
            return StateMachineResultWithEffect::connection_error(Error::MissingPreface);
        };

        let outcome = data
            .streams
            .modify(stream_id, MissingStreamPolicy::IgnoreClosed, |stream| {
                stream.send_rst_stream(reason)
            });
        if !outcome.result.is_connection_error() {
            data.streams.record_local_reset(stream_id);
        }

        self.close_if_needed();
        self.finish("send RST_STREAM", outcome)
    }

    pub fn receive_rst_stream(&mut self, stream_id: StreamId, reason: ErrorCode) -> StateMachineResultWithEffect {
        if let Err(outcome) = self.guard_receive() {
            return self.finish("receive RST_STREAM", outcome);
        }
        if self.ignores_peer_stream(stream_id) {
            return StateMachineResultWithEffect::ignore();
        }
        let Some(data) = self.state.data_mut() else {
            return StateMachineResultWithEffect::connection_error(Error::MissingPreface);
        };

        let outcome = data
            .streams
            .modify(stream_id, MissingStreamPolicy::IgnoreClosed, |stream| {
                stream.receive_rst_stream(reason)
            });

        self.close_if_needed();
        self.finish("receive RST_STREAM", outcome)
    }

    // PRIORITY, PING

    /// PRIORITY frames never change stream state
    pub fn send_priority(&mut self) -> StateMachineResultWithEffect {
        match self.guard_send() {
            Ok(()) => StateMachineResultWithEffect::succeed(None),
            Err(outcome) => self.finish("send PRIORITY", outcome),
        }
    }

    pub fn receive_priority(&mut self) -> StateMachineResultWithEffect {
        match self.guard_receive() {
            Ok(()) => StateMachineResultWithEffect::succeed(None),
            Err(outcome) => self.finish("receive PRIORITY", outcome),
        }
    }

    pub fn send_ping(&mut self) -> StateMachineResultWithEffect {
        match self.guard_send() {
            Ok(()) => StateMachineResultWithEffect::succeed(None),
            Err(outcome) => self.finish("send PING", outcome),
        }
    }

    /// A PING without ACK must be answered
    pub fn receive_ping(&mut self, ack: bool) -> (StateMachineResultWithEffect, PostFrameOperation) {
        match self.guard_receive() {
            Ok(()) if ack => (StateMachineResultWithEffect::succeed(None), PostFrameOperation::Nothing),
            Ok(()) => (StateMachineResultWithEffect::succeed(None), PostFrameOperation::SendAck),
            Err(outcome) => (self.finish("receive PING", outcome), PostFrameOperation::Nothing),
        }
    }

    // GOAWAY

    /// Send GOAWAY promising to process peer streams up to `last_stream_id`
    ///
    /// Peer streams above it are dropped. A later GOAWAY may only lower the
    /// value; an equal or higher one succeeds without effect.
    pub fn send_goaway(&mut self, last_stream_id: StreamId) -> StateMachineResultWithEffect {
        let peer = self.role.peer();
        let outcome = self.transition(|state| match state {
            ConnectionState::Idle
            | ConnectionState::PrefaceReceived(_)
            | ConnectionState::QuiescingPrefaceReceived { .. }
            | ConnectionState::FullyQuiesced => {
                (ConnectionState::FullyQuiesced, StateMachineResultWithEffect::succeed(None))
            }
            ConnectionState::PrefaceSent(mut data) => {
                let effect = data.quiesce(last_stream_id, peer);
                (
                    ConnectionState::QuiescingPrefaceSent {
                        data,
                        last_peer_stream_id: last_stream_id,
                    },
                    StateMachineResultWithEffect::succeed(effect),
                )
            }
            ConnectionState::Active(mut data) => {
                let effect = data.quiesce(last_stream_id, peer);
                (
                    ConnectionState::LocallyQuiesced {
                        data,
                        last_peer_stream_id: last_stream_id,
                    },
                    StateMachineResultWithEffect::succeed(effect),
                )
            }
            ConnectionState::RemotelyQuiesced {
                mut data,
                last_local_stream_id,
            } => {
                let effect = data.quiesce(last_stream_id, peer);
                (
                    ConnectionState::BothQuiescing {
                        data,
                        last_peer_stream_id: last_stream_id,
                        last_local_stream_id,
                    },
                    StateMachineResultWithEffect::succeed(effect),
                )
            }
            ConnectionState::LocallyQuiesced {
                mut data,
                mut last_peer_stream_id,
            } => {
                let effect = ratchet(&mut last_peer_stream_id, last_stream_id)
                    .then(|| data.quiesce(last_stream_id, peer))
                    .flatten();
                (
                    ConnectionState::LocallyQuiesced {
                        data,
                        last_peer_stream_id,
                    },
                    StateMachineResultWithEffect::succeed(effect),
                )
            }
            ConnectionState::QuiescingPrefaceSent {
                mut data,
                mut last_peer_stream_id,
            } => {
                let effect = ratchet(&mut last_peer_stream_id, last_stream_id)
                    .then(|| data.quiesce(last_stream_id, peer))
                    .flatten();
                (
                    ConnectionState::QuiescingPrefaceSent {
                        data,
                        last_peer_stream_id,
                    },
                    StateMachineResultWithEffect::succeed(effect),
                )
            }
            ConnectionState::BothQuiescing {
                mut data,
                mut last_peer_stream_id,
                last_local_stream_id,
            } => {
                let effect = ratchet(&mut last_peer_stream_id, last_stream_id)
                    .then(|| data.quiesce(last_stream_id, peer))
                    .flatten();
                (
                    ConnectionState::BothQuiescing {
                        data,
                        last_peer_stream_id,
                        last_local_stream_id,
                    },
                    StateMachineResultWithEffect::succeed(effect),
                )
            }
            ConnectionState::Modifying => (state, StateMachineResultWithEffect::succeed(None)),
        });

        self.close_if_needed();
        self.finish("send GOAWAY", outcome)
    }

    /// Handle GOAWAY: our streams above `last_stream_id` were not processed
    pub fn receive_goaway(&mut self, last_stream_id: StreamId) -> StateMachineResultWithEffect {
        let role = self.role;
        let outcome = self.transition(|state| match state {
            ConnectionState::Idle
            | ConnectionState::PrefaceSent(_)
            | ConnectionState::QuiescingPrefaceSent { .. } => {
                (state, StateMachineResultWithEffect::connection_error(Error::MissingPreface))
            }
            ConnectionState::FullyQuiesced => {
                (ConnectionState::FullyQuiesced, StateMachineResultWithEffect::succeed(None))
            }
            ConnectionState::PrefaceReceived(mut data) => {
                let effect = data.quiesce(last_stream_id, role);
                (
                    ConnectionState::QuiescingPrefaceReceived {
                        data,
                        last_local_stream_id: last_stream_id,
                    },
                    StateMachineResultWithEffect::succeed(effect),
                )
            }
            ConnectionState::Active(mut data) => {
                let effect = data.quiesce(last_stream_id, role);
                (
                    ConnectionState::RemotelyQuiesced {
                        data,
                        last_local_stream_id: last_stream_id,
                    },
                    StateMachineResultWithEffect::succeed(effect),
                )
            }
            ConnectionState::LocallyQuiesced {
                mut data,
                last_peer_stream_id,
            } => {
                let effect = data.quiesce(last_stream_id, role);
                (
                    ConnectionState::BothQuiescing {
                        data,
                        last_peer_stream_id,
                        last_local_stream_id: last_stream_id,
                    },
                    StateMachineResultWithEffect::succeed(effect),
                )
            }
            ConnectionState::RemotelyQuiesced {
                mut data,
                mut last_local_stream_id,
            } => {
                let effect = ratchet(&mut last_local_stream_id, last_stream_id)
                    .then(|| data.quiesce(last_stream_id, role))
                    .flatten();
                (
                    ConnectionState::RemotelyQuiesced {
                        data,
                        last_local_stream_id,
                    },
                    StateMachineResultWithEffect::succeed(effect),
                )
            }
            ConnectionState::QuiescingPrefaceReceived {
                mut data,
                mut last_local_stream_id,
            } => {
                let effect = ratchet(&mut last_local_stream_id, last_stream_id)
                    .then(|| data.quiesce(last_stream_id, role))
                    .flatten();
                (
                    ConnectionState::QuiescingPrefaceReceived {
                        data,
                        last_local_stream_id,
                    },
                    StateMachineResultWithEffect::succeed(effect),
                )
            }
            ConnectionState::BothQuiescing {
                mut data,
                last_peer_stream_id,
                mut last_local_stream_id,
            } => {
                let effect = ratchet(&mut last_local_stream_id, last_stream_id)
                    .then(|| data.quiesce(last_stream_id, role))
                    .flatten();
                (
                    ConnectionState::BothQuiescing {
                        data,
                        last_peer_stream_id,
                        last_local_stream_id,
                    },
                    StateMachineResultWithEffect::succeed(effect),
                )
            }
            ConnectionState::Modifying => (state, StateMachineResultWithEffect::succeed(None)),
        });

        self.close_if_needed();
        self.finish("receive GOAWAY", outcome)
    }

    // ALTSVC, ORIGIN

    /// ALTSVC is only meaningful from server to client
    pub fn send_alt_svc(&mut self) -> StateMachineResultWithEffect {
        if let Err(outcome) = self.guard_send() {
            return self.finish("send ALTSVC", outcome);
        }
        if self.role == ConnectionRole::Client {
            let outcome = StateMachineResultWithEffect::connection_error(Error::Protocol(
                "ALTSVC may only be sent by a server".into(),
            ));
            return self.finish("send ALTSVC", outcome);
        }
        StateMachineResultWithEffect::succeed(None)
    }

    pub fn receive_alt_svc(&mut self, stream_id: StreamId) -> StateMachineResultWithEffect {
        if let Err(outcome) = self.guard_receive() {
            return self.finish("receive ALTSVC", outcome);
        }
        if self.role == ConnectionRole::Server {
            debug!(stream_id = %stream_id, "ignoring ALTSVC sent by a client");
            return StateMachineResultWithEffect::ignore();
        }
        StateMachineResultWithEffect::succeed(None)
    }

    /// ORIGIN is only meaningful from server to client on stream 0
    pub fn send_origin(&mut self, stream_id: StreamId) -> StateMachineResultWithEffect {
        if let Err(outcome) = self.guard_send() {
            return self.finish("send ORIGIN", outcome);
        }
        if self.role == ConnectionRole::Client || !stream_id.is_root() {
            let outcome = StateMachineResultWithEffect::connection_error(Error::Protocol(
                "ORIGIN may only be sent by a server on stream 0".into(),
            ));
            return self.finish("send ORIGIN", outcome);
        }
        StateMachineResultWithEffect::succeed(None)
    }

    pub fn receive_origin(&mut self, stream_id: StreamId) -> StateMachineResultWithEffect {
        if let Err(outcome) = self.guard_receive() {
            return self.finish("receive ORIGIN", outcome);
        }
        if self.role == ConnectionRole::Server || !stream_id.is_root() {
            debug!(stream_id = %stream_id, "ignoring misplaced ORIGIN");
            return StateMachineResultWithEffect::ignore();
        }
        StateMachineResultWithEffect::succeed(None)
    }

    // Internals

    /// Swap the state out, compute its successor, and swap it back in
    fn transition<R, F>(&mut self, f: F) -> R
    where
        F: FnOnce(ConnectionState) -> (ConnectionState, R),
    {
        let from = self.state.kind();
        let state = std::mem::replace(&mut self.state, ConnectionState::Modifying);
        let (next, outcome) = f(state);
        self.state = next;

        let to = self.state.kind();
        if from != to {
            debug!(role = %self.role, from = %from, to = %to, "connection state changed");
        }
        outcome
    }

    /// Collapse to fully quiesced once a server-driven shutdown has drained
    fn close_if_needed(&mut self) {
        let quiesced_by_server = match &self.state {
            ConnectionState::LocallyQuiesced { .. } => self.role == ConnectionRole::Server,
            ConnectionState::RemotelyQuiesced { .. } => self.role == ConnectionRole::Client,
            ConnectionState::BothQuiescing { .. } => true,
            _ => return,
        };
        let drained = self.state.data().is_some_and(|data| data.streams.is_empty());
        if quiesced_by_server && drained {
            self.transition(|_| (ConnectionState::FullyQuiesced, ()));
        }
    }

    fn guard_send(&self) -> Guard {
        let state = self.state.kind();
        if state == ConnectionStateKind::FullyQuiesced {
            return Err(StateMachineResultWithEffect::connection_error(Error::IoOnClosedConnection));
        }
        if !state.has_sent_preface() {
            return Err(StateMachineResultWithEffect::connection_error(Error::MissingPreface));
        }
        Ok(())
    }

    fn guard_receive(&self) -> Guard {
        let state = self.state.kind();
        if state == ConnectionStateKind::FullyQuiesced {
            return Err(StateMachineResultWithEffect::connection_error(Error::IoOnClosedConnection));
        }
        if !state.has_received_preface() {
            return Err(StateMachineResultWithEffect::connection_error(Error::MissingPreface));
        }
        Ok(())
    }

    /// Peer streams above the ID in our GOAWAY are dropped unprocessed
    fn ignores_peer_stream(&self, stream_id: StreamId) -> bool {
        match self.state.sent_goaway() {
            Some(last_stream_id) => {
                !stream_id.is_root()
                    && self.role.peer().initiates(stream_id)
                    && stream_id > last_stream_id
            }
            None => false,
        }
    }

    fn finish(&self, operation: &'static str, outcome: StateMachineResultWithEffect) -> StateMachineResultWithEffect {
        match &outcome.result {
            StateMachineResult::ConnectionError { underlying, code } => {
                warn!(role = %self.role, operation, code = %code, error = %underlying, "connection error");
            }
            StateMachineResult::StreamError {
                stream_id,
                underlying,
                code,
            } => {
                debug!(role = %self.role, operation, stream_id = %stream_id, code = %code, error = %underlying, "stream error");
            }
            _ => {}
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::StreamClosed;

    fn request_headers() -> Headers {
        Headers::from_pairs(&[
            (":method", "GET"),
            (":path", "/"),
            (":scheme", "https"),
            (":authority", "example.com"),
        ])
    }

    fn response_headers() -> Headers {
        Headers::from_pairs(&[(":status", "200")])
    }

    /// A client and server that have both sent and received SETTINGS
    fn connected() -> (ConnectionStateMachine, ConnectionStateMachine) {
        let config = ConnectionConfig::default();
        let mut client = ConnectionStateMachine::new(ConnectionRole::Client, &config);
        let mut server = ConnectionStateMachine::new(ConnectionRole::Server, &config);

        let settings = config.initial_settings().clone();
        assert!(client.send_settings(settings.clone()).result.is_success());
        assert!(server.send_settings(settings.clone()).result.is_success());

        let frame = SettingsFrame::Settings(settings);
        let (outcome, post) = client.receive_settings(&frame);
        assert!(outcome.result.is_success());
        assert_eq!(post, PostFrameOperation::SendAck);
        let (outcome, _) = server.receive_settings(&frame);
        assert!(outcome.result.is_success());

        assert_eq!(client.state(), ConnectionStateKind::Active);
        assert_eq!(server.state(), ConnectionStateKind::Active);
        (client, server)
    }

    #[test]
    fn test_preface_exchange() {
        let config = ConnectionConfig::default();
        let mut client = ConnectionStateMachine::new(ConnectionRole::Client, &config);
        assert_eq!(client.state(), ConnectionStateKind::Idle);

        client.send_settings(Settings::new());
        assert_eq!(client.state(), ConnectionStateKind::PrefaceSent);

        let (_, post) = client.receive_settings(&SettingsFrame::Settings(Settings::new()));
        assert_eq!(post, PostFrameOperation::SendAck);
        assert_eq!(client.state(), ConnectionStateKind::Active);
    }

    #[test]
    fn test_receive_preface_first() {
        let config = ConnectionConfig::default();
        let mut server = ConnectionStateMachine::new(ConnectionRole::Server, &config);

        server.receive_settings(&SettingsFrame::Settings(Settings::new()));
        assert_eq!(server.state(), ConnectionStateKind::PrefaceReceived);

        // We cannot open or answer anything before our own preface
        let outcome = server.send_settings_ack();
        assert_eq!(outcome.result.error(), Some(&Error::MissingPreface));

        server.send_settings(Settings::new());
        assert_eq!(server.state(), ConnectionStateKind::Active);
    }

    #[test]
    fn test_frames_before_preface_rejected() {
        let config = ConnectionConfig::default();
        let mut server = ConnectionStateMachine::new(ConnectionRole::Server, &config);
        server.send_settings(Settings::new());

        let outcome = server.receive_headers(StreamId::new(1), &request_headers(), true);
        assert!(outcome.result.is_connection_error());
        assert_eq!(outcome.result.error(), Some(&Error::MissingPreface));

        let (outcome, _) = server.receive_ping(false);
        assert_eq!(outcome.result.error(), Some(&Error::MissingPreface));
    }

    #[test]
    fn test_settings_ack_applies_local_settings() {
        let (mut client, mut server) = connected();
        let (outcome, _) = server.receive_settings(&SettingsFrame::Ack);
        assert!(outcome.result.is_success());

        let mut settings = Settings::new();
        settings.push(SettingsParameter::InitialWindowSize, 100);
        settings.push(SettingsParameter::MaxFrameSize, 32768);
        server.send_settings(settings);

        let outcome = server.receive_headers(StreamId::new(1), &request_headers(), false);
        assert!(outcome.result.is_success());
        assert_eq!(
            server.stream_state(StreamId::new(1)).and_then(|s| s.local_window_size()),
            Some(65535)
        );

        let (outcome, post) = server.receive_settings(&SettingsFrame::Ack);
        assert_eq!(post, PostFrameOperation::Nothing);
        match outcome.effect {
            Some(StateChange::LocalSettingsChanged(change)) => {
                assert_eq!(change.stream_window_size_change, 100 - 65535);
                assert_eq!(change.new_max_frame_size, Some(32768));
            }
            other => panic!("unexpected effect {:?}", other),
        }
        assert_eq!(
            server.stream_state(StreamId::new(1)).and_then(|s| s.local_window_size()),
            Some(100)
        );

        // Two ACKs for one SETTINGS frame
        let (outcome, _) = client.receive_settings(&SettingsFrame::Ack);
        assert!(outcome.result.is_success());
        let (outcome, _) = client.receive_settings(&SettingsFrame::Ack);
        assert_eq!(outcome.result.error(), Some(&Error::ReceivedBadSettings));
    }

    #[test]
    fn test_invalid_peer_settings() {
        let (mut client, _) = connected();

        let mut settings = Settings::new();
        settings.push(SettingsParameter::InitialWindowSize, 0x8000_0000);
        let (outcome, post) = client.receive_settings(&SettingsFrame::Settings(settings));
        assert_eq!(post, PostFrameOperation::Nothing);
        assert_eq!(outcome.result.error_code(), Some(ErrorCode::FlowControlError));

        let mut settings = Settings::new();
        settings.push(SettingsParameter::MaxFrameSize, 100);
        let (outcome, _) = client.receive_settings(&SettingsFrame::Settings(settings));
        assert_eq!(outcome.result.error_code(), Some(ErrorCode::ProtocolError));
    }

    #[test]
    fn test_remote_window_change_applies_to_streams() {
        let (mut client, _) = connected();
        client.send_headers(StreamId::new(1), &request_headers(), false);

        let mut settings = Settings::new();
        settings.push(SettingsParameter::InitialWindowSize, 1000);
        let (outcome, _) = client.receive_settings(&SettingsFrame::Settings(settings));
        match outcome.effect {
            Some(StateChange::RemoteSettingsChanged(change)) => {
                assert_eq!(change.stream_window_size_change, 1000 - 65535);
            }
            other => panic!("unexpected effect {:?}", other),
        }
        assert_eq!(
            client.stream_state(StreamId::new(1)).and_then(|s| s.remote_window_size()),
            Some(1000)
        );
    }

    #[test]
    fn test_request_response_lifecycle() {
        let (mut client, mut server) = connected();
        let stream_id = StreamId::new(1);

        let outcome = client.send_headers(stream_id, &request_headers(), true);
        assert!(matches!(outcome.effect, Some(StateChange::StreamCreated(_))));

        let outcome = server.receive_headers(stream_id, &request_headers(), true);
        assert!(matches!(outcome.effect, Some(StateChange::StreamCreated(_))));
        assert_eq!(server.last_peer_initiated_stream_id(), stream_id);

        server.send_headers(stream_id, &response_headers(), false);
        let outcome = server.send_data(stream_id, 5, 5, true);
        assert_eq!(
            outcome.effect,
            Some(StateChange::StreamClosed(StreamClosed {
                stream_id,
                reason: None
            }))
        );
        assert_eq!(server.remote_connection_window_size(), Some(65530));

        client.receive_headers(stream_id, &response_headers(), false);
        let outcome = client.receive_data(stream_id, 5, 5, true);
        assert!(matches!(outcome.effect, Some(StateChange::StreamClosed(_))));
        assert_eq!(client.local_connection_window_size(), Some(65530));
        assert_eq!(client.open_streams(), 0);
    }

    #[test]
    fn test_data_reports_window_change() {
        let (mut client, mut server) = connected();
        let stream_id = StreamId::new(1);
        client.send_headers(stream_id, &request_headers(), false);
        server.receive_headers(stream_id, &request_headers(), false);

        let outcome = server.receive_data(stream_id, 10, 20, false);
        match outcome.effect {
            Some(StateChange::FlowControlChange(change)) => {
                assert_eq!(change.local_connection_window_size, 65515);
                let stream = change.stream.unwrap();
                assert_eq!(stream.local_stream_window_size, Some(65515));
                assert_eq!(stream.remote_stream_window_size, Some(65535));
            }
            other => panic!("unexpected effect {:?}", other),
        }

        let outcome = server.send_window_update(StreamId::ROOT, 20);
        assert!(outcome.result.is_success());
        assert_eq!(server.local_connection_window_size(), Some(65535));
    }

    #[test]
    fn test_connection_window_exhausted() {
        let (mut client, mut server) = connected();
        for id in [1u32, 3] {
            client.send_headers(StreamId::new(id), &request_headers(), false);
            server.receive_headers(StreamId::new(id), &request_headers(), false);
        }

        assert!(server.receive_data(StreamId::new(1), 65535, 65535, false).result.is_success());
        let outcome = server.receive_data(StreamId::new(3), 1, 1, false);
        assert!(outcome.result.is_connection_error());
        assert_eq!(outcome.result.error_code(), Some(ErrorCode::FlowControlError));

        let outcome = client.send_data(StreamId::new(1), 65536, 65536, false);
        assert!(outcome.result.is_stream_error());
        assert_eq!(client.remote_connection_window_size(), Some(65535));
    }

    #[test]
    fn test_window_update_errors() {
        let (mut client, _) = connected();

        let outcome = client.receive_window_update(StreamId::ROOT, 0);
        assert!(outcome.result.is_connection_error());
        assert_eq!(outcome.result.error(), Some(&Error::InvalidWindowIncrementSize));

        let outcome = client.receive_window_update(StreamId::ROOT, 0x7FFF_FFFF);
        assert_eq!(outcome.result.error_code(), Some(ErrorCode::FlowControlError));

        // Closed streams are tolerated
        client.send_headers(StreamId::new(1), &request_headers(), true);
        client.receive_headers(StreamId::new(1), &response_headers(), true);
        let outcome = client.receive_window_update(StreamId::new(1), 10);
        assert_eq!(outcome.result, StateMachineResult::Ignore);
    }

    #[test]
    fn test_empty_data_flood() {
        let (mut client, mut server) = connected();
        let stream_id = StreamId::new(1);
        client.send_headers(stream_id, &request_headers(), false);
        server.receive_headers(stream_id, &request_headers(), false);

        assert!(server.receive_data(stream_id, 0, 0, false).result.is_success());
        let outcome = server.receive_data(stream_id, 0, 0, false);
        assert!(outcome.result.is_connection_error());
        assert_eq!(outcome.result.error_code(), Some(ErrorCode::EnhanceYourCalm));
    }

    #[test]
    fn test_stream_limits() {
        let config = ConnectionConfig::builder()
            .initial_settings({
                let mut settings = Settings::new();
                settings.push(SettingsParameter::MaxConcurrentStreams, 1);
                settings
            })
            .build()
            .unwrap();
        let mut server = ConnectionStateMachine::new(ConnectionRole::Server, &config);
        server.send_settings(config.initial_settings().clone());
        server.receive_settings(&SettingsFrame::Settings(Settings::new()));
        server.receive_settings(&SettingsFrame::Ack);

        assert!(server.receive_headers(StreamId::new(1), &request_headers(), false).result.is_success());
        let outcome = server.receive_headers(StreamId::new(3), &request_headers(), false);
        assert!(outcome.result.is_connection_error());

        // Outbound cap from the peer's SETTINGS
        let mut client = ConnectionStateMachine::new(ConnectionRole::Client, &ConnectionConfig::default());
        client.send_settings(Settings::new());
        let mut settings = Settings::new();
        settings.push(SettingsParameter::MaxConcurrentStreams, 1);
        client.receive_settings(&SettingsFrame::Settings(settings));

        assert!(client.send_headers(StreamId::new(1), &request_headers(), false).result.is_success());
        let outcome = client.send_headers(StreamId::new(3), &request_headers(), false);
        assert!(outcome.result.is_stream_error());
        assert_eq!(outcome.result.error_code(), Some(ErrorCode::RefusedStream));
    }

    #[test]
    fn test_stream_id_must_increase() {
        let (_, mut server) = connected();
        server.receive_headers(StreamId::new(5), &request_headers(), true);

        let outcome = server.receive_headers(StreamId::new(3), &request_headers(), true);
        assert!(outcome.result.is_connection_error());
        assert_eq!(outcome.result.error(), Some(&Error::StreamIdTooSmall { stream_id: StreamId::new(3) }));
    }

    #[test]
    fn test_data_on_idle_stream() {
        let (_, mut server) = connected();
        let outcome = server.receive_data(StreamId::new(7), 1, 1, false);
        assert!(outcome.result.is_connection_error());
        assert!(matches!(outcome.result.error(), Some(Error::NoSuchStream { .. })));
    }

    #[test]
    fn test_reset_stream_stragglers_ignored() {
        let (mut client, mut server) = connected();
        let stream_id = StreamId::new(1);
        client.send_headers(stream_id, &request_headers(), false);
        server.receive_headers(stream_id, &request_headers(), false);

        let outcome = server.send_rst_stream(stream_id, ErrorCode::Cancel);
        assert_eq!(
            outcome.effect,
            Some(StateChange::StreamClosed(StreamClosed {
                stream_id,
                reason: Some(ErrorCode::Cancel)
            }))
        );

        let outcome = server.receive_data(stream_id, 4, 4, false);
        assert_eq!(outcome.result, StateMachineResult::Ignore);
        // The connection window still pays for the ignored bytes
        assert_eq!(server.local_connection_window_size(), Some(65531));
    }

    #[test]
    fn test_data_after_peer_closed_stream() {
        let (mut client, mut server) = connected();
        let stream_id = StreamId::new(1);
        client.send_headers(stream_id, &request_headers(), true);
        server.receive_headers(stream_id, &request_headers(), true);

        let outcome = server.receive_data(stream_id, 1, 1, false);
        assert!(outcome.result.is_stream_error());
        assert_eq!(outcome.result.error_code(), Some(ErrorCode::StreamClosed));
    }

    #[test]
    fn test_ping_needs_ack() {
        let (mut client, _) = connected();
        let (outcome, post) = client.receive_ping(false);
        assert!(outcome.result.is_success());
        assert_eq!(post, PostFrameOperation::SendAck);

        let (_, post) = client.receive_ping(true);
        assert_eq!(post, PostFrameOperation::Nothing);
    }

    #[test]
    fn test_server_goaway_drains_then_closes() {
        let (mut client, mut server) = connected();
        for id in [1u32, 3, 5] {
            client.send_headers(StreamId::new(id), &request_headers(), false);
            server.receive_headers(StreamId::new(id), &request_headers(), false);
        }

        let outcome = server.send_goaway(StreamId::new(3));
        assert_eq!(
            outcome.effect,
            Some(StateChange::BulkStreamClosure {
                closed_streams: vec![StreamId::new(5)]
            })
        );
        assert_eq!(server.state(), ConnectionStateKind::LocallyQuiesced);

        // Raising the value is a no-op
        let outcome = server.send_goaway(StreamId::new(5));
        assert!(outcome.result.is_success());
        assert_eq!(outcome.effect, None);

        // Streams above the advertised ID are dropped silently
        let outcome = server.receive_headers(StreamId::new(7), &request_headers(), true);
        assert_eq!(outcome.result, StateMachineResult::Ignore);

        let outcome = server.send_headers(StreamId::new(2), &response_headers(), false);
        assert!(outcome.result.is_stream_error());

        for id in [1u32, 3] {
            server.send_rst_stream(StreamId::new(id), ErrorCode::NoError);
        }
        assert_eq!(server.state(), ConnectionStateKind::FullyQuiesced);

        let outcome = server.send_ping();
        assert_eq!(outcome.result.error(), Some(&Error::IoOnClosedConnection));
        assert!(server.send_goaway(StreamId::ROOT).result.is_success());
    }

    #[test]
    fn test_client_receives_goaway() {
        let (mut client, _) = connected();
        client.send_headers(StreamId::new(1), &request_headers(), false);
        client.send_headers(StreamId::new(3), &request_headers(), false);

        let outcome = client.receive_goaway(StreamId::new(1));
        assert_eq!(
            outcome.effect,
            Some(StateChange::BulkStreamClosure {
                closed_streams: vec![StreamId::new(3)]
            })
        );
        assert_eq!(client.state(), ConnectionStateKind::RemotelyQuiesced);

        let outcome = client.send_headers(StreamId::new(5), &request_headers(), true);
        assert!(matches!(
            outcome.result.error(),
            Some(Error::CreatedStreamAfterGoaway { .. })
        ));

        client.receive_rst_stream(StreamId::new(1), ErrorCode::Cancel);
        assert_eq!(client.state(), ConnectionStateKind::FullyQuiesced);
    }

    #[test]
    fn test_client_goaway_does_not_close() {
        let (mut client, _) = connected();
        client.send_goaway(StreamId::ROOT);
        assert_eq!(client.state(), ConnectionStateKind::LocallyQuiesced);

        client.receive_goaway(StreamId::ROOT);
        assert_eq!(client.state(), ConnectionStateKind::FullyQuiesced);
    }

    #[test]
    fn test_quiescing_before_peer_preface() {
        let config = ConnectionConfig::default();
        let mut server = ConnectionStateMachine::new(ConnectionRole::Server, &config);
        server.send_settings(Settings::new());
        server.send_goaway(StreamId::ROOT);
        assert_eq!(server.state(), ConnectionStateKind::QuiescingPrefaceSent);

        server.receive_settings(&SettingsFrame::Settings(Settings::new()));
        assert_eq!(server.state(), ConnectionStateKind::FullyQuiesced);
    }

    #[test]
    fn test_goaway_before_preface() {
        let config = ConnectionConfig::default();
        let mut client = ConnectionStateMachine::new(ConnectionRole::Client, &config);
        let outcome = client.receive_goaway(StreamId::ROOT);
        assert_eq!(outcome.result.error(), Some(&Error::MissingPreface));
        assert_eq!(client.state(), ConnectionStateKind::Idle);

        client.receive_settings(&SettingsFrame::Settings(Settings::new()));
        client.receive_goaway(StreamId::ROOT);
        assert_eq!(client.state(), ConnectionStateKind::QuiescingPrefaceReceived);

        client.send_settings(Settings::new());
        assert_eq!(client.state(), ConnectionStateKind::FullyQuiesced);
    }

    #[test]
    fn test_server_push() {
        let (mut client, mut server) = connected();
        let stream_id = StreamId::new(1);
        let promised = StreamId::new(2);
        let promise = request_headers();

        client.send_headers(stream_id, &request_headers(), true);
        server.receive_headers(stream_id, &request_headers(), true);

        let outcome = server.send_push_promise(stream_id, promised, &promise);
        assert!(outcome.result.is_success());
        assert_eq!(outcome.effect, None);
        assert_eq!(server.stream_state(promised).map(|s| s.name()), Some("reservedLocal"));

        let outcome = client.receive_push_promise(stream_id, promised, &promise);
        assert!(outcome.result.is_success());
        assert_eq!(client.stream_state(promised).map(|s| s.name()), Some("reservedRemote"));

        let outcome = server.send_headers(promised, &response_headers(), false);
        assert!(matches!(outcome.effect, Some(StateChange::StreamCreated(_))));
        let outcome = client.receive_headers(promised, &response_headers(), false);
        match outcome.effect {
            Some(StateChange::StreamCreated(created)) => {
                assert_eq!(created.stream_id, promised);
                assert_eq!(created.remote_stream_window_size, None);
                assert_eq!(created.local_stream_window_size, Some(65535));
            }
            other => panic!("unexpected effect {:?}", other),
        }
    }

    #[test]
    fn test_push_disabled() {
        let config = ConnectionConfig::builder()
            .initial_settings({
                let mut settings = Settings::new();
                settings.push(SettingsParameter::EnablePush, 0);
                settings
            })
            .build()
            .unwrap();
        let mut client = ConnectionStateMachine::new(ConnectionRole::Client, &config);
        let mut server = ConnectionStateMachine::new(ConnectionRole::Server, &config);
        let settings = config.initial_settings().clone();
        client.send_settings(settings.clone());
        server.send_settings(Settings::new());
        client.receive_settings(&SettingsFrame::Settings(Settings::new()));
        server.receive_settings(&SettingsFrame::Settings(settings));
        client.receive_settings(&SettingsFrame::Ack);

        client.send_headers(StreamId::new(1), &request_headers(), true);
        server.receive_headers(StreamId::new(1), &request_headers(), true);

        let outcome = server.send_push_promise(StreamId::new(1), StreamId::new(2), &request_headers());
        assert_eq!(outcome.result.error(), Some(&Error::PushInViolationOfSetting));

        let outcome = client.receive_push_promise(StreamId::new(1), StreamId::new(2), &request_headers());
        assert!(outcome.result.is_connection_error());
        assert_eq!(outcome.result.error(), Some(&Error::PushInViolationOfSetting));
    }

    #[test]
    fn test_alt_svc_and_origin() {
        let (mut client, mut server) = connected();
        assert!(client.receive_alt_svc(StreamId::ROOT).result.is_success());
        assert_eq!(server.receive_alt_svc(StreamId::ROOT).result, StateMachineResult::Ignore);

        assert!(client.receive_origin(StreamId::ROOT).result.is_success());
        assert_eq!(client.receive_origin(StreamId::new(1)).result, StateMachineResult::Ignore);
        assert!(server.send_origin(StreamId::ROOT).result.is_success());
        assert!(client.send_alt_svc().result.is_connection_error());
    }

    #[test]
    fn test_frame_dispatch() {
        let (mut client, mut server) = connected();
        let stream_id = StreamId::new(1);

        let frame = Frame::headers(stream_id, request_headers(), false);
        assert!(client.send_frame(&frame).result.is_success());
        let (outcome, _) = server.receive_frame(&frame, 0);
        assert!(outcome.result.is_success());

        let frame = Frame::data(stream_id, bytes::Bytes::from_static(b"hello"), true);
        assert!(client.send_frame(&frame).result.is_success());
        let (outcome, _) = server.receive_frame(&frame, 5);
        assert!(outcome.result.is_success());

        let (_, post) = server.receive_frame(&Frame::ping([0; 8], false), 0);
        assert_eq!(post, PostFrameOperation::SendAck);
        assert_eq!(server.stream_state(stream_id).map(|s| s.name()), Some("halfClosedRemoteLocalIdle"));
    }

    #[test]
    fn test_role_helpers() {
        assert_eq!(ConnectionRole::Client.peer(), ConnectionRole::Server);
        assert!(ConnectionRole::Server.initiates(StreamId::new(2)));
        assert!(!ConnectionRole::Server.initiates(StreamId::new(1)));
        assert_eq!(ConnectionStateKind::BothQuiescing.to_string(), "bothQuiescing");
    }
}
