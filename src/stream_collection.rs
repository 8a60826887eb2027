//! Stream bookkeeping for one connection
//!
//! Owns every stream that is not yet closed, allocates and validates stream
//! IDs, enforces the per-role concurrency caps, and remembers which streams we
//! reset recently so that frames the peer sent before seeing our RST_STREAM
//! are dropped instead of treated as errors.

use crate::connection::ConnectionRole;
use crate::effects::{StateMachineResult, StateMachineResultWithEffect};
use crate::error::{Error, ErrorCode, Result};
use crate::stream::StreamStateMachine;
use crate::stream_id::StreamId;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use tracing::trace;

/// How many locally reset stream IDs are remembered
pub const RECENTLY_RESET_CAPACITY: usize = 32;

/// What to do with a frame for a stream that is not in the collection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingStreamPolicy {
    /// A closed stream is a stream error
    Error,
    /// A closed stream is silently ignored (WINDOW_UPDATE, RST_STREAM)
    IgnoreClosed,
}

#[derive(Debug, Clone)]
pub struct StreamCollection {
    local_role: ConnectionRole,
    streams: HashMap<StreamId, StreamStateMachine>,
    client_stream_count: u32,
    server_stream_count: u32,
    last_client_stream_id: StreamId,
    last_server_stream_id: StreamId,
    max_client_streams: Option<u32>,
    max_server_streams: Option<u32>,
    recently_reset: VecDeque<StreamId>,
}

impl StreamCollection {
    pub fn new(local_role: ConnectionRole) -> Self {
        StreamCollection {
            local_role,
            streams: HashMap::new(),
            client_stream_count: 0,
            server_stream_count: 0,
            last_client_stream_id: StreamId::ROOT,
            last_server_stream_id: StreamId::ROOT,
            max_client_streams: None,
            max_server_streams: None,
            recently_reset: VecDeque::with_capacity(RECENTLY_RESET_CAPACITY),
        }
    }

    pub fn get(&self, stream_id: StreamId) -> Option<&StreamStateMachine> {
        self.streams.get(&stream_id)
    }

    pub fn contains(&self, stream_id: StreamId) -> bool {
        self.streams.contains_key(&stream_id)
    }

    /// Number of streams not yet closed
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn stream_count(&self, initiator: ConnectionRole) -> u32 {
        match initiator {
            ConnectionRole::Client => self.client_stream_count,
            ConnectionRole::Server => self.server_stream_count,
        }
    }

    /// Highest stream ID `initiator` has opened so far
    pub fn last_stream_id(&self, initiator: ConnectionRole) -> StreamId {
        match initiator {
            ConnectionRole::Client => self.last_client_stream_id,
            ConnectionRole::Server => self.last_server_stream_id,
        }
    }

    /// Cap on concurrent streams opened by `initiator`
    pub fn max_streams(&self, initiator: ConnectionRole) -> Option<u32> {
        match initiator {
            ConnectionRole::Client => self.max_client_streams,
            ConnectionRole::Server => self.max_server_streams,
        }
    }

    pub fn set_max_streams(&mut self, initiator: ConnectionRole, max: Option<u32>) {
        match initiator {
            ConnectionRole::Client => self.max_client_streams = max,
            ConnectionRole::Server => self.max_server_streams = max,
        }
    }

    /// Claim `stream_id` for a new stream opened by `initiator`
    pub fn reserve(&mut self, stream_id: StreamId, initiator: ConnectionRole) -> Result<()> {
        let parity_ok = match initiator {
            ConnectionRole::Client => stream_id.is_client_initiated(),
            ConnectionRole::Server => stream_id.is_server_initiated(),
        };
        if !parity_ok {
            return Err(Error::InvalidStreamIdForPeer { stream_id });
        }
        if stream_id <= self.last_stream_id(initiator) {
            return Err(Error::StreamIdTooSmall { stream_id });
        }
        if let Some(max) = self.max_streams(initiator) {
            if self.stream_count(initiator) >= max {
                return Err(Error::MaxStreamsViolation);
            }
        }

        match initiator {
            ConnectionRole::Client => {
                self.last_client_stream_id = stream_id;
                self.client_stream_count += 1;
            }
            ConnectionRole::Server => {
                self.last_server_stream_id = stream_id;
                self.server_stream_count += 1;
            }
        }
        Ok(())
    }

    /// Reserve an ID and store a stream built for it (used for pushed streams)
    pub fn insert_reserved(&mut self, stream: StreamStateMachine) -> Result<()> {
        let stream_id = stream.stream_id();
        self.reserve(stream_id, stream.initiated_by())?;
        self.streams.insert(stream_id, stream);
        Ok(())
    }

    /// Run `modifier` on a stream, creating it with `creator` on first sight
    ///
    /// Reservation failures are connection errors when the peer opened the
    /// stream and stream errors (`REFUSED_STREAM` for the concurrency cap)
    /// when we did.
    pub fn modify_create_if_needed<C, M>(
        &mut self,
        stream_id: StreamId,
        initiator: ConnectionRole,
        creator: C,
        modifier: M,
    ) -> StateMachineResultWithEffect
    where
        C: FnOnce(StreamId) -> StreamStateMachine,
        M: FnOnce(&mut StreamStateMachine) -> StateMachineResultWithEffect,
    {
        if !self.streams.contains_key(&stream_id) {
            if self.recently_reset.contains(&stream_id) {
                return StateMachineResultWithEffect::ignore();
            }
            if let Err(error) = self.reserve(stream_id, initiator) {
                return self.reservation_failure(stream_id, initiator, error);
            }
        }

        let stream = match self.streams.entry(stream_id) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                trace!(stream_id = %stream_id, initiator = ?initiator, "creating stream");
                entry.insert(creator(stream_id))
            }
        };
        let outcome = modifier(stream);
        self.evict_if_closed(stream_id);
        outcome
    }

    /// Run `modifier` on an existing stream
    pub fn modify<M>(
        &mut self,
        stream_id: StreamId,
        policy: MissingStreamPolicy,
        modifier: M,
    ) -> StateMachineResultWithEffect
    where
        M: FnOnce(&mut StreamStateMachine) -> StateMachineResultWithEffect,
    {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return self.missing_stream(stream_id, policy);
        };
        let outcome = modifier(stream);
        self.evict_if_closed(stream_id);
        outcome
    }

    /// Remember a stream we reset so stray frames for it are ignored
    pub fn record_local_reset(&mut self, stream_id: StreamId) {
        if self.recently_reset.contains(&stream_id) {
            return;
        }
        if self.recently_reset.len() == RECENTLY_RESET_CAPACITY {
            self.recently_reset.pop_front();
        }
        self.recently_reset.push_back(stream_id);
    }

    pub fn was_recently_reset(&self, stream_id: StreamId) -> bool {
        self.recently_reset.contains(&stream_id)
    }

    /// Whether `stream_id` was never opened by the role its parity belongs to
    pub fn is_idle(&self, stream_id: StreamId) -> bool {
        let initiator = if stream_id.is_client_initiated() {
            ConnectionRole::Client
        } else {
            ConnectionRole::Server
        };
        !self.streams.contains_key(&stream_id) && stream_id > self.last_stream_id(initiator)
    }

    /// Drop streams opened by `initiator` above `last_stream_id` (GOAWAY)
    ///
    /// Returns the dropped IDs in ascending order.
    pub fn drop_all_streams_with_id_higher_than(
        &mut self,
        last_stream_id: StreamId,
        initiator: ConnectionRole,
    ) -> Vec<StreamId> {
        let mut dropped: Vec<StreamId> = self
            .streams
            .iter()
            .filter(|(id, stream)| **id > last_stream_id && stream.initiated_by() == initiator)
            .map(|(id, _)| *id)
            .collect();
        dropped.sort();

        for stream_id in &dropped {
            self.streams.remove(stream_id);
            self.decrement(initiator);
        }
        dropped
    }

    /// Apply a change of our SETTINGS_INITIAL_WINDOW_SIZE to every stream
    pub fn local_initial_window_size_changed(&mut self, delta: i32) -> Result<()> {
        for stream in self.streams.values_mut() {
            stream.local_initial_window_size_changed(delta)?;
        }
        Ok(())
    }

    /// Apply a change of the peer's SETTINGS_INITIAL_WINDOW_SIZE to every stream
    pub fn remote_initial_window_size_changed(&mut self, delta: i32) -> Result<()> {
        for stream in self.streams.values_mut() {
            stream.remote_initial_window_size_changed(delta)?;
        }
        Ok(())
    }

    /// IDs of all streams still present
    pub fn stream_ids(&self) -> Vec<StreamId> {
        let mut ids: Vec<StreamId> = self.streams.keys().copied().collect();
        ids.sort();
        ids
    }

    fn evict_if_closed(&mut self, stream_id: StreamId) {
        let Some(stream) = self.streams.get(&stream_id) else {
            return;
        };
        if stream.is_closed() {
            let initiator = stream.initiated_by();
            self.streams.remove(&stream_id);
            self.decrement(initiator);
            trace!(stream_id = %stream_id, "stream closed and evicted");
        }
    }

    fn decrement(&mut self, initiator: ConnectionRole) {
        match initiator {
            ConnectionRole::Client => {
                self.client_stream_count = self.client_stream_count.saturating_sub(1)
            }
            ConnectionRole::Server => {
                self.server_stream_count = self.server_stream_count.saturating_sub(1)
            }
        }
    }

    fn reservation_failure(
        &self,
        stream_id: StreamId,
        initiator: ConnectionRole,
        error: Error,
    ) -> StateMachineResultWithEffect {
        if initiator == self.local_role {
            let code = match error {
                Error::MaxStreamsViolation => ErrorCode::RefusedStream,
                _ => ErrorCode::ProtocolError,
            };
            return StateMachineResult::StreamError {
                stream_id,
                underlying: error,
                code,
            }
            .into();
        }
        StateMachineResultWithEffect::connection_error_with_code(error, ErrorCode::ProtocolError)
    }

    fn missing_stream(
        &self,
        stream_id: StreamId,
        policy: MissingStreamPolicy,
    ) -> StateMachineResultWithEffect {
        if self.is_idle(stream_id) {
            return StateMachineResultWithEffect::connection_error_with_code(
                Error::NoSuchStream { stream_id },
                ErrorCode::ProtocolError,
            );
        }
        if policy == MissingStreamPolicy::IgnoreClosed || self.was_recently_reset(stream_id) {
            return StateMachineResultWithEffect::ignore();
        }
        StateMachineResult::StreamError {
            stream_id,
            underlying: Error::NoSuchStream { stream_id },
            code: ErrorCode::StreamClosed,
        }
        .into()
    }
}
