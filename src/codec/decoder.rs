//! Incremental frame parsing
//!
//! DATA payloads are streamed: once a DATA frame header has been read, payload
//! bytes are handed out as soon as they arrive, so a frame is never buffered
//! whole. Every other frame type is buffered until its full payload is
//! available and then parsed in one go.

use super::{decode_frame_header, FRAME_HEADER_SIZE};
use crate::connection::ConnectionRole;
use crate::error::{Error, ErrorCode, Result};
use crate::frames::*;
use crate::headers::Headers;
use crate::effects::SettingsChange;
use crate::settings::{Settings, SettingsParameter};
use crate::stream_id::StreamId;
use crate::{CONNECTION_PREFACE, DEFAULT_HEADER_TABLE_SIZE, DEFAULT_MAX_FRAME_SIZE};
use bytes::{Buf, Bytes, BytesMut};
use tracing::trace;

/// Header-list limit applied before our own SETTINGS say otherwise
const DEFAULT_MAX_HEADER_LIST_SIZE: usize = 16384;

/// Where the decoder is within the inbound byte stream
#[derive(Debug)]
enum ParseState {
    /// Server side only: waiting for the 24-byte client magic
    AwaitingClientMagic,
    AwaitingFrameHeader,
    /// Buffering the payload of a non-DATA frame
    AccumulatingPayload(FrameHeader),
    StreamingData(DataProgress),
    SkippingUnknown { remaining: usize },
}

#[derive(Debug)]
struct DataProgress {
    header: FrameHeader,
    /// Whether the pad-length byte is still to be read
    awaiting_pad_length: bool,
    data_remaining: usize,
    padding_remaining: usize,
    emitted_any: bool,
}

/// A HEADERS or PUSH_PROMISE block waiting for CONTINUATION frames
#[derive(Debug)]
struct PendingHeaderBlock {
    stream_id: StreamId,
    kind: PendingKind,
    fragments: BytesMut,
}

#[derive(Debug)]
enum PendingKind {
    Headers {
        end_stream: bool,
        priority: Option<PrioritySpec>,
    },
    PushPromise {
        promised_stream_id: StreamId,
    },
}

/// Turns an append-only byte stream into typed frames
pub struct FrameDecoder {
    buffer: BytesMut,
    state: ParseState,
    pending_block: Option<PendingHeaderBlock>,
    hpack: hpack::Decoder<'static>,
    max_frame_size: u32,
    max_header_list_size: usize,
}

impl FrameDecoder {
    /// Create a decoder for one side of a connection
    ///
    /// A server-side decoder first expects the client connection preface.
    pub fn new(role: ConnectionRole) -> Self {
        let state = match role {
            ConnectionRole::Server => ParseState::AwaitingClientMagic,
            ConnectionRole::Client => ParseState::AwaitingFrameHeader,
        };
        let mut hpack = hpack::Decoder::new();
        hpack.set_max_table_size(DEFAULT_HEADER_TABLE_SIZE as usize);

        FrameDecoder {
            buffer: BytesMut::with_capacity(4096),
            state,
            pending_block: None,
            hpack,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_header_list_size: DEFAULT_MAX_HEADER_LIST_SIZE,
        }
    }

    /// Limit on a (possibly CONTINUATION-spread) compressed header block
    pub fn with_max_header_list_size(mut self, size: usize) -> Self {
        self.max_header_list_size = size;
        self
    }

    /// Largest payload we accept
    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }

    pub fn set_max_frame_size(&mut self, size: u32) {
        self.max_frame_size = size;
    }

    pub fn set_max_header_list_size(&mut self, size: usize) {
        self.max_header_list_size = size;
    }

    pub fn set_header_table_size(&mut self, size: u32) {
        self.hpack.set_max_table_size(size as usize);
    }

    /// Take up our own settings once the peer has acknowledged them
    pub fn apply_local_settings(&mut self, change: &SettingsChange) {
        if let Some(size) = change.new_max_frame_size {
            self.set_max_frame_size(size);
        }
        if let Some(size) = change.new_header_table_size {
            self.set_header_table_size(size);
        }
        if let Some(size) = change.new_max_header_list_size {
            self.set_max_header_list_size(size as usize);
        }
    }

    /// Bytes received but not yet turned into frames
    pub fn buffered_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Append bytes read from the transport
    pub fn append_bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Parse the next frame
    ///
    /// Returns the frame and its flow-controlled length, or `None` if more
    /// bytes are needed. Only the first value produced for a DATA frame carries
    /// a flow-controlled length (the frame's full declared length, padding
    /// included); later chunks of the same frame report zero, as does every
    /// non-DATA frame. All errors are connection errors.
    pub fn next_frame(&mut self) -> Result<Option<(Frame, usize)>> {
        loop {
            match std::mem::replace(&mut self.state, ParseState::AwaitingFrameHeader) {
                ParseState::AwaitingClientMagic => {
                    if self.buffer.len() < CONNECTION_PREFACE.len() {
                        self.state = ParseState::AwaitingClientMagic;
                        return Ok(None);
                    }
                    if &self.buffer[..CONNECTION_PREFACE.len()] != CONNECTION_PREFACE {
                        self.state = ParseState::AwaitingClientMagic;
                        return Err(Error::BadClientMagic);
                    }
                    self.buffer.advance(CONNECTION_PREFACE.len());
                }
                ParseState::AwaitingFrameHeader => {
                    if self.buffer.len() < FRAME_HEADER_SIZE {
                        return Ok(None);
                    }
                    let mut raw = [0u8; FRAME_HEADER_SIZE];
                    raw.copy_from_slice(&self.buffer[..FRAME_HEADER_SIZE]);
                    let header = decode_frame_header(&raw);
                    self.validate_header(&header)?;
                    self.buffer.advance(FRAME_HEADER_SIZE);
                    self.state = self.state_for(header);
                }
                ParseState::SkippingUnknown { remaining } => {
                    let skipped = remaining.min(self.buffer.len());
                    self.buffer.advance(skipped);
                    if skipped < remaining {
                        self.state = ParseState::SkippingUnknown {
                            remaining: remaining - skipped,
                        };
                        return Ok(None);
                    }
                }
                ParseState::StreamingData(progress) => {
                    if let Some(output) = self.stream_data(progress)? {
                        return Ok(Some(output));
                    }
                    if !matches!(self.state, ParseState::AwaitingFrameHeader) {
                        return Ok(None);
                    }
                }
                ParseState::AccumulatingPayload(header) => {
                    if self.buffer.len() < header.length {
                        self.state = ParseState::AccumulatingPayload(header);
                        return Ok(None);
                    }
                    let payload = self.buffer.split_to(header.length).freeze();
                    if let Some(frame) = self.parse_payload(header, payload)? {
                        trace!(frame_type = %frame.frame_type(), stream_id = %frame.stream_id, "decoded frame");
                        return Ok(Some((frame, 0)));
                    }
                }
            }
        }
    }

    fn validate_header(&self, header: &FrameHeader) -> Result<()> {
        if header.length > self.max_frame_size as usize {
            return Err(Error::FrameSize(format!(
                "frame of {} bytes exceeds max frame size {}",
                header.length, self.max_frame_size
            )));
        }

        if let Some(pending) = &self.pending_block {
            if header.frame_type() != Some(FrameType::Continuation)
                || header.stream_id != pending.stream_id
            {
                return Err(Error::Protocol(format!(
                    "expected CONTINUATION on stream {}",
                    pending.stream_id
                )));
            }
        }

        let Some(frame_type) = header.frame_type() else {
            return Ok(());
        };
        let on_root = header.stream_id.is_root();
        match frame_type {
            FrameType::Data
            | FrameType::Headers
            | FrameType::Priority
            | FrameType::RstStream
            | FrameType::PushPromise
            | FrameType::Continuation
                if on_root =>
            {
                Err(Error::Protocol(format!("{} frame on stream 0", frame_type.name())))
            }
            FrameType::Settings | FrameType::Ping | FrameType::Goaway if !on_root => Err(
                Error::Protocol(format!("{} frame on stream {}", frame_type.name(), header.stream_id)),
            ),
            FrameType::Continuation if self.pending_block.is_none() => Err(Error::Protocol(
                "CONTINUATION without a preceding header block".into(),
            )),
            _ => Ok(()),
        }
    }

    fn state_for(&self, header: FrameHeader) -> ParseState {
        match header.frame_type() {
            None => {
                trace!(raw_type = header.raw_type, length = header.length, "skipping unknown frame");
                ParseState::SkippingUnknown {
                    remaining: header.length,
                }
            }
            Some(FrameType::Data) => {
                let padded = header.flags.contains(FrameFlags::PADDED);
                ParseState::StreamingData(DataProgress {
                    header,
                    awaiting_pad_length: padded,
                    data_remaining: if padded { 0 } else { header.length },
                    padding_remaining: 0,
                    emitted_any: false,
                })
            }
            Some(_) => ParseState::AccumulatingPayload(header),
        }
    }

    /// Hand out whatever DATA payload is available
    ///
    /// Leaves `self.state` at `AwaitingFrameHeader` once the frame is fully
    /// consumed, otherwise stores the updated progress.
    fn stream_data(&mut self, mut progress: DataProgress) -> Result<Option<(Frame, usize)>> {
        if progress.awaiting_pad_length {
            if self.buffer.is_empty() {
                self.state = ParseState::StreamingData(progress);
                return Ok(None);
            }
            let pad_length = self.buffer.get_u8() as usize;
            if pad_length >= progress.header.length {
                return Err(Error::Protocol(format!(
                    "padding of {} bytes in a {} byte DATA frame",
                    pad_length, progress.header.length
                )));
            }
            progress.awaiting_pad_length = false;
            progress.padding_remaining = pad_length;
            progress.data_remaining = progress.header.length - 1 - pad_length;
        }

        let stream_id = progress.header.stream_id;
        let end_stream_flag = progress.header.flags.contains(FrameFlags::END_STREAM);
        let flow_controlled = |progress: &DataProgress| {
            if progress.emitted_any {
                0
            } else {
                progress.header.length
            }
        };

        if progress.data_remaining > 0 {
            if self.buffer.is_empty() {
                self.state = ParseState::StreamingData(progress);
                return Ok(None);
            }
            let chunk_len = progress.data_remaining.min(self.buffer.len());
            let chunk = self.buffer.split_to(chunk_len).freeze();
            let length = flow_controlled(&progress);
            progress.data_remaining -= chunk_len;
            progress.emitted_any = true;

            let finished = progress.data_remaining == 0 && progress.padding_remaining == 0;
            if !finished {
                self.state = ParseState::StreamingData(progress);
            }
            trace!(stream_id = %stream_id, chunk_len, flow_controlled = length, "decoded DATA chunk");
            return Ok(Some((
                Frame::data(stream_id, chunk, end_stream_flag && finished),
                length,
            )));
        }

        if progress.padding_remaining > 0 {
            let skipped = progress.padding_remaining.min(self.buffer.len());
            self.buffer.advance(skipped);
            progress.padding_remaining -= skipped;
            if progress.padding_remaining > 0 {
                self.state = ParseState::StreamingData(progress);
                return Ok(None);
            }
        }

        // Payload and padding are both consumed. A frame that produced no
        // chunk yet, or whose END_STREAM was held back behind padding, still
        // owes the caller one empty DATA value.
        if !progress.emitted_any || end_stream_flag {
            let length = flow_controlled(&progress);
            return Ok(Some((Frame::data(stream_id, Bytes::new(), end_stream_flag), length)));
        }
        Ok(None)
    }

    /// Parse a fully buffered non-DATA payload
    ///
    /// Returns `None` when the frame produced nothing for the caller (a header
    /// block still waiting for CONTINUATION).
    fn parse_payload(&mut self, header: FrameHeader, mut payload: Bytes) -> Result<Option<Frame>> {
        let stream_id = header.stream_id;
        let flags = header.flags;
        let Some(frame_type) = header.frame_type() else {
            return Ok(None);
        };

        let payload = match frame_type {
            FrameType::Data => unreachable!("DATA frames are streamed"),
            FrameType::Headers => {
                strip_padding(&mut payload, flags, frame_type)?;
                let priority = if flags.contains(FrameFlags::PRIORITY) {
                    if payload.len() < 5 {
                        return Err(Error::FrameSize("HEADERS priority block truncated".into()));
                    }
                    Some(get_priority(&mut payload))
                } else {
                    None
                };
                let kind = PendingKind::Headers {
                    end_stream: flags.contains(FrameFlags::END_STREAM),
                    priority,
                };
                return self.start_header_block(stream_id, kind, flags, payload);
            }
            FrameType::PushPromise => {
                strip_padding(&mut payload, flags, frame_type)?;
                if payload.len() < 4 {
                    return Err(Error::FrameSize("PUSH_PROMISE truncated".into()));
                }
                let promised_stream_id = StreamId::new(payload.get_u32());
                let kind = PendingKind::PushPromise { promised_stream_id };
                return self.start_header_block(stream_id, kind, flags, payload);
            }
            FrameType::Continuation => {
                let Some(mut pending) = self.pending_block.take() else {
                    return Err(Error::Protocol("CONTINUATION without a preceding header block".into()));
                };
                pending.fragments.extend_from_slice(&payload);
                self.check_block_size(pending.fragments.len())?;
                if !flags.contains(FrameFlags::END_HEADERS) {
                    self.pending_block = Some(pending);
                    return Ok(None);
                }
                return self.finish_header_block(pending).map(Some);
            }
            FrameType::Priority => {
                expect_length(&payload, 5, frame_type)?;
                FramePayload::Priority(get_priority(&mut payload))
            }
            FrameType::RstStream => {
                expect_length(&payload, 4, frame_type)?;
                FramePayload::RstStream(ErrorCode::from_u32(payload.get_u32()))
            }
            FrameType::Settings => {
                if flags.contains(FrameFlags::ACK) {
                    if !payload.is_empty() {
                        return Err(Error::FrameSize("SETTINGS ACK with a payload".into()));
                    }
                    FramePayload::Settings(SettingsFrame::Ack)
                } else {
                    if payload.len() % 6 != 0 {
                        return Err(Error::FrameSize(format!(
                            "SETTINGS payload of {} bytes is not a multiple of 6",
                            payload.len()
                        )));
                    }
                    let mut settings = Settings::new();
                    while payload.has_remaining() {
                        let parameter = SettingsParameter::from_u16(payload.get_u16());
                        settings.push(parameter, payload.get_u32());
                    }
                    FramePayload::Settings(SettingsFrame::Settings(settings))
                }
            }
            FrameType::Ping => {
                expect_length(&payload, 8, frame_type)?;
                let mut data = [0u8; 8];
                payload.copy_to_slice(&mut data);
                FramePayload::Ping(PingFrame {
                    ack: flags.contains(FrameFlags::ACK),
                    data,
                })
            }
            FrameType::Goaway => {
                if payload.len() < 8 {
                    return Err(Error::FrameSize("GOAWAY shorter than 8 bytes".into()));
                }
                let last_stream_id = StreamId::new(payload.get_u32());
                let error_code = ErrorCode::from_u32(payload.get_u32());
                FramePayload::Goaway(GoawayFrame::new(last_stream_id, error_code, payload))
            }
            FrameType::WindowUpdate => {
                expect_length(&payload, 4, frame_type)?;
                FramePayload::WindowUpdate(payload.get_u32() & 0x7FFF_FFFF)
            }
            FrameType::AltSvc => {
                if payload.len() < 2 {
                    return Err(Error::FrameSize("ALTSVC shorter than 2 bytes".into()));
                }
                let origin_len = payload.get_u16() as usize;
                if origin_len > payload.len() {
                    return Err(Error::FrameSize("ALTSVC origin overruns the frame".into()));
                }
                let origin = payload.split_to(origin_len);
                let origin = if origin.is_empty() {
                    None
                } else {
                    Some(String::from_utf8_lossy(&origin).into_owned())
                };
                FramePayload::AltSvc(AltSvcFrame {
                    origin,
                    field: payload,
                })
            }
            FrameType::Origin => {
                let mut origins = Vec::new();
                while payload.has_remaining() {
                    if payload.len() < 2 {
                        return Err(Error::FrameSize("ORIGIN entry truncated".into()));
                    }
                    let len = payload.get_u16() as usize;
                    if len > payload.len() {
                        return Err(Error::FrameSize("ORIGIN entry overruns the frame".into()));
                    }
                    origins.push(String::from_utf8_lossy(&payload.split_to(len)).into_owned());
                }
                FramePayload::Origin(origins)
            }
        };

        Ok(Some(Frame::new(stream_id, payload)))
    }

    fn start_header_block(
        &mut self,
        stream_id: StreamId,
        kind: PendingKind,
        flags: FrameFlags,
        fragment: Bytes,
    ) -> Result<Option<Frame>> {
        self.check_block_size(fragment.len())?;
        let pending = PendingHeaderBlock {
            stream_id,
            kind,
            fragments: BytesMut::from(&fragment[..]),
        };
        if !flags.contains(FrameFlags::END_HEADERS) {
            self.pending_block = Some(pending);
            return Ok(None);
        }
        self.finish_header_block(pending).map(Some)
    }

    fn check_block_size(&self, size: usize) -> Result<()> {
        if size > self.max_header_list_size {
            return Err(Error::ExcessivelyLargeHeaderBlock { size });
        }
        Ok(())
    }

    fn finish_header_block(&mut self, pending: PendingHeaderBlock) -> Result<Frame> {
        let headers: Headers = self
            .hpack
            .decode(&pending.fragments)
            .map_err(|e| Error::Compression(format!("HPACK decode error: {:?}", e)))?
            .into_iter()
            .collect();

        let payload = match pending.kind {
            PendingKind::Headers {
                end_stream,
                priority,
            } => FramePayload::Headers(HeadersFrame {
                headers,
                end_stream,
                priority,
                padding: None,
            }),
            PendingKind::PushPromise { promised_stream_id } => {
                FramePayload::PushPromise(PushPromiseFrame::new(promised_stream_id, headers))
            }
        };
        Ok(Frame::new(pending.stream_id, payload))
    }
}

fn expect_length(payload: &Bytes, expected: usize, frame_type: FrameType) -> Result<()> {
    if payload.len() != expected {
        return Err(Error::FrameSize(format!(
            "{} payload of {} bytes, expected {}",
            frame_type.name(),
            payload.len(),
            expected
        )));
    }
    Ok(())
}

/// Remove the pad-length byte and trailing padding from a buffered payload
fn strip_padding(payload: &mut Bytes, flags: FrameFlags, frame_type: FrameType) -> Result<()> {
    if !flags.contains(FrameFlags::PADDED) {
        return Ok(());
    }
    if payload.is_empty() {
        return Err(Error::FrameSize(format!("padded {} frame without pad length", frame_type.name())));
    }
    let pad_length = payload.get_u8() as usize;
    if pad_length > payload.len() {
        return Err(Error::Protocol(format!(
            "padding of {} bytes in {} frame with {} bytes remaining",
            pad_length,
            frame_type.name(),
            payload.len()
        )));
    }
    payload.truncate(payload.len() - pad_length);
    Ok(())
}

fn get_priority(payload: &mut Bytes) -> PrioritySpec {
    let raw = payload.get_u32();
    let weight = payload.get_u8();
    PrioritySpec::new(StreamId::new(raw & 0x7FFF_FFFF), raw & 0x8000_0000 != 0, weight)
}
