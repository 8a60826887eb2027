//! Frame serialization

use super::{encode_frame_header, FRAME_HEADER_SIZE};
use crate::error::{Error, Result};
use crate::frames::*;
use crate::headers::Headers;
use crate::effects::SettingsChange;
use crate::stream_id::StreamId;
use crate::{DEFAULT_HEADER_TABLE_SIZE, DEFAULT_MAX_FRAME_SIZE};
use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

/// Serializes typed frames into wire bytes
///
/// Outbound padding is not supported. A header block larger than the peer's
/// SETTINGS_MAX_FRAME_SIZE is split across CONTINUATION frames; any other
/// payload over that limit is rejected.
pub struct FrameEncoder {
    hpack: hpack::Encoder<'static>,
    max_frame_size: u32,
    header_table_size: u32,
}

impl FrameEncoder {
    /// Create an encoder using protocol defaults
    pub fn new() -> Self {
        FrameEncoder {
            hpack: hpack::Encoder::new(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            header_table_size: DEFAULT_HEADER_TABLE_SIZE,
        }
    }

    /// Largest payload the peer accepts
    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }

    pub fn set_max_frame_size(&mut self, size: u32) {
        self.max_frame_size = size;
    }

    /// Dynamic table size the peer allows us
    pub fn header_table_size(&self) -> u32 {
        self.header_table_size
    }

    pub fn set_header_table_size(&mut self, size: u32) {
        // hpack's encoder never indexes, its dynamic table stays empty
        self.header_table_size = size;
    }

    /// Take up the peer's effective settings
    pub fn apply_remote_settings(&mut self, change: &SettingsChange) {
        if let Some(size) = change.new_max_frame_size {
            self.set_max_frame_size(size);
        }
        if let Some(size) = change.new_header_table_size {
            self.set_header_table_size(size);
        }
    }

    /// Encode `frame` into `buf`
    ///
    /// For DATA frames only the frame header is written and the payload is
    /// handed back so it can be written without copying. Every other frame is
    /// written whole and `None` is returned.
    pub fn encode(&mut self, frame: &Frame, buf: &mut BytesMut) -> Result<Option<Bytes>> {
        let stream_id = frame.stream_id;
        trace!(frame_type = %frame.frame_type(), stream_id = %stream_id, "encoding frame");

        match &frame.payload {
            FramePayload::Data(data) => {
                if data.padding.is_some() {
                    return Err(Error::Unsupported("outbound padding".into()));
                }
                self.check_length(data.data.len())?;

                let mut flags = FrameFlags::empty();
                flags.set_if(FrameFlags::END_STREAM, data.end_stream);
                encode_frame_header(buf, data.data.len(), FrameType::Data.as_u8(), flags, stream_id);
                Ok(Some(data.data.clone()))
            }
            FramePayload::Headers(headers) => {
                if headers.padding.is_some() {
                    return Err(Error::Unsupported("outbound padding".into()));
                }
                let mut prefix = BytesMut::new();
                if let Some(priority) = &headers.priority {
                    put_priority(&mut prefix, priority);
                }

                let mut flags = FrameFlags::empty();
                flags.set_if(FrameFlags::END_STREAM, headers.end_stream);
                flags.set_if(FrameFlags::PRIORITY, headers.priority.is_some());

                let block = self.compress(&headers.headers);
                self.write_header_block(buf, FrameType::Headers, flags, stream_id, &prefix, &block);
                Ok(None)
            }
            FramePayload::PushPromise(push) => {
                if push.padding.is_some() {
                    return Err(Error::Unsupported("outbound padding".into()));
                }
                let mut prefix = BytesMut::new();
                prefix.put_u32(push.promised_stream_id.value());

                let block = self.compress(&push.headers);
                self.write_header_block(
                    buf,
                    FrameType::PushPromise,
                    FrameFlags::empty(),
                    stream_id,
                    &prefix,
                    &block,
                );
                Ok(None)
            }
            FramePayload::Priority(priority) => {
                encode_frame_header(buf, 5, FrameType::Priority.as_u8(), FrameFlags::empty(), stream_id);
                put_priority(buf, priority);
                Ok(None)
            }
            FramePayload::RstStream(code) => {
                encode_frame_header(buf, 4, FrameType::RstStream.as_u8(), FrameFlags::empty(), stream_id);
                buf.put_u32(code.as_u32());
                Ok(None)
            }
            FramePayload::Settings(SettingsFrame::Ack) => {
                let flags = FrameFlags::from_u8(FrameFlags::ACK);
                encode_frame_header(buf, 0, FrameType::Settings.as_u8(), flags, stream_id);
                Ok(None)
            }
            FramePayload::Settings(SettingsFrame::Settings(settings)) => {
                // Each setting is 6 bytes (2 byte ID + 4 byte value)
                let length = settings.len() * 6;
                self.check_length(length)?;
                encode_frame_header(buf, length, FrameType::Settings.as_u8(), FrameFlags::empty(), stream_id);
                for setting in settings {
                    buf.put_u16(setting.parameter.as_u16());
                    buf.put_u32(setting.value);
                }
                Ok(None)
            }
            FramePayload::Ping(ping) => {
                let mut flags = FrameFlags::empty();
                flags.set_if(FrameFlags::ACK, ping.ack);
                encode_frame_header(buf, 8, FrameType::Ping.as_u8(), flags, stream_id);
                buf.put_slice(&ping.data);
                Ok(None)
            }
            FramePayload::Goaway(goaway) => {
                // 4 bytes stream ID + 4 bytes error code + debug data
                let length = 8 + goaway.debug_data.len();
                self.check_length(length)?;
                encode_frame_header(buf, length, FrameType::Goaway.as_u8(), FrameFlags::empty(), stream_id);
                buf.put_u32(goaway.last_stream_id.value());
                buf.put_u32(goaway.error_code.as_u32());
                buf.put_slice(&goaway.debug_data);
                Ok(None)
            }
            FramePayload::WindowUpdate(increment) => {
                encode_frame_header(buf, 4, FrameType::WindowUpdate.as_u8(), FrameFlags::empty(), stream_id);
                buf.put_u32(increment & 0x7FFF_FFFF);
                Ok(None)
            }
            FramePayload::AltSvc(altsvc) => {
                let origin = altsvc.origin.as_deref().unwrap_or("");
                let length = 2 + origin.len() + altsvc.field.len();
                self.check_length(length)?;
                encode_frame_header(buf, length, FrameType::AltSvc.as_u8(), FrameFlags::empty(), stream_id);
                buf.put_u16(origin.len() as u16);
                buf.put_slice(origin.as_bytes());
                buf.put_slice(&altsvc.field);
                Ok(None)
            }
            FramePayload::Origin(origins) => {
                let length: usize = origins.iter().map(|o| 2 + o.len()).sum();
                self.check_length(length)?;
                encode_frame_header(buf, length, FrameType::Origin.as_u8(), FrameFlags::empty(), stream_id);
                for origin in origins {
                    buf.put_u16(origin.len() as u16);
                    buf.put_slice(origin.as_bytes());
                }
                Ok(None)
            }
        }
    }

    /// Encode `frame` into a single contiguous buffer
    pub fn encode_to_bytes(&mut self, frame: &Frame) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE);
        if let Some(extra) = self.encode(frame, &mut buf)? {
            buf.extend_from_slice(&extra);
        }
        Ok(buf.freeze())
    }

    fn check_length(&self, length: usize) -> Result<()> {
        if length > self.max_frame_size as usize {
            return Err(Error::FrameSize(format!(
                "payload of {} bytes exceeds max frame size {}",
                length, self.max_frame_size
            )));
        }
        Ok(())
    }

    fn compress(&mut self, headers: &Headers) -> Vec<u8> {
        self.hpack
            .encode(headers.iter().map(|f| (&f.name[..], &f.value[..])))
    }

    /// Write a HEADERS or PUSH_PROMISE frame followed by as many CONTINUATION
    /// frames as the block needs
    fn write_header_block(
        &self,
        buf: &mut BytesMut,
        frame_type: FrameType,
        mut flags: FrameFlags,
        stream_id: StreamId,
        prefix: &[u8],
        block: &[u8],
    ) {
        let max = self.max_frame_size as usize;
        let first_len = block.len().min(max.saturating_sub(prefix.len()));
        let (first, mut rest) = block.split_at(first_len);

        flags.set_if(FrameFlags::END_HEADERS, rest.is_empty());
        encode_frame_header(buf, prefix.len() + first.len(), frame_type.as_u8(), flags, stream_id);
        buf.put_slice(prefix);
        buf.put_slice(first);

        while !rest.is_empty() {
            let (fragment, remaining) = rest.split_at(rest.len().min(max));
            let mut flags = FrameFlags::empty();
            flags.set_if(FrameFlags::END_HEADERS, remaining.is_empty());
            encode_frame_header(buf, fragment.len(), FrameType::Continuation.as_u8(), flags, stream_id);
            buf.put_slice(fragment);
            rest = remaining;
        }
    }
}

impl Default for FrameEncoder {
    fn default() -> Self {
        Self::new()
    }
}

fn put_priority<B: BufMut>(buf: &mut B, priority: &PrioritySpec) {
    let mut dependency = priority.stream_dependency.value();
    if priority.exclusive {
        dependency |= 0x8000_0000;
    }
    buf.put_u32(dependency);
    buf.put_u8(priority.weight);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::settings::{SettingsBuilder, SettingsParameter};

    #[test]
    fn test_encode_data_frame() {
        let mut encoder = FrameEncoder::new();
        let frame = Frame::data(StreamId::new(1), Bytes::from("Hello"), true);
        let mut buf = BytesMut::new();
        let extra = encoder.encode(&frame, &mut buf).unwrap();

        // Only the header is written
        assert_eq!(buf.len(), FRAME_HEADER_SIZE);
        assert_eq!(buf[0..3], [0, 0, 5]);
        assert_eq!(buf[3], FrameType::Data.as_u8());
        assert_eq!(buf[4], FrameFlags::END_STREAM);
        assert_eq!(&buf[5..9], &[0, 0, 0, 1]);
        assert_eq!(extra, Some(Bytes::from("Hello")));
    }

    #[test]
    fn test_padding_unsupported() {
        let mut encoder = FrameEncoder::new();
        let frame = Frame::new(
            StreamId::new(1),
            FramePayload::Data(DataFrame::new(Bytes::from("Hi"), false).with_padding(10)),
        );
        assert!(matches!(
            encoder.encode_to_bytes(&frame),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn test_oversized_data_rejected() {
        let mut encoder = FrameEncoder::new();
        let frame = Frame::data(StreamId::new(1), Bytes::from(vec![0u8; 16385]), false);
        assert!(matches!(encoder.encode_to_bytes(&frame), Err(Error::FrameSize(_))));

        encoder.set_max_frame_size(32768);
        assert!(encoder.encode_to_bytes(&frame).is_ok());
    }

    #[test]
    fn test_encode_settings_frame() {
        let settings = SettingsBuilder::new()
            .header_table_size(8192)
            .enable_push(false)
            .initial_window_size(65535)
            .build()
            .unwrap();

        let mut encoder = FrameEncoder::new();
        let encoded = encoder.encode_to_bytes(&Frame::settings(settings)).unwrap();

        assert_eq!(encoded[3], FrameType::Settings.as_u8());
        assert_eq!(&encoded[5..9], &[0, 0, 0, 0]);
        // 3 settings * 6 bytes
        assert_eq!(encoded[0..3], [0, 0, 18]);
        assert_eq!(
            u16::from_be_bytes([encoded[9], encoded[10]]),
            SettingsParameter::HeaderTableSize.as_u16()
        );
    }

    #[test]
    fn test_encode_settings_ack() {
        let mut encoder = FrameEncoder::new();
        let encoded = encoder.encode_to_bytes(&Frame::settings_ack()).unwrap();
        assert_eq!(encoded.len(), FRAME_HEADER_SIZE);
        assert_eq!(encoded[4], FrameFlags::ACK);
    }

    #[test]
    fn test_encode_goaway_and_rst() {
        let mut encoder = FrameEncoder::new();
        let goaway = Frame::goaway(StreamId::new(7), ErrorCode::EnhanceYourCalm, Bytes::from("slow"));
        let encoded = encoder.encode_to_bytes(&goaway).unwrap();
        assert_eq!(encoded[0..3], [0, 0, 12]);
        assert_eq!(&encoded[9..13], &[0, 0, 0, 7]);
        assert_eq!(&encoded[13..17], &[0, 0, 0, 0xb]);
        assert_eq!(&encoded[17..], b"slow");

        let rst = encoder
            .encode_to_bytes(&Frame::rst_stream(StreamId::new(3), ErrorCode::Cancel))
            .unwrap();
        assert_eq!(&rst[9..], &[0, 0, 0, 0x8]);
    }

    #[test]
    fn test_large_header_block_uses_continuation() {
        let mut encoder = FrameEncoder::new();
        let mut headers = Headers::new();
        headers.add(":status", "200");
        // Random-looking values so Huffman coding can't shrink them much
        for i in 0..40 {
            headers.add(format!("x-header-{}", i), format!("{:0>900}", i * 7919));
        }
        let encoded = encoder
            .encode_to_bytes(&Frame::headers(StreamId::new(1), headers, false))
            .unwrap();

        let first_len = ((encoded[0] as usize) << 16) | ((encoded[1] as usize) << 8) | encoded[2] as usize;
        assert_eq!(first_len, DEFAULT_MAX_FRAME_SIZE as usize);
        assert_eq!(encoded[4] & FrameFlags::END_HEADERS, 0);

        let next = FRAME_HEADER_SIZE + first_len;
        assert_eq!(encoded[next + 3], FrameType::Continuation.as_u8());
    }
}
