//! HTTP/2 frame encoding and decoding
//!
//! The codec translates between byte streams and typed [`Frame`] values and
//! knows nothing about connection or stream semantics. Header blocks are
//! compressed and decompressed with the `hpack` crate.
//!
//! [`Frame`]: crate::frames::Frame

mod decoder;
mod encoder;

pub use decoder::FrameDecoder;
pub use encoder::FrameEncoder;

use crate::frames::{FrameFlags, FrameHeader};
use crate::stream_id::StreamId;
use bytes::BufMut;

/// HTTP/2 frame header size (9 bytes)
pub const FRAME_HEADER_SIZE: usize = 9;

/// Write a frame header (RFC 7540 Section 4.1)
///
/// The reserved bit of the stream identifier is always cleared.
pub fn encode_frame_header<B: BufMut>(
    buf: &mut B,
    length: usize,
    frame_type: u8,
    flags: FrameFlags,
    stream_id: StreamId,
) {
    // Length (24 bits, big-endian)
    buf.put_u8(((length >> 16) & 0xFF) as u8);
    buf.put_u8(((length >> 8) & 0xFF) as u8);
    buf.put_u8((length & 0xFF) as u8);

    buf.put_u8(frame_type);
    buf.put_u8(flags.as_u8());
    buf.put_u32(stream_id.value() & 0x7FFF_FFFF);
}

/// Parse a frame header
pub fn decode_frame_header(bytes: &[u8; FRAME_HEADER_SIZE]) -> FrameHeader {
    let length = ((bytes[0] as usize) << 16) | ((bytes[1] as usize) << 8) | (bytes[2] as usize);

    let stream_id = ((bytes[5] as u32 & 0x7F) << 24)
        | ((bytes[6] as u32) << 16)
        | ((bytes[7] as u32) << 8)
        | (bytes[8] as u32);

    FrameHeader {
        length,
        raw_type: bytes[3],
        flags: FrameFlags::from_u8(bytes[4]),
        stream_id: StreamId::new(stream_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::FrameType;

    #[test]
    fn test_encode_decode_header() {
        let flags = FrameFlags::from_u8(FrameFlags::END_STREAM | FrameFlags::END_HEADERS);
        let mut buf = Vec::new();
        encode_frame_header(&mut buf, 1234, FrameType::Headers.as_u8(), flags, StreamId::new(42));
        assert_eq!(buf.len(), FRAME_HEADER_SIZE);

        let mut raw = [0u8; FRAME_HEADER_SIZE];
        raw.copy_from_slice(&buf);
        let header = decode_frame_header(&raw);

        assert_eq!(header.frame_type(), Some(FrameType::Headers));
        assert_eq!(header.flags, flags);
        assert_eq!(header.stream_id, StreamId::new(42));
        assert_eq!(header.length, 1234);
    }

    #[test]
    fn test_reserved_bit_ignored() {
        let raw = [0, 0, 4, 0x8, 0, 0x80, 0, 0, 1];
        let header = decode_frame_header(&raw);
        assert_eq!(header.stream_id, StreamId::new(1));
        assert_eq!(header.frame_type(), Some(FrameType::WindowUpdate));
    }

    #[test]
    fn test_unknown_type_preserved() {
        let raw = [0, 0, 0, 0xEE, 0, 0, 0, 0, 0];
        let header = decode_frame_header(&raw);
        assert_eq!(header.raw_type, 0xEE);
        assert_eq!(header.frame_type(), None);
    }
}
