//! HTTP/2 stream identifiers (RFC 7540 Section 5.1.1)

use std::fmt;

/// A 31-bit stream identifier
///
/// Odd IDs are opened by clients, even non-zero IDs by servers, and ID 0 is the
/// connection-scoped root stream. IDs are ordered but deliberately offer no
/// arithmetic; only the stream collection reasons about "next" IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct StreamId(u32);

impl StreamId {
    /// The connection-scoped stream
    pub const ROOT: StreamId = StreamId(0);

    /// Largest representable stream ID (2^31 - 1)
    pub const MAX: StreamId = StreamId(0x7FFF_FFFF);

    /// Create a stream ID, masking off the reserved high bit
    pub const fn new(value: u32) -> Self {
        StreamId(value & 0x7FFF_FFFF)
    }

    /// Raw 31-bit value
    pub const fn value(self) -> u32 {
        self.0
    }

    /// Whether this is stream 0
    pub fn is_root(self) -> bool {
        self.0 == 0
    }

    /// Odd stream IDs are client-initiated
    pub fn is_client_initiated(self) -> bool {
        self.0 % 2 == 1
    }

    /// Even, non-zero stream IDs are server-initiated
    pub fn is_server_initiated(self) -> bool {
        self.0 != 0 && self.0 % 2 == 0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for StreamId {
    fn from(value: u32) -> Self {
        StreamId::new(value)
    }
}

impl From<StreamId> for u32 {
    fn from(id: StreamId) -> Self {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_bit_masked() {
        assert_eq!(StreamId::new(0x8000_0001).value(), 1);
        assert_eq!(StreamId::new(0xFFFF_FFFF), StreamId::MAX);
    }

    #[test]
    fn test_initiator_parity() {
        assert!(StreamId::ROOT.is_root());
        assert!(!StreamId::ROOT.is_client_initiated());
        assert!(!StreamId::ROOT.is_server_initiated());
        assert!(StreamId::new(1).is_client_initiated());
        assert!(StreamId::new(2).is_server_initiated());
        assert!(!StreamId::new(3).is_server_initiated());
    }

    #[test]
    fn test_ordering() {
        assert!(StreamId::new(3) > StreamId::new(1));
        assert!(StreamId::ROOT < StreamId::new(1));
    }
}
