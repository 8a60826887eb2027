//! Content-length verification (RFC 7540 Section 8.1.2.6)

use crate::error::{Error, Result};
use crate::headers::Headers;

/// Tracks declared versus observed body length for one direction of a stream
///
/// A verifier built from a header block without `content-length` is disabled
/// and accepts any body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContentLengthVerifier {
    remaining: Option<u64>,
}

impl ContentLengthVerifier {
    /// A verifier that accepts any body
    pub const DISABLED: ContentLengthVerifier = ContentLengthVerifier { remaining: None };

    /// A verifier expecting exactly `length` bytes
    pub fn expecting(length: u64) -> Self {
        ContentLengthVerifier {
            remaining: Some(length),
        }
    }

    /// Build from a request or push-promise header block
    pub fn from_headers(headers: &Headers) -> Result<Self> {
        let mut declared: Option<u64> = None;

        for value in headers.get_all("content-length") {
            let parsed = parse_length(value)?;
            match declared {
                Some(existing) if existing != parsed => {
                    return Err(Error::InvalidContentLength {
                        value: String::from_utf8_lossy(value).into_owned(),
                    })
                }
                _ => declared = Some(parsed),
            }
        }

        Ok(ContentLengthVerifier {
            remaining: declared,
        })
    }

    /// Build from a response header block
    ///
    /// Responses to HEAD, and 204/304 responses, never carry a body whatever
    /// their `content-length` says.
    pub fn for_response(headers: &Headers, request_is_head: bool) -> Result<Self> {
        let verifier = Self::from_headers(headers)?;
        let bodiless_status = matches!(headers.get(":status"), Some(b"204") | Some(b"304"));
        if request_is_head || bodiless_status {
            return Ok(Self::expecting(0));
        }
        Ok(verifier)
    }

    /// Whether tracking is enabled
    pub fn is_enabled(&self) -> bool {
        self.remaining.is_some()
    }

    /// Bytes still expected, if tracking
    pub fn remaining(&self) -> Option<u64> {
        self.remaining
    }

    /// Account for a DATA chunk
    pub fn received_data_chunk(&mut self, length: usize) -> Result<()> {
        if let Some(remaining) = self.remaining {
            self.remaining = Some(
                remaining
                    .checked_sub(length as u64)
                    .ok_or(Error::ContentLengthViolated)?,
            );
        }
        Ok(())
    }

    /// Check the body is complete at END_STREAM
    pub fn end_of_stream(&self) -> Result<()> {
        match self.remaining {
            None | Some(0) => Ok(()),
            Some(_) => Err(Error::ContentLengthViolated),
        }
    }
}

fn parse_length(value: &[u8]) -> Result<u64> {
    std::str::from_utf8(value)
        .ok()
        .filter(|s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::InvalidContentLength {
            value: String::from_utf8_lossy(value).into_owned(),
        })
}
