//! Header block legality checks (RFC 7540 Section 8.1.2)
//!
//! A decoded header block is checked against one of three profiles: request,
//! response, or trailers. Each profile declares which pseudo-headers are
//! allowed and which are mandatory; the walk over the block enforces ordering,
//! uniqueness, field-name syntax and the connection-specific field ban.

use crate::error::{Error, Result};
use crate::headers::Headers;

/// The kind of header block being validated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderBlockType {
    Request,
    Response,
    Trailers,
}

/// Small set of RFC 7540 pseudo-headers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PseudoHeaders(u8);

impl PseudoHeaders {
    pub const PATH: PseudoHeaders = PseudoHeaders(0x01);
    pub const METHOD: PseudoHeaders = PseudoHeaders(0x02);
    pub const SCHEME: PseudoHeaders = PseudoHeaders(0x04);
    pub const AUTHORITY: PseudoHeaders = PseudoHeaders(0x08);
    pub const STATUS: PseudoHeaders = PseudoHeaders(0x10);

    const ALL: [(PseudoHeaders, &'static str); 5] = [
        (PseudoHeaders::PATH, ":path"),
        (PseudoHeaders::METHOD, ":method"),
        (PseudoHeaders::SCHEME, ":scheme"),
        (PseudoHeaders::AUTHORITY, ":authority"),
        (PseudoHeaders::STATUS, ":status"),
    ];

    pub const fn empty() -> Self {
        PseudoHeaders(0)
    }

    pub const fn union(self, other: PseudoHeaders) -> Self {
        PseudoHeaders(self.0 | other.0)
    }

    pub fn contains(self, other: PseudoHeaders) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: PseudoHeaders) {
        self.0 |= other.0;
    }

    pub fn is_subset_of(self, other: PseudoHeaders) -> bool {
        other.contains(self)
    }

    /// Look up a pseudo-header by its full name, including the colon
    pub fn from_name(name: &[u8]) -> Option<Self> {
        Self::ALL
            .iter()
            .find(|(_, n)| n.as_bytes() == name)
            .map(|(p, _)| *p)
    }

    /// Names of the members, in canonical order
    pub fn names(self) -> Vec<String> {
        Self::ALL
            .iter()
            .filter(|(p, _)| self.contains(*p))
            .map(|(_, n)| n.to_string())
            .collect()
    }
}

const REQUEST_ALLOWED: PseudoHeaders = PseudoHeaders::PATH
    .union(PseudoHeaders::METHOD)
    .union(PseudoHeaders::SCHEME)
    .union(PseudoHeaders::AUTHORITY);
const REQUEST_MANDATORY: PseudoHeaders = PseudoHeaders::PATH
    .union(PseudoHeaders::METHOD)
    .union(PseudoHeaders::SCHEME);
const CONNECT_ALLOWED: PseudoHeaders = PseudoHeaders::METHOD.union(PseudoHeaders::AUTHORITY);
const CONNECT_MANDATORY: PseudoHeaders = CONNECT_ALLOWED;
const RESPONSE_ALLOWED: PseudoHeaders = PseudoHeaders::STATUS;
const RESPONSE_MANDATORY: PseudoHeaders = PseudoHeaders::STATUS;

/// Connection-specific fields that must not appear in HTTP/2 (RFC 7540 Section 8.1.2.2)
const FORBIDDEN_FIELDS: [&[u8]; 3] = [b"connection", b"transfer-encoding", b"proxy-connection"];

/// Validate a request header block
pub fn validate_request_block(headers: &Headers) -> Result<()> {
    validate(headers, HeaderBlockType::Request)
}

/// Validate a response header block
pub fn validate_response_block(headers: &Headers) -> Result<()> {
    validate(headers, HeaderBlockType::Response)
}

/// Validate a trailers header block
pub fn validate_trailers_block(headers: &Headers) -> Result<()> {
    validate(headers, HeaderBlockType::Trailers)
}

/// Validate a header block against the profile for `block_type`
pub fn validate(headers: &Headers, block_type: HeaderBlockType) -> Result<()> {
    let mut seen = PseudoHeaders::empty();
    let mut seen_regular_header = false;
    let mut is_connect = false;

    for field in headers {
        if field.is_pseudo() {
            validate_field_name(&field.name[1..], &field.name)?;

            if seen_regular_header {
                return Err(Error::PseudoHeaderAfterRegularHeader {
                    name: lossy(&field.name),
                });
            }

            let pseudo = PseudoHeaders::from_name(&field.name).ok_or_else(|| {
                Error::UnknownPseudoHeader {
                    name: lossy(&field.name),
                }
            })?;

            if seen.contains(pseudo) {
                return Err(Error::DuplicatePseudoHeader {
                    name: lossy(&field.name),
                });
            }
            seen.insert(pseudo);

            if pseudo == PseudoHeaders::PATH && field.value.is_empty() {
                return Err(Error::EmptyPathHeader);
            }
            if pseudo == PseudoHeaders::METHOD && field.value == "CONNECT" {
                is_connect = true;
            }
            if pseudo == PseudoHeaders::STATUS && !is_valid_status(&field.value) {
                return Err(Error::InvalidStatusValue {
                    value: lossy(&field.value),
                });
            }
        } else {
            validate_field_name(&field.name, &field.name)?;
            seen_regular_header = true;

            if FORBIDDEN_FIELDS.contains(&&field.name[..])
                || (block_type == HeaderBlockType::Request
                    && field.name == "te"
                    && field.value != "trailers")
            {
                return Err(Error::ForbiddenHeaderField {
                    name: lossy(&field.name),
                    value: lossy(&field.value),
                });
            }
        }
    }

    let (allowed, mandatory) = match block_type {
        HeaderBlockType::Request if is_connect => (CONNECT_ALLOWED, CONNECT_MANDATORY),
        HeaderBlockType::Request => (REQUEST_ALLOWED, REQUEST_MANDATORY),
        HeaderBlockType::Response => (RESPONSE_ALLOWED, RESPONSE_MANDATORY),
        HeaderBlockType::Trailers => (PseudoHeaders::empty(), PseudoHeaders::empty()),
    };

    if !seen.is_subset_of(allowed) || !mandatory.is_subset_of(seen) {
        return Err(Error::InvalidPseudoHeaders {
            pseudo_headers: seen.names(),
        });
    }

    Ok(())
}

/// Whether a response header block is informational (`:status` 1xx)
pub fn is_informational_response(headers: &Headers) -> bool {
    headers
        .get(":status")
        .map_or(false, |status| status.first() == Some(&b'1'))
}

/// RFC 7230 `tchar`, restricted to lowercase as RFC 7540 requires
fn is_lowercase_tchar(byte: u8) -> bool {
    matches!(
        byte,
        b'a'..=b'z'
            | b'0'..=b'9'
            | b'!'
            | b'#'
            | b'$'
            | b'%'
            | b'&'
            | b'\''
            | b'*'
            | b'+'
            | b'-'
            | b'.'
            | b'^'
            | b'_'
            | b'`'
            | b'|'
            | b'~'
    )
}

fn validate_field_name(token: &[u8], full_name: &[u8]) -> Result<()> {
    if token.is_empty() || !token.iter().copied().all(is_lowercase_tchar) {
        return Err(Error::InvalidHeaderFieldName {
            name: lossy(full_name),
        });
    }
    Ok(())
}

fn is_valid_status(value: &[u8]) -> bool {
    value.len() == 3 && value.iter().all(u8::is_ascii_digit)
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}
