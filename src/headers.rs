//! HTTP/2 header lists
//!
//! This module provides the ordered header list carried by HEADERS and
//! PUSH_PROMISE frames. Field names and values are raw bytes: HPACK does not
//! guarantee UTF-8, and validation is done separately by
//! [`crate::header_validation`].

use bytes::Bytes;
use std::fmt;

/// A single header field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: Bytes,
    pub value: Bytes,
}

impl HeaderField {
    /// Whether the name starts with `:`
    pub fn is_pseudo(&self) -> bool {
        self.name.first() == Some(&b':')
    }

    /// Size of the field as counted by SETTINGS_MAX_HEADER_LIST_SIZE
    pub fn list_size(&self) -> usize {
        self.name.len() + self.value.len() + 32
    }
}

/// Ordered header list
///
/// Headers are stored in wire order and support:
/// - Lookups by exact (lowercase) name
/// - Multiple values for the same header name
/// - Iteration over all fields
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    fields: Vec<HeaderField>,
}

impl Headers {
    /// Create a new empty header list
    pub fn new() -> Self {
        Headers::default()
    }

    /// Build from static name/value pairs
    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        let mut headers = Headers::new();
        for (name, value) in pairs {
            headers.add(name.to_string(), value.to_string());
        }
        headers
    }

    /// Append a field, keeping any existing fields with the same name
    pub fn add(&mut self, name: impl Into<Bytes>, value: impl Into<Bytes>) {
        self.fields.push(HeaderField {
            name: name.into(),
            value: value.into(),
        });
    }

    /// Get the first value for a header
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.fields
            .iter()
            .find(|f| f.name == name.as_bytes())
            .map(|f| f.value.as_ref())
    }

    /// Get the first value for a header as UTF-8
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| std::str::from_utf8(v).ok())
    }

    /// Get all values for a header
    pub fn get_all(&self, name: &str) -> Vec<&[u8]> {
        self.fields
            .iter()
            .filter(|f| f.name == name.as_bytes())
            .map(|f| f.value.as_ref())
            .collect()
    }

    /// Check if a header exists
    pub fn contains(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f.name == name.as_bytes())
    }

    /// Iterate over all fields in order
    pub fn iter(&self) -> std::slice::Iter<'_, HeaderField> {
        self.fields.iter()
    }

    /// Number of fields
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Uncompressed size as counted by SETTINGS_MAX_HEADER_LIST_SIZE
    pub fn list_size(&self) -> usize {
        self.fields.iter().map(HeaderField::list_size).sum()
    }
}

impl<'a> IntoIterator for &'a Headers {
    type Item = &'a HeaderField;
    type IntoIter = std::slice::Iter<'a, HeaderField>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.iter()
    }
}

impl FromIterator<(Vec<u8>, Vec<u8>)> for Headers {
    fn from_iter<I: IntoIterator<Item = (Vec<u8>, Vec<u8>)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.add(name, value);
        }
        headers
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for field in &self.fields {
            writeln!(
                f,
                "{}: {}",
                String::from_utf8_lossy(&field.name),
                String::from_utf8_lossy(&field.value)
            )?;
        }
        Ok(())
    }
}
