//! Ordered, case-insensitive header map.
//!
//! Names are validated against the RFC 7230 token alphabet on parse,
//! lookups compare case-insensitively, and serialization preserves
//! insertion order. Values are trimmed on parse; the original name casing
//! is kept for the wire.

use crate::error::{WebError, WebResult};

#[derive(Debug, Clone, Default)]
pub struct HeaderMap {
    items: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// First value for `name`, if present.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.items
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values for `name`, in insertion order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.items
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Replace the value of `name` in place (keeping its position), or
    /// append when absent. Later duplicates are dropped.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        let mut replaced = false;
        self.items.retain_mut(|(n, v)| {
            if n.eq_ignore_ascii_case(name) {
                if replaced {
                    return false;
                }
                *v = value.clone();
                replaced = true;
            }
            true
        });
        if !replaced {
            self.items.push((name.to_string(), value));
        }
    }

    /// Append without replacing existing entries (`Set-Cookie` and friends).
    pub fn add(&mut self, name: &str, value: impl Into<String>) {
        self.items.push((name.to_string(), value.into()));
    }

    pub fn remove(&mut self, name: &str) {
        self.items.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.items.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Parse a header block (the lines between the first line and the
    /// blank line), rejecting names outside the token alphabet.
    pub fn parse_block(block: &[u8]) -> WebResult<HeaderMap> {
        let text = std::str::from_utf8(block)
            .map_err(|_| WebError::BadArgs("header block is not valid utf-8".into()))?;
        let mut map = HeaderMap::new();
        for line in text.split("\r\n") {
            if line.is_empty() {
                continue;
            }
            let colon = line
                .find(':')
                .ok_or_else(|| WebError::BadArgs(format!("header missing colon: {}", line)))?;
            let name = &line[..colon];
            if !is_token(name) {
                return Err(WebError::BadArgs(format!("bad header name: {}", name)));
            }
            let value = line[colon + 1..].trim();
            map.add(name, value);
        }
        Ok(map)
    }

    /// Serialize as `Name: value\r\n` lines in insertion order (no
    /// terminating blank line).
    pub fn serialize(&self, out: &mut Vec<u8>) {
        for (name, value) in self.iter() {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
    }
}

/// RFC 7230 `token` alphabet for header field names.
pub fn is_token(name: &str) -> bool {
    !name.is_empty()
        && name.bytes().all(|b| {
            b.is_ascii_alphanumeric()
                || matches!(
                    b,
                    b'!' | b'#'
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
        })
}
