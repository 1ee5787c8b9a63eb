//! Growable network buffer.
//!
//! `NetBuf` wraps [`bytes::BytesMut`] with the handful of operations the
//! protocol paths need: append on the write side, consume from the front on
//! the parse side, and delimiter scans. Consuming from the front is O(1);
//! `BytesMut` reclaims the consumed prefix on `reserve`, which gives the
//! compaction behaviour long-lived keep-alive connections rely on.

use bytes::{Buf, BytesMut};

const INITIAL_CAPACITY: usize = 4 * 1024;

#[derive(Debug, Default)]
pub struct NetBuf {
    data: BytesMut,
}

impl NetBuf {
    pub fn new() -> Self {
        Self {
            data: BytesMut::with_capacity(INITIAL_CAPACITY),
        }
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(cap),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Unconsumed bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Make room for at least `additional` more bytes, compacting the
    /// already-consumed prefix when possible.
    pub fn reserve(&mut self, additional: usize) {
        self.data.reserve(additional);
    }

    /// Append from a reader-style call: expose spare capacity as a slice.
    /// Callers read into `spare_mut()` and then `commit(n)`.
    pub fn spare_mut(&mut self, min: usize) -> &mut [u8] {
        self.data.reserve(min);
        let len = self.data.len();
        self.data.resize(len + min, 0);
        &mut self.data[len..]
    }

    /// Shrink back after reading `n` bytes into the spare area exposed by
    /// `spare_mut(min)`.
    pub fn commit(&mut self, min: usize, n: usize) {
        debug_assert!(n <= min);
        let len = self.data.len();
        self.data.truncate(len - (min - n));
    }

    /// Remove and return the first `n` bytes.
    pub fn consume(&mut self, n: usize) -> BytesMut {
        debug_assert!(n <= self.data.len());
        self.data.split_to(n)
    }

    /// Drop the first `n` bytes without copying them out.
    pub fn skip(&mut self, n: usize) {
        debug_assert!(n <= self.data.len());
        self.data.advance(n);
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// First occurrence of `needle` in the unconsumed bytes.
    pub fn find(&self, needle: &[u8]) -> Option<usize> {
        find(&self.data, needle)
    }
}

/// Find a byte sequence inside a slice.
pub fn find(data: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    if data.len() < needle.len() {
        return None;
    }
    data.windows(needle.len()).position(|w| w == needle)
}
