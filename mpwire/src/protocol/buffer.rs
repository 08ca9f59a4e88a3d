//! Receive buffer for trailer matching.
//!
//! Reads from the device arrive in arbitrary chunks. A chunk may end in the
//! middle of a trailer, or carry bytes that belong to the next exchange.
//! `ReadBuffer` accumulates everything and hands out exactly the bytes up to
//! a match, keeping the remainder for the next read.

use bytes::{Bytes, BytesMut};
use memchr::memmem;

/// Accumulating buffer for device output.
#[derive(Debug)]
pub struct ReadBuffer {
    /// Bytes received but not yet consumed.
    buffer: BytesMut,
}

impl ReadBuffer {
    /// Create an empty buffer with the given initial capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
        }
    }

    /// Append freshly received bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Byte offset just past the first occurrence of `ending`.
    pub fn find(&self, ending: &[u8]) -> Option<usize> {
        if ending.is_empty() {
            return Some(0);
        }
        memmem::find(&self.buffer, ending).map(|pos| pos + ending.len())
    }

    /// Remove and return everything up to and including `ending`.
    ///
    /// Returns `None` (and leaves the buffer untouched) if `ending` has not
    /// arrived yet.
    pub fn take_through(&mut self, ending: &[u8]) -> Option<Bytes> {
        let end = self.find(ending)?;
        Some(self.buffer.split_to(end).freeze())
    }

    /// Remove and return at most `n` bytes from the front.
    pub fn take_up_to(&mut self, n: usize) -> Bytes {
        let n = n.min(self.buffer.len());
        self.buffer.split_to(n).freeze()
    }

    /// Remove and return everything.
    pub fn take_all(&mut self) -> Bytes {
        self.buffer.split().freeze()
    }

    /// Get a reference to the buffered bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    /// Get the current buffer length.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Discard everything buffered.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for ReadBuffer {
    fn default() -> Self {
        Self::new(4096)
    }
}
