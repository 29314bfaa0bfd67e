//! Line Framer
//!
//! Splits a connection's byte stream into newline-terminated messages. Only
//! `\n` terminates a message; a trailing `\r` is left in the line.

use bytes::{Bytes, BytesMut};
use crate::protocol::constants::LINE_TERMINATOR;

/// Per-connection receive buffer
#[derive(Debug, Default)]
pub struct LineFramer {
    buffer: BytesMut,
}

impl LineFramer {
    /// Create an empty framer
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and extract every complete line, in order.
    ///
    /// Bytes after the last terminator stay buffered for the next call.
    /// Empty lines are dropped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == LINE_TERMINATOR) {
            let mut line = self.buffer.split_to(pos + 1);
            line.truncate(pos);
            if !line.is_empty() {
                lines.push(line.freeze());
            }
        }
        lines
    }

    /// Number of buffered bytes still waiting for a terminator
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Discard any buffered bytes
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
