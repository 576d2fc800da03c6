//! Outbound FIFO with partial-write resumption.
//!
//! Each entry is one fully serialized message. Only the head entry is ever
//! written, so bytes of different messages never interleave on the wire.

use crate::transport::Transport;
use bytes::Bytes;
use std::collections::VecDeque;
use std::io;
use tracing::trace;

/// Queue of serialized messages waiting to be flushed
#[derive(Debug, Default)]
pub struct SendQueue {
    entries: VecDeque<Bytes>,
    /// Bytes of the head entry already written
    offset: usize,
}

impl SendQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a serialized message
    pub fn push(&mut self, bytes: Bytes) {
        if !bytes.is_empty() {
            self.entries.push_back(bytes);
        }
    }

    /// Whether anything is left to write
    pub fn has_unsent(&self) -> bool {
        !self.entries.is_empty()
    }

    /// Number of queued messages, including a partially written head
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bytes still to be written across all entries
    pub fn pending_bytes(&self) -> usize {
        self.entries.iter().map(Bytes::len).sum::<usize>() - self.offset
    }

    /// Perform one non-blocking write of the head entry.
    ///
    /// Returns the number of bytes written. A partial write is resumed from the
    /// same offset on the next call.
    pub fn update_send(&mut self, transport: &mut dyn Transport) -> io::Result<usize> {
        let Some(head) = self.entries.front() else {
            return Ok(0);
        };

        let written = transport.send(&head[self.offset..])?;
        self.offset += written;

        if self.offset == head.len() {
            trace!("Flushed {} byte message", head.len());
            self.entries.pop_front();
            self.offset = 0;
        } else if written > 0 {
            trace!("Partial write: {} of {} bytes", self.offset, head.len());
        }

        Ok(written)
    }

    /// Drop everything, including a partially written head
    pub fn clear(&mut self) {
        self.entries.clear();
        self.offset = 0;
    }
}
