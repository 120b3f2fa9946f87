//! Reassembly of chunk streams into complete messages.
//!
//! A [`ChunkStore`] is owned by exactly one reader. It keeps one partial
//! buffer per in-flight message id, so chunks of different messages may be
//! interleaved on the stream, but the chunks of one message must arrive in
//! index order.

use crate::chunk::Chunk;
use crate::error::ProtocolError;
use crate::message::Message;
use crate::MAX_MESSAGE_SIZE;
use bytes::{BufMut, BytesMut};
use std::collections::HashMap;

#[derive(Debug)]
struct PartialMessage {
    buffer: BytesMut,
    declared_length: u64,
    total_chunks: u32,
    next_index: u32,
}

impl PartialMessage {
    fn received(&self) -> u64 {
        self.buffer.len() as u64
    }
}

/// Accumulates chunks per message id until each message is complete.
#[derive(Debug)]
pub struct ChunkStore {
    max_message_size: u64,
    partial: HashMap<u64, PartialMessage>,
}

impl ChunkStore {
    pub fn new() -> Self {
        Self::with_max_message_size(MAX_MESSAGE_SIZE)
    }

    /// Creates a store that rejects messages declaring more than `max` bytes.
    pub fn with_max_message_size(max: u64) -> Self {
        Self {
            max_message_size: max,
            partial: HashMap::new(),
        }
    }

    /// Stores a chunk.
    ///
    /// Returns `Ok(Some(message))` when the chunk completes its message,
    /// `Ok(None)` while more chunks are required. Any error is a framing
    /// error; the offending partial message is discarded.
    pub fn store_chunk(&mut self, chunk: Chunk) -> Result<Option<Message>, ProtocolError> {
        if chunk.is_first_chunk() {
            self.store_first(chunk)
        } else {
            self.store_followup(chunk)
        }
    }

    fn store_first(&mut self, chunk: Chunk) -> Result<Option<Message>, ProtocolError> {
        let id = chunk.message_id;
        if self.partial.contains_key(&id) {
            self.partial.remove(&id);
            return Err(ProtocolError::DuplicateMessage(id));
        }
        if chunk.message_length > self.max_message_size {
            return Err(ProtocolError::MessageTooLarge {
                message_id: id,
                length: chunk.message_length,
                max: self.max_message_size,
            });
        }

        let received = chunk.payload.len() as u64;
        if received > chunk.message_length {
            return Err(ProtocolError::LengthMismatch {
                message_id: id,
                declared: chunk.message_length,
                received,
            });
        }

        if received == chunk.message_length {
            // Single-chunk messages skip the copy.
            return Ok(Some(Message::new(id, chunk.payload)));
        }
        if chunk.total_chunks == 1 {
            return Err(ProtocolError::LengthMismatch {
                message_id: id,
                declared: chunk.message_length,
                received,
            });
        }

        let mut buffer = BytesMut::with_capacity(chunk.message_length as usize);
        buffer.put_slice(&chunk.payload);
        self.partial.insert(
            id,
            PartialMessage {
                buffer,
                declared_length: chunk.message_length,
                total_chunks: chunk.total_chunks,
                next_index: 1,
            },
        );
        Ok(None)
    }

    fn store_followup(&mut self, chunk: Chunk) -> Result<Option<Message>, ProtocolError> {
        let id = chunk.message_id;
        let partial = self
            .partial
            .get_mut(&id)
            .ok_or(ProtocolError::UnknownMessage(id))?;

        if chunk.chunk_index != partial.next_index {
            let expected = partial.next_index;
            self.partial.remove(&id);
            return Err(ProtocolError::UnexpectedChunk {
                message_id: id,
                expected,
                actual: chunk.chunk_index,
            });
        }

        let received = partial.received() + chunk.payload.len() as u64;
        if received > partial.declared_length {
            let declared = partial.declared_length;
            self.partial.remove(&id);
            return Err(ProtocolError::LengthMismatch {
                message_id: id,
                declared,
                received,
            });
        }

        partial.buffer.put_slice(&chunk.payload);
        partial.next_index += 1;

        if received == partial.declared_length {
            let partial = self
                .partial
                .remove(&id)
                .ok_or(ProtocolError::UnknownMessage(id))?;
            return Ok(Some(Message::new(id, partial.buffer.freeze())));
        }

        if partial.next_index >= partial.total_chunks {
            let declared = partial.declared_length;
            self.partial.remove(&id);
            return Err(ProtocolError::LengthMismatch {
                message_id: id,
                declared,
                received,
            });
        }

        Ok(None)
    }

    /// Number of messages with at least one chunk received.
    pub fn pending_messages(&self) -> usize {
        self.partial.len()
    }

    /// Drops every partial message.
    pub fn clear(&mut self) {
        self.partial.clear();
    }
}

impl Default for ChunkStore {
    fn default() -> Self {
        Self::new()
    }
}
