//! Encoder and decoder for chunk streams.

use crate::chunk::{split_message, Chunk};
use crate::error::ProtocolError;
use crate::{DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};
use bytes::{Bytes, BytesMut};

/// Splits messages into chunks and serializes them for the wire.
#[derive(Debug, Clone, Copy)]
pub struct ChunkEncoder {
    max_content_size: usize,
}

impl ChunkEncoder {
    /// Creates an encoder producing chunks of at most `max_content_size`
    /// payload bytes.
    pub fn new(max_content_size: usize) -> Result<Self, ProtocolError> {
        if max_content_size == 0 || max_content_size > MAX_CHUNK_SIZE {
            return Err(ProtocolError::InvalidChunkSize(max_content_size));
        }
        Ok(Self { max_content_size })
    }

    pub fn max_content_size(&self) -> usize {
        self.max_content_size
    }

    /// Splits a message into chunks in wire-send order.
    pub fn split(&self, message_id: u64, buffers: &[Bytes]) -> Result<Vec<Chunk>, ProtocolError> {
        split_message(message_id, buffers, self.max_content_size)
    }

    /// Splits and serializes a message into one contiguous buffer.
    pub fn encode_message(
        &self,
        message_id: u64,
        buffers: &[Bytes],
    ) -> Result<BytesMut, ProtocolError> {
        let chunks = self.split(message_id, buffers)?;
        let total = chunks.iter().map(Chunk::encoded_len).sum();
        let mut buf = BytesMut::with_capacity(total);
        for chunk in &chunks {
            chunk.encode_into(&mut buf)?;
        }
        Ok(buf)
    }
}

impl Default for ChunkEncoder {
    fn default() -> Self {
        Self {
            max_content_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Decodes chunks from a byte stream delivered in arbitrary pieces.
pub struct ChunkDecoder {
    buffer: BytesMut,
}

impl ChunkDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to decode the next chunk from the buffer.
    pub fn decode_chunk(&mut self) -> Result<Option<Chunk>, ProtocolError> {
        Chunk::decode(&mut self.buffer)
    }

    /// Checks that the stream ended on a chunk boundary.
    pub fn finish(&self) -> Result<(), ProtocolError> {
        if self.buffer.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::TruncatedStream {
                buffered: self.buffer.len(),
            })
        }
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for ChunkDecoder {
    fn default() -> Self {
        Self::new()
    }
}
