//! Binary chunk format for VelocyStream.
//!
//! Every logical message travels as one or more chunks. All integers are
//! little-endian.
//!
//! ```text
//! first chunk (24 bytes header):
//! +--------------+----------------------+------------+----------------+---------+
//! | chunk_length | (total_chunks<<1) | 1 | message_id | message_length | payload |
//! |   4 bytes    |       4 bytes        |  8 bytes   |    8 bytes     |         |
//! +--------------+----------------------+------------+----------------+---------+
//!
//! follow-up chunk (16 bytes header):
//! +--------------+----------------------+------------+---------+
//! | chunk_length |  chunk_index << 1    | message_id | payload |
//! |   4 bytes    |       4 bytes        |  8 bytes   |         |
//! +--------------+----------------------+------------+---------+
//! ```
//!
//! `chunk_length` counts the header as well as the payload.

use crate::error::ProtocolError;
use crate::MAX_CHUNK_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Header size of the first chunk of a message.
pub const FIRST_CHUNK_HEADER_SIZE: usize = 24;

/// Header size of every chunk after the first.
pub const FOLLOWUP_CHUNK_HEADER_SIZE: usize = 16;

/// Bytes that must be buffered before the header kind is known.
const HEADER_PREFIX_SIZE: usize = 8;

/// Largest chunk index or count representable in the 31-bit counter field.
const MAX_CHUNK_COUNTER: u32 = u32::MAX >> 1;

/// A single VelocyStream chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Identifier of the message this chunk belongs to.
    pub message_id: u64,
    /// Position of the chunk within its message (0 for the first chunk).
    pub chunk_index: u32,
    /// Number of chunks in the message. Only meaningful on the first chunk.
    pub total_chunks: u32,
    /// Length of the whole message in bytes. Only meaningful on the first chunk.
    pub message_length: u64,
    /// Chunk content.
    pub payload: Bytes,
}

impl Chunk {
    /// Creates the first chunk of a message.
    pub fn first(message_id: u64, total_chunks: u32, message_length: u64, payload: Bytes) -> Self {
        Self {
            message_id,
            chunk_index: 0,
            total_chunks,
            message_length,
            payload,
        }
    }

    /// Creates a follow-up chunk.
    pub fn followup(message_id: u64, chunk_index: u32, payload: Bytes) -> Self {
        Self {
            message_id,
            chunk_index,
            total_chunks: 0,
            message_length: 0,
            payload,
        }
    }

    pub fn is_first_chunk(&self) -> bool {
        self.chunk_index == 0
    }

    pub fn header_size(&self) -> usize {
        if self.is_first_chunk() {
            FIRST_CHUNK_HEADER_SIZE
        } else {
            FOLLOWUP_CHUNK_HEADER_SIZE
        }
    }

    /// Total encoded size, header included.
    pub fn encoded_len(&self) -> usize {
        self.header_size() + self.payload.len()
    }

    /// The combined index/count field.
    fn chunk_x(&self) -> u32 {
        if self.is_first_chunk() {
            (self.total_chunks << 1) | 1
        } else {
            self.chunk_index << 1
        }
    }

    /// Appends the encoded chunk to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        if self.payload.len() > MAX_CHUNK_SIZE {
            return Err(ProtocolError::ChunkTooLarge {
                size: self.payload.len(),
                max: MAX_CHUNK_SIZE,
            });
        }
        let counter = if self.is_first_chunk() {
            self.total_chunks
        } else {
            self.chunk_index
        };
        if counter > MAX_CHUNK_COUNTER {
            return Err(ProtocolError::ChunkIndexOverflow {
                index: counter as usize,
            });
        }

        buf.reserve(self.encoded_len());
        buf.put_u32_le(self.encoded_len() as u32);
        buf.put_u32_le(self.chunk_x());
        buf.put_u64_le(self.message_id);
        if self.is_first_chunk() {
            buf.put_u64_le(self.message_length);
        }
        buf.put_slice(&self.payload);
        Ok(())
    }

    /// Encodes the chunk into a fresh buffer.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf)?;
        Ok(buf)
    }

    /// Decodes a chunk from the front of `buf`.
    ///
    /// Returns `Ok(Some(chunk))` and consumes its bytes if a complete chunk
    /// is buffered, `Ok(None)` if more data is needed, or `Err` if the header
    /// is malformed.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < HEADER_PREFIX_SIZE {
            return Ok(None);
        }

        let length = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let chunk_x = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let first = chunk_x & 1 == 1;
        let header_size = if first {
            FIRST_CHUNK_HEADER_SIZE
        } else {
            FOLLOWUP_CHUNK_HEADER_SIZE
        };

        if (length as usize) < header_size {
            return Err(ProtocolError::ChunkTooShort {
                length,
                header_size,
            });
        }
        let content_len = length as usize - header_size;
        if content_len > MAX_CHUNK_SIZE {
            return Err(ProtocolError::ChunkTooLarge {
                size: content_len,
                max: MAX_CHUNK_SIZE,
            });
        }
        if buf.len() < length as usize {
            return Ok(None);
        }

        buf.advance(HEADER_PREFIX_SIZE);
        let message_id = buf.get_u64_le();
        let message_length = if first { buf.get_u64_le() } else { 0 };
        let payload = buf.split_to(content_len).freeze();

        let counter = chunk_x >> 1;
        if first {
            if counter == 0 {
                return Err(ProtocolError::ZeroChunkCount { message_id });
            }
            Ok(Some(Self::first(message_id, counter, message_length, payload)))
        } else {
            if counter == 0 {
                return Err(ProtocolError::ZeroFollowupIndex { message_id });
            }
            Ok(Some(Self::followup(message_id, counter, payload)))
        }
    }
}

/// Splits the concatenation of `buffers` into chunks of at most
/// `max_content_size` payload bytes each, in wire-send order.
///
/// A message always produces at least one chunk, even when empty.
pub fn split_message(
    message_id: u64,
    buffers: &[Bytes],
    max_content_size: usize,
) -> Result<Vec<Chunk>, ProtocolError> {
    if max_content_size == 0 || max_content_size > MAX_CHUNK_SIZE {
        return Err(ProtocolError::InvalidChunkSize(max_content_size));
    }

    let data = match buffers {
        [] => Bytes::new(),
        [single] => single.clone(),
        many => {
            let total: usize = many.iter().map(Bytes::len).sum();
            let mut joined = BytesMut::with_capacity(total);
            for part in many {
                joined.put_slice(part);
            }
            joined.freeze()
        }
    };

    let length = data.len();
    let count = length.div_ceil(max_content_size).max(1);
    if count > MAX_CHUNK_COUNTER as usize {
        return Err(ProtocolError::ChunkIndexOverflow { index: count });
    }

    let mut chunks = Vec::with_capacity(count);
    for index in 0..count {
        let start = index * max_content_size;
        let end = (start + max_content_size).min(length);
        let payload = data.slice(start..end);
        if index == 0 {
            chunks.push(Chunk::first(
                message_id,
                count as u32,
                length as u64,
                payload,
            ));
        } else {
            chunks.push(Chunk::followup(message_id, index as u32, payload));
        }
    }
    Ok(chunks)
}
