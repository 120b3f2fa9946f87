//! Protocol error types.

use thiserror::Error;

/// Protocol-level errors raised while framing, reassembling or decoding messages.
///
/// Every variant except [`ProtocolError::Json`] on an outbound encode is a
/// framing error: the byte stream can no longer be trusted and the
/// connection that produced it must be closed.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("chunk length {length} is shorter than its {header_size}-byte header")]
    ChunkTooShort { length: u32, header_size: usize },

    #[error("chunk too large: {size} bytes (max {max})")]
    ChunkTooLarge { size: usize, max: usize },

    #[error("first chunk of message {message_id} declares zero chunks")]
    ZeroChunkCount { message_id: u64 },

    #[error("follow-up chunk of message {message_id} carries index 0")]
    ZeroFollowupIndex { message_id: u64 },

    #[error("chunk index {index} exceeds chunk counter range")]
    ChunkIndexOverflow { index: usize },

    #[error("invalid chunk content size: {0}")]
    InvalidChunkSize(usize),

    #[error("message {message_id} too large: {length} bytes (max {max})")]
    MessageTooLarge {
        message_id: u64,
        length: u64,
        max: u64,
    },

    #[error("follow-up chunk for unknown message {0}")]
    UnknownMessage(u64),

    #[error("duplicate first chunk for message {0}")]
    DuplicateMessage(u64),

    #[error("message {message_id}: expected chunk {expected}, got {actual}")]
    UnexpectedChunk {
        message_id: u64,
        expected: u32,
        actual: u32,
    },

    #[error("message {message_id}: received {received} bytes, declared {declared}")]
    LengthMismatch {
        message_id: u64,
        declared: u64,
        received: u64,
    },

    #[error("stream ended with {buffered} undecoded bytes")]
    TruncatedStream { buffered: usize },

    #[error("missing message head")]
    MissingHead,

    #[error("unexpected message type {actual} (expected {expected})")]
    UnexpectedMessageType { expected: u16, actual: u16 },

    #[error("unknown request type code: {0}")]
    UnknownRequestType(u8),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
