//! # velocy-protocol
//!
//! Wire protocol implementation for VelocyStream (VST).
//!
//! This crate provides:
//! - Binary chunk framing with little-endian headers
//! - Splitting of logical messages into bounded-size chunks
//! - Reassembly of interleaved chunk streams into complete messages
//! - Request/Response envelope types and their head encoding
//! - Error types and protocol constants
//!
//! It performs no I/O; connections feed it bytes and drain messages.

pub mod chunk;
pub mod codec;
pub mod error;
pub mod message;
pub mod store;

pub use chunk::{split_message, Chunk, FIRST_CHUNK_HEADER_SIZE, FOLLOWUP_CHUNK_HEADER_SIZE};
pub use codec::{ChunkDecoder, ChunkEncoder};
pub use error::ProtocolError;
pub use message::{
    AuthenticationRequest, Message, MessageType, Request, RequestType, Response,
    ALLOW_DIRTY_READ_HEADER,
};
pub use store::ChunkStore;

/// Protocol header written by the client right after the socket connects.
pub const PROTOCOL_HEADER: &[u8; 11] = b"VST/1.0\r\n\r\n";

/// Envelope version carried as the first element of every head.
pub const ENVELOPE_VERSION: u8 = 1;

/// Default maximum chunk content size in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 30_000;

/// Upper bound on the content of a single chunk (1 MiB).
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// Upper bound on a reassembled message (256 MiB).
pub const MAX_MESSAGE_SIZE: u64 = 256 * 1024 * 1024;

/// Default VelocyStream port.
pub const DEFAULT_PORT: u16 = 8529;
