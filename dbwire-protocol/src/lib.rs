//! # dbwire-protocol
//!
//! Wire protocol implementation for dbwire.
//!
//! This crate provides:
//! - Chunk framing: splitting messages into bounded chunks and reassembling
//!   them, with chunks of different messages interleaved on one stream
//! - Request/response/authentication envelopes
//! - Content codecs (JSON and MessagePack) with pointer-addressed decoding
//! - Host descriptions and cluster endpoint parsing

pub mod chunk;
pub mod codec;
pub mod content;
pub mod error;
pub mod host;
pub mod message;

pub use chunk::{Chunk, ChunkDescriptor, CHUNK_HEADER_SIZE, FIRST_CHUNK_HEADER_SIZE};
pub use codec::{AssembledMessage, ChunkDecoder, Encoder, MessageAssembler};
pub use content::{
    ContentCodec, ContentSerde, ContentType, DocumentMeta, JsonCodec, PackCodec,
};
pub use error::{ContentError, ProtocolError};
pub use host::HostDescription;
pub use message::{
    Credential, IncomingMessage, Method, Request, Response, ACCEPT_HEADER, CONTENT_TYPE_HEADER,
};

/// Version stamped into every message header.
pub const PROTOCOL_VERSION: u32 = 1;

/// Bytes a client writes right after the transport is established.
pub const PREAMBLE: &[u8] = b"DBW/1.0\r\n\r\n";

/// Default maximum payload bytes carried by one chunk.
pub const DEFAULT_MAX_CHUNK_CONTENT: usize = 30_000;

/// Upper bound for a single chunk, header included (16 MiB).
pub const MAX_CHUNK_LENGTH: u32 = 16 * 1024 * 1024;

/// Upper bound for a reassembled message (512 MiB).
pub const MAX_MESSAGE_SIZE: u64 = 512 * 1024 * 1024;
