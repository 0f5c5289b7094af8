//! Protocol and content codec error types.

use thiserror::Error;

/// Errors raised while framing, reassembling or decoding wire messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("chunk length {length} is shorter than its {header}-byte header")]
    ChunkTooShort { length: u32, header: usize },

    #[error("chunk too large: {size} bytes (max {max})")]
    ChunkTooLarge { size: u32, max: u32 },

    #[error("invalid chunk descriptor: {0:#x}")]
    InvalidDescriptor(u32),

    #[error("message needs {0} chunks, more than a descriptor can address")]
    TooManyChunks(usize),

    #[error("message {message_id}: first chunk declares zero chunks")]
    ZeroChunkCount { message_id: u64 },

    #[error("message {message_id}: chunk index {index} outside [0, {total})")]
    ChunkIndexOutOfRange {
        message_id: u64,
        index: u32,
        total: u32,
    },

    #[error("message {message_id}: chunk {index} received twice")]
    DuplicateChunk { message_id: u64, index: u32 },

    #[error("message id {0} collides with an incomplete message")]
    MessageIdCollision(u64),

    #[error("message {message_id}: received {received} bytes, declared {declared}")]
    LengthMismatch {
        message_id: u64,
        declared: u64,
        received: u64,
    },

    #[error("message {message_id}: {size} bytes exceeds limit of {max}")]
    MessageTooLarge { message_id: u64, size: u64, max: u64 },

    #[error("truncated message payload: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("malformed message header: {0}")]
    InvalidHeader(String),

    #[error("unexpected message type: {0}")]
    UnexpectedMessageType(u32),

    #[error("unsupported message version: {0}")]
    UnsupportedVersion(u32),

    #[error("unknown request method code: {0}")]
    UnknownMethod(u8),

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("header encode error: {0}")]
    HeaderEncode(#[from] rmp_serde::encode::Error),
}

impl ProtocolError {
    /// Returns the message this error belongs to, if it is tied to one.
    ///
    /// Errors without a message id corrupt the whole stream.
    pub fn message_id(&self) -> Option<u64> {
        match self {
            ProtocolError::ZeroChunkCount { message_id }
            | ProtocolError::ChunkIndexOutOfRange { message_id, .. }
            | ProtocolError::DuplicateChunk { message_id, .. }
            | ProtocolError::LengthMismatch { message_id, .. }
            | ProtocolError::MessageTooLarge { message_id, .. } => Some(*message_id),
            ProtocolError::MessageIdCollision(id) => Some(*id),
            _ => None,
        }
    }
}

/// Errors raised by the content codecs.
#[derive(Debug, Error)]
pub enum ContentError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("MessagePack encode error: {0}")]
    PackEncode(#[from] rmp_serde::encode::Error),

    #[error("MessagePack decode error: {0}")]
    PackDecode(#[from] rmp_serde::decode::Error),

    #[error("MessagePack read error: {0}")]
    PackRead(#[from] rmpv::decode::Error),

    #[error("MessagePack value error: {0}")]
    PackValue(#[from] rmpv::ext::Error),

    #[error("invalid pointer: {0:?}")]
    InvalidPointer(String),

    #[error("no value at pointer {0:?}")]
    PathNotFound(String),
}
