//! Message splitting, chunk stream decoding and message reassembly.

use crate::chunk::{Chunk, MAX_CHUNKS};
use crate::error::ProtocolError;
use crate::MAX_MESSAGE_SIZE;
use bytes::{Bytes, BytesMut};
use std::collections::{BTreeMap, HashMap};

/// Splits messages into chunks.
pub struct Encoder;

impl Encoder {
    /// Splits `payload` into chunks of at most `max_content` payload bytes.
    ///
    /// A payload that fits (including an empty one) becomes a single chunk.
    pub fn split_message(
        message_id: u64,
        payload: Bytes,
        max_content: usize,
    ) -> Result<Vec<Chunk>, ProtocolError> {
        let max_content = max_content.max(1);
        let message_length = payload.len() as u64;

        if payload.len() <= max_content {
            return Ok(vec![Chunk::first(message_id, 1, message_length, payload)]);
        }

        let total = payload.len().div_ceil(max_content);
        if total > MAX_CHUNKS as usize {
            return Err(ProtocolError::TooManyChunks(total));
        }

        let mut chunks = Vec::with_capacity(total);
        for index in 0..total {
            let start = index * max_content;
            let end = (start + max_content).min(payload.len());
            let piece = payload.slice(start..end);
            chunks.push(if index == 0 {
                Chunk::first(message_id, total as u32, message_length, piece)
            } else {
                Chunk::follow_up(message_id, index as u32, piece)
            });
        }
        Ok(chunks)
    }

    /// Splits and encodes a message into one contiguous buffer.
    pub fn encode_message(
        message_id: u64,
        payload: Bytes,
        max_content: usize,
    ) -> Result<BytesMut, ProtocolError> {
        let chunks = Self::split_message(message_id, payload, max_content)?;
        let size = chunks.iter().map(Chunk::encoded_len).sum();
        let mut buf = BytesMut::with_capacity(size);
        for chunk in &chunks {
            chunk.encode_into(&mut buf)?;
        }
        Ok(buf)
    }
}

/// Decodes a byte stream into chunks.
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

/// A fully reassembled message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledMessage {
    pub message_id: u64,
    pub payload: Bytes,
}

/// Reassembly buffer of one incomplete message.
#[derive(Debug, Default)]
struct PartialMessage {
    total_chunks: Option<u32>,
    message_length: Option<u64>,
    /// Payload slices by chunk index. Concatenating them in index order
    /// places every slice at `index * chunk_content_size`.
    slots: BTreeMap<u32, Bytes>,
    received: u64,
}

/// Reassembles interleaved chunk streams into messages, keyed by message id.
///
/// Chunks of one message may arrive in any order. Any protocol error frees
/// the buffer of the message it belongs to.
pub struct MessageAssembler {
    partial: HashMap<u64, PartialMessage>,
    max_message_size: u64,
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self::with_max_message_size(MAX_MESSAGE_SIZE)
    }

    pub fn with_max_message_size(max_message_size: u64) -> Self {
        Self {
            partial: HashMap::new(),
            max_message_size,
        }
    }

    /// Feeds one chunk; returns the message once its last chunk arrived.
    pub fn push(&mut self, chunk: Chunk) -> Result<Option<AssembledMessage>, ProtocolError> {
        let message_id = chunk.message_id;
        let result = self.accept(chunk);
        if result.is_err() {
            self.partial.remove(&message_id);
        }
        result
    }

    fn accept(&mut self, chunk: Chunk) -> Result<Option<AssembledMessage>, ProtocolError> {
        let message_id = chunk.message_id;
        let index = chunk.index();
        let max = self.max_message_size;
        let entry = self.partial.entry(message_id).or_default();

        if let Some(total) = chunk.total_chunks() {
            if entry.total_chunks.is_some() {
                return Err(ProtocolError::MessageIdCollision(message_id));
            }
            if total == 0 {
                return Err(ProtocolError::ZeroChunkCount { message_id });
            }
            let length = chunk.message_length.unwrap_or(0);
            if length > max {
                return Err(ProtocolError::MessageTooLarge {
                    message_id,
                    size: length,
                    max,
                });
            }
            // Follow-ups that arrived early must fit the declared count
            if let Some(&last) = entry.slots.keys().next_back() {
                if last >= total {
                    return Err(ProtocolError::ChunkIndexOutOfRange {
                        message_id,
                        index: last,
                        total,
                    });
                }
            }
            if entry.received > length {
                return Err(ProtocolError::LengthMismatch {
                    message_id,
                    declared: length,
                    received: entry.received,
                });
            }
            entry.total_chunks = Some(total);
            entry.message_length = Some(length);
        } else if let Some(total) = entry.total_chunks {
            if index >= total {
                return Err(ProtocolError::ChunkIndexOutOfRange {
                    message_id,
                    index,
                    total,
                });
            }
        }

        if entry.slots.contains_key(&index) {
            return Err(ProtocolError::DuplicateChunk { message_id, index });
        }

        entry.received += chunk.payload.len() as u64;
        let limit = entry.message_length.unwrap_or(max);
        if entry.received > limit {
            return Err(match entry.message_length {
                Some(declared) => ProtocolError::LengthMismatch {
                    message_id,
                    declared,
                    received: entry.received,
                },
                None => ProtocolError::MessageTooLarge {
                    message_id,
                    size: entry.received,
                    max,
                },
            });
        }
        entry.slots.insert(index, chunk.payload);

        let complete = entry.total_chunks == Some(entry.slots.len() as u32);
        if !complete {
            return Ok(None);
        }

        let Some(done) = self.partial.remove(&message_id) else {
            return Ok(None);
        };
        let declared = done.message_length.unwrap_or(0);
        if done.received != declared {
            return Err(ProtocolError::LengthMismatch {
                message_id,
                declared,
                received: done.received,
            });
        }

        let payload = if done.slots.len() == 1 {
            done.slots.into_values().next().unwrap_or_default()
        } else {
            let mut buf = BytesMut::with_capacity(declared as usize);
            for slice in done.slots.into_values() {
                buf.extend_from_slice(&slice);
            }
            buf.freeze()
        };

        Ok(Some(AssembledMessage {
            message_id,
            payload,
        }))
    }

    /// Drops the buffer of one message, returning whether it existed.
    pub fn discard(&mut self, message_id: u64) -> bool {
        self.partial.remove(&message_id).is_some()
    }

    /// Drops every buffer, returning the ids of the messages that were incomplete.
    pub fn clear(&mut self) -> Vec<u64> {
        self.partial.drain().map(|(id, _)| id).collect()
    }

    /// Number of messages currently being reassembled.
    pub fn pending_messages(&self) -> usize {
        self.partial.len()
    }
}

impl Default for MessageAssembler {
    fn default() -> Self {
        Self::new()
    }
}
