//! Binary chunk format.
//!
//! A message is carried by one or more chunks. All integers are little endian.
//!
//! ```text
//! first chunk (24 bytes header):
//! +--------------+------------+------------+----------------+---------+
//! | chunk_length | descriptor | message_id | message_length | payload |
//! |   4 bytes    |  4 bytes   |  8 bytes   |    8 bytes     |         |
//! +--------------+------------+------------+----------------+---------+
//!
//! follow-up chunks (16 bytes header):
//! +--------------+------------+------------+---------+
//! | chunk_length | descriptor | message_id | payload |
//! +--------------+------------+------------+---------+
//! ```
//!
//! `chunk_length` counts the header. The descriptor of the first chunk is
//! `(total_chunks << 1) | 1`, follow-up chunks carry `index << 1`.

use crate::error::ProtocolError;
use crate::MAX_CHUNK_LENGTH;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Header size of a follow-up chunk (4+4+8 = 16).
pub const CHUNK_HEADER_SIZE: usize = 16;

/// Header size of the first chunk of a message (4+4+8+8 = 24).
pub const FIRST_CHUNK_HEADER_SIZE: usize = 24;

/// Largest chunk count a descriptor can carry.
pub const MAX_CHUNKS: u32 = u32::MAX >> 1;

/// Chunk descriptor bitfield.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkDescriptor(u32);

impl ChunkDescriptor {
    const FIRST: u32 = 1;

    /// Descriptor of the first chunk of a message split into `total_chunks`.
    pub fn first(total_chunks: u32) -> Self {
        Self((total_chunks << 1) | Self::FIRST)
    }

    /// Descriptor of the follow-up chunk at `index` (`index >= 1`).
    pub fn follow_up(index: u32) -> Self {
        Self(index << 1)
    }

    pub fn is_first(&self) -> bool {
        self.0 & Self::FIRST != 0
    }

    /// Position of the chunk within its message.
    pub fn index(&self) -> u32 {
        if self.is_first() {
            0
        } else {
            self.0 >> 1
        }
    }

    /// Total chunk count, only known from the first chunk.
    pub fn total_chunks(&self) -> Option<u32> {
        self.is_first().then_some(self.0 >> 1)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    /// A follow-up descriptor with index 0 would shadow the first chunk.
    pub fn from_bits(bits: u32) -> Result<Self, ProtocolError> {
        if bits == 0 {
            return Err(ProtocolError::InvalidDescriptor(bits));
        }
        Ok(Self(bits))
    }

    /// Header size implied by this descriptor.
    pub fn header_len(&self) -> usize {
        if self.is_first() {
            FIRST_CHUNK_HEADER_SIZE
        } else {
            CHUNK_HEADER_SIZE
        }
    }
}

/// One framed unit of a possibly split message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Correlates all chunks of one message.
    pub message_id: u64,
    /// Chunk index / total count.
    pub descriptor: ChunkDescriptor,
    /// Full message size, present on the first chunk only.
    pub message_length: Option<u64>,
    /// Slice of the message carried by this chunk.
    pub payload: Bytes,
}

impl Chunk {
    /// Creates the first chunk of a message.
    pub fn first(message_id: u64, total_chunks: u32, message_length: u64, payload: Bytes) -> Self {
        Self {
            message_id,
            descriptor: ChunkDescriptor::first(total_chunks),
            message_length: Some(message_length),
            payload,
        }
    }

    /// Creates a follow-up chunk.
    pub fn follow_up(message_id: u64, index: u32, payload: Bytes) -> Self {
        Self {
            message_id,
            descriptor: ChunkDescriptor::follow_up(index),
            message_length: None,
            payload,
        }
    }

    pub fn is_first(&self) -> bool {
        self.descriptor.is_first()
    }

    pub fn index(&self) -> u32 {
        self.descriptor.index()
    }

    pub fn total_chunks(&self) -> Option<u32> {
        self.descriptor.total_chunks()
    }

    /// Encoded size, header included.
    pub fn encoded_len(&self) -> usize {
        self.descriptor.header_len() + self.payload.len()
    }

    /// Appends the encoded chunk to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        let len = self.encoded_len();
        if len > MAX_CHUNK_LENGTH as usize {
            return Err(ProtocolError::ChunkTooLarge {
                size: u32::try_from(len).unwrap_or(u32::MAX),
                max: MAX_CHUNK_LENGTH,
            });
        }

        buf.reserve(len);
        buf.put_u32_le(len as u32);
        buf.put_u32_le(self.descriptor.bits());
        buf.put_u64_le(self.message_id);
        if self.is_first() {
            buf.put_u64_le(self.message_length.unwrap_or(self.payload.len() as u64));
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
    /// Returns `Ok(Some(chunk))` if a complete chunk was decoded,
    /// `Ok(None)` if more data is needed, or `Err` on malformed headers.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < CHUNK_HEADER_SIZE {
            return Ok(None);
        }

        // Peek at header without consuming
        let length = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let descriptor =
            ChunkDescriptor::from_bits(u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]))?;

        if length > MAX_CHUNK_LENGTH {
            return Err(ProtocolError::ChunkTooLarge {
                size: length,
                max: MAX_CHUNK_LENGTH,
            });
        }

        let header_len = descriptor.header_len();
        if (length as usize) < header_len {
            return Err(ProtocolError::ChunkTooShort {
                length,
                header: header_len,
            });
        }

        if buf.len() < length as usize {
            return Ok(None);
        }

        buf.advance(8);
        let message_id = buf.get_u64_le();
        let message_length = descriptor.is_first().then(|| buf.get_u64_le());
        let payload = buf.split_to(length as usize - header_len).freeze();

        Ok(Some(Self {
            message_id,
            descriptor,
            message_length,
            payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_chunk_roundtrip() {
        let chunk = Chunk::first(42, 3, 90_000, Bytes::from_static(b"hello"));
        let mut buf = chunk.encode().unwrap();
        assert_eq!(buf.len(), FIRST_CHUNK_HEADER_SIZE + 5);

        let decoded = Chunk::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, chunk);
        assert_eq!(decoded.total_chunks(), Some(3));
        assert_eq!(decoded.index(), 0);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_follow_up_chunk_roundtrip() {
        let chunk = Chunk::follow_up(42, 2, Bytes::from_static(b"world"));
        let mut buf = chunk.encode().unwrap();
        assert_eq!(buf.len(), CHUNK_HEADER_SIZE + 5);

        let decoded = Chunk::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.index(), 2);
        assert_eq!(decoded.total_chunks(), None);
        assert_eq!(decoded.message_length, None);
        assert_eq!(decoded.payload, Bytes::from_static(b"world"));
    }

    #[test]
    fn test_header_layout_is_little_endian() {
        let chunk = Chunk::first(0x0102, 1, 2, Bytes::from_static(b"ab"));
        let buf = chunk.encode().unwrap();
        assert_eq!(&buf[0..4], &26u32.to_le_bytes());
        assert_eq!(&buf[4..8], &3u32.to_le_bytes());
        assert_eq!(&buf[8..16], &0x0102u64.to_le_bytes());
        assert_eq!(&buf[16..24], &2u64.to_le_bytes());
        assert_eq!(&buf[24..], b"ab");
    }

    #[test]
    fn test_incomplete_chunk() {
        let chunk = Chunk::first(1, 1, 4, Bytes::from_static(b"data"));
        let encoded = chunk.encode().unwrap();

        let mut partial = BytesMut::from(&encoded[..10]);
        assert!(Chunk::decode(&mut partial).unwrap().is_none());

        let mut partial = BytesMut::from(&encoded[..encoded.len() - 1]);
        assert!(Chunk::decode(&mut partial).unwrap().is_none());
        assert_eq!(partial.len(), encoded.len() - 1);
    }

    #[test]
    fn test_chunk_shorter_than_header() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(20); // first chunk needs 24
        buf.put_u32_le(ChunkDescriptor::first(1).bits());
        buf.put_u64_le(1);
        buf.put_u64_le(0);

        let result = Chunk::decode(&mut buf);
        assert!(matches!(
            result,
            Err(ProtocolError::ChunkTooShort { length: 20, header: 24 })
        ));
    }

    #[test]
    fn test_chunk_too_large() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(MAX_CHUNK_LENGTH + 1);
        buf.put_u32_le(ChunkDescriptor::follow_up(1).bits());
        buf.put_u64_le(1);

        let result = Chunk::decode(&mut buf);
        assert!(matches!(result, Err(ProtocolError::ChunkTooLarge { .. })));
    }

    #[test]
    fn test_zero_descriptor_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(16);
        buf.put_u32_le(0);
        buf.put_u64_le(1);

        let result = Chunk::decode(&mut buf);
        assert!(matches!(result, Err(ProtocolError::InvalidDescriptor(0))));
    }

    #[test]
    fn test_descriptor_bits() {
        let first = ChunkDescriptor::first(5);
        assert!(first.is_first());
        assert_eq!(first.bits(), 11);
        assert_eq!(first.total_chunks(), Some(5));

        let follow = ChunkDescriptor::follow_up(4);
        assert!(!follow.is_first());
        assert_eq!(follow.bits(), 8);
        assert_eq!(follow.index(), 4);
    }

    #[test]
    fn test_multiple_chunks_in_buffer() {
        let mut buf = BytesMut::new();
        Chunk::first(1, 2, 6, Bytes::from_static(b"abc"))
            .encode_into(&mut buf)
            .unwrap();
        Chunk::follow_up(1, 1, Bytes::from_static(b"def"))
            .encode_into(&mut buf)
            .unwrap();

        let a = Chunk::decode(&mut buf).unwrap().unwrap();
        let b = Chunk::decode(&mut buf).unwrap().unwrap();
        assert_eq!(a.payload, Bytes::from_static(b"abc"));
        assert_eq!(b.payload, Bytes::from_static(b"def"));
        assert!(Chunk::decode(&mut buf).unwrap().is_none());
    }
}
