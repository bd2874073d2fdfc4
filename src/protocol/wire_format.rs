//! Wire format encoding and decoding.
//!
//! Implements the 12-byte chunk header:
//! ```text
//! ┌────────────┬───────────┬───────────────┐
//! │ Message ID │ Chunk ID  │ Original Size │
//! │ 4 bytes    │ 4 bytes   │ 4 bytes       │
//! │ uint32 BE  │ uint32 BE │ uint32 BE     │
//! └────────────┴───────────┴───────────────┘
//! ```
//!
//! All multi-byte integers are Big Endian, mesh-wide.
//!
//! `original_size` is the byte length of the complete logical packet and is
//! identical in every chunk of the same message; the receiver uses it to
//! detect completion, so no terminator chunk exists on the wire.

use bytes::{BufMut, BytesMut};

use crate::error::{MeshwireError, Result};

/// Chunk header size in bytes (fixed, exactly 12).
pub const HEADER_SIZE: usize = 12;

/// Maximum logical packet size accepted for reassembly (64 MiB).
///
/// An `original_size` above this is treated as a malformed header rather
/// than an allocation request.
pub const MAX_MESSAGE_SIZE: u32 = 64 * 1024 * 1024;

/// Decoded chunk header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Logical message this chunk belongs to.
    pub message_id: u32,
    /// Position of this chunk within the message, starting at 0.
    pub chunk_id: u32,
    /// Byte length of the complete logical packet.
    pub original_size: u32,
}

impl ChunkHeader {
    /// Create a new chunk header.
    pub fn new(message_id: u32, chunk_id: u32, original_size: u32) -> Self {
        Self {
            message_id,
            chunk_id,
            original_size,
        }
    }

    /// Encode the header to bytes (Big Endian).
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.message_id.to_be_bytes());
        buf[4..8].copy_from_slice(&self.chunk_id.to_be_bytes());
        buf[8..12].copy_from_slice(&self.original_size.to_be_bytes());
        buf
    }

    /// Decode a header from the front of `buf`.
    ///
    /// Returns `None` if the buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            message_id: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            chunk_id: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            original_size: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
        })
    }

    /// Validate the header against reassembly limits.
    pub fn validate(&self) -> Result<()> {
        if self.original_size > MAX_MESSAGE_SIZE {
            return Err(MeshwireError::Decode(format!(
                "original size {} exceeds maximum {}",
                self.original_size, MAX_MESSAGE_SIZE
            )));
        }
        Ok(())
    }
}

/// Build a complete chunk frame: header followed by payload.
pub fn build_chunk(header: &ChunkHeader, payload: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.put_slice(&header.encode());
    buf.put_slice(payload);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encode_decode_roundtrip() {
        let original = ChunkHeader::new(7, 3, 4096);
        let encoded = original.encode();
        let decoded = ChunkHeader::decode(&encoded).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_header_big_endian_byte_order() {
        let header = ChunkHeader::new(0x01020304, 0x05060708, 0x090A0B0C);
        let bytes = header.encode();

        assert_eq!(&bytes[0..4], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&bytes[4..8], &[0x05, 0x06, 0x07, 0x08]);
        assert_eq!(&bytes[8..12], &[0x09, 0x0A, 0x0B, 0x0C]);
    }

    #[test]
    fn test_header_size_is_exactly_12() {
        assert_eq!(HEADER_SIZE, 12);
        let header = ChunkHeader::new(1, 0, 10);
        assert_eq!(header.encode().len(), 12);
    }

    #[test]
    fn test_decode_too_short_buffer() {
        let buf = [0u8; HEADER_SIZE - 1];
        assert!(ChunkHeader::decode(&buf).is_none());
    }

    #[test]
    fn test_validate_oversized_message() {
        let header = ChunkHeader::new(1, 0, MAX_MESSAGE_SIZE + 1);
        assert!(header.validate().is_err());

        let header = ChunkHeader::new(1, 0, MAX_MESSAGE_SIZE);
        assert!(header.validate().is_ok());
    }

    #[test]
    fn test_build_chunk() {
        let header = ChunkHeader::new(42, 0, 5);
        let frame = build_chunk(&header, b"hello");

        assert_eq!(frame.len(), HEADER_SIZE + 5);
        let parsed = ChunkHeader::decode(&frame).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(&frame[HEADER_SIZE..], b"hello");
    }

    #[test]
    fn test_build_chunk_empty_payload() {
        let header = ChunkHeader::new(1, 0, 0);
        let frame = build_chunk(&header, b"");
        assert_eq!(frame.len(), HEADER_SIZE);
    }
}
