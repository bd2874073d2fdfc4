//! Quality of service - outbound message ids and inbound chunk reassembly.
//!
//! Transports in the mesh have small, irregular per-frame capacity, so a
//! logical packet may arrive as many chunks, out of order, interleaved with
//! chunks of other packets. [`QualityOfService`] owns the receive side of
//! that problem for one bridge:
//!
//! - **Id allocation**: every outbound logical packet draws a unique,
//!   monotonically increasing `message_id`.
//! - **Reassembly**: inbound chunks are buffered under
//!   `(message_id, chunk_id)`; a message surfaces exactly once, when all
//!   bytes `[0, original_size)` are present. Duplicate chunks are dropped,
//!   gaps hold the message pending.
//! - **Bounds**: at most [`MAX_PENDING_MESSAGES`] messages are held
//!   in-flight; on overflow the oldest incomplete message is evicted.
//!
//! Chunk sizes are transport-defined and vary per chunk, so completion is
//! detected by accumulated byte count against `original_size`, not by a
//! fragment count. Reassembly concatenates chunks in `chunk_id` order.
//!
//! # Usage
//!
//! ```
//! use meshwire::protocol::{build_chunk, ChunkHeader, QualityOfService};
//!
//! let qos = QualityOfService::new();
//!
//! let frame = build_chunk(&ChunkHeader::new(1, 0, 2), b"hi");
//! qos.push_received_chunk(&frame).unwrap();
//!
//! assert_eq!(qos.get_next_packet().unwrap(), &b"hi"[..]);
//! assert!(qos.get_next_packet().is_none());
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use bytes::{Bytes, BytesMut};

use super::wire_format::{ChunkHeader, HEADER_SIZE};
use crate::error::{MeshwireError, Result};

/// Smallest useful chunk frame in bytes (header included).
///
/// A transport that accepts fewer bytes than this (without draining the
/// whole frame) is signaling "too small, resend": the sender re-offers the
/// same chunk instead of advancing. Below this threshold the 12-byte header
/// overhead dominates and chunk counts explode.
pub const MIN_FRAME_SIZE: usize = 64;

/// Maximum concurrent in-flight inbound messages per bridge.
pub const MAX_PENDING_MESSAGES: usize = 64;

/// Reassembly counters, readable out-of-band.
#[derive(Debug, Default, Clone)]
pub struct QosStats {
    /// Chunks accepted into the buffer.
    pub chunks_received: u64,
    /// Logical packets fully reassembled.
    pub packets_reassembled: u64,
    /// Duplicate chunks dropped.
    pub duplicates_dropped: u64,
    /// Incomplete messages evicted on overflow.
    pub messages_evicted: u64,
    /// Messages currently pending.
    pub pending_messages: usize,
}

/// One logical message being reassembled.
#[derive(Debug)]
struct PendingMessage {
    original_size: u32,
    received_bytes: usize,
    chunks: HashMap<u32, Bytes>,
    created_at: Instant,
}

impl PendingMessage {
    fn new(original_size: u32) -> Self {
        Self {
            original_size,
            received_bytes: 0,
            chunks: HashMap::new(),
            created_at: Instant::now(),
        }
    }

    fn is_complete(&self) -> bool {
        self.received_bytes == self.original_size as usize
    }

    fn reassemble(&mut self) -> Bytes {
        let mut ids: Vec<u32> = self.chunks.keys().copied().collect();
        ids.sort_unstable();

        let mut packet = BytesMut::with_capacity(self.original_size as usize);
        for id in ids {
            packet.extend_from_slice(&self.chunks[&id]);
        }
        packet.freeze()
    }
}

#[derive(Debug, Default)]
struct ReassemblyState {
    pending: HashMap<u32, PendingMessage>,
    ready: VecDeque<Bytes>,
    chunks_received: u64,
    packets_reassembled: u64,
    duplicates_dropped: u64,
    messages_evicted: u64,
}

impl ReassemblyState {
    /// Drop the oldest incomplete message to make room.
    fn evict_oldest(&mut self) {
        if let Some(oldest) = self
            .pending
            .iter()
            .min_by_key(|(_, m)| m.created_at)
            .map(|(id, _)| *id)
        {
            self.pending.remove(&oldest);
            self.messages_evicted += 1;
            tracing::warn!(message_id = oldest, "reassembly buffer full, evicting oldest message");
        }
    }
}

/// Per-bridge QoS machinery: outbound id allocator plus reassembly buffer.
///
/// Safe under concurrent pushes; the transport may deliver frames from any
/// task or thread.
#[derive(Debug)]
pub struct QualityOfService {
    next_message_id: AtomicU32,
    state: Mutex<ReassemblyState>,
}

impl QualityOfService {
    /// Create an empty QoS instance.
    pub fn new() -> Self {
        Self {
            next_message_id: AtomicU32::new(0),
            state: Mutex::new(ReassemblyState::default()),
        }
    }

    /// Allocate the message id for the next outbound logical packet.
    ///
    /// Unique and monotonically increasing across concurrent senders.
    pub fn next_outgoing_id(&self) -> u32 {
        self.next_message_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Buffer one received chunk frame (header + payload slice).
    ///
    /// # Errors
    ///
    /// `Decode` if the frame is shorter than a header or claims an
    /// oversized message; `Protocol` if chunks of one message disagree on
    /// `original_size` or overflow it.
    pub fn push_received_chunk(&self, frame: &[u8]) -> Result<()> {
        let header = ChunkHeader::decode(frame).ok_or_else(|| {
            MeshwireError::Decode(format!(
                "chunk frame too short: {} bytes, header needs {}",
                frame.len(),
                HEADER_SIZE
            ))
        })?;
        header.validate()?;

        let payload = Bytes::copy_from_slice(&frame[HEADER_SIZE..]);

        // A zero-size message carries no bytes to reassemble; the sender
        // never emits one, so an arriving frame claiming it is dropped.
        if header.original_size == 0 {
            return Ok(());
        }

        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let state = &mut *guard;
        state.chunks_received += 1;

        let known_size = state
            .pending
            .get(&header.message_id)
            .map(|m| m.original_size);
        match known_size {
            Some(expected) if expected != header.original_size => {
                state.pending.remove(&header.message_id);
                return Err(MeshwireError::Protocol(format!(
                    "message {} original size changed mid-flight: {} then {}",
                    header.message_id, expected, header.original_size
                )));
            }
            Some(_) => {}
            None if state.pending.len() >= MAX_PENDING_MESSAGES => state.evict_oldest(),
            None => {}
        }

        let message = state
            .pending
            .entry(header.message_id)
            .or_insert_with(|| PendingMessage::new(header.original_size));

        if message.chunks.contains_key(&header.chunk_id) {
            state.duplicates_dropped += 1;
            return Ok(());
        }

        message.received_bytes += payload.len();
        message.chunks.insert(header.chunk_id, payload);

        if message.received_bytes > message.original_size as usize {
            state.pending.remove(&header.message_id);
            return Err(MeshwireError::Protocol(format!(
                "message {} overflows its original size {}",
                header.message_id, header.original_size
            )));
        }

        if message.is_complete() {
            let packet = message.reassemble();
            state.pending.remove(&header.message_id);
            state.ready.push_back(packet);
            state.packets_reassembled += 1;
        }

        Ok(())
    }

    /// Pop the next fully reassembled logical packet, if one is ready.
    pub fn get_next_packet(&self) -> Option<Bytes> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .ready
            .pop_front()
    }

    /// Snapshot the reassembly counters.
    pub fn stats(&self) -> QosStats {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        QosStats {
            chunks_received: state.chunks_received,
            packets_reassembled: state.packets_reassembled,
            duplicates_dropped: state.duplicates_dropped,
            messages_evicted: state.messages_evicted,
            pending_messages: state.pending.len(),
        }
    }
}

impl Default for QualityOfService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::build_chunk;

    fn frame(message_id: u32, chunk_id: u32, original_size: u32, payload: &[u8]) -> BytesMut {
        build_chunk(&ChunkHeader::new(message_id, chunk_id, original_size), payload)
    }

    #[test]
    fn test_outgoing_ids_are_unique_and_increasing() {
        let qos = QualityOfService::new();
        let ids: Vec<u32> = (0..100).map(|_| qos.next_outgoing_id()).collect();

        for pair in ids.windows(2) {
            assert!(pair[1] > pair[0]);
        }
    }

    #[test]
    fn test_single_chunk_message() {
        let qos = QualityOfService::new();

        qos.push_received_chunk(&frame(1, 0, 5, b"hello")).unwrap();

        assert_eq!(qos.get_next_packet().unwrap(), &b"hello"[..]);
        assert!(qos.get_next_packet().is_none());
    }

    #[test]
    fn test_in_order_chunks() {
        let qos = QualityOfService::new();

        qos.push_received_chunk(&frame(3, 0, 10, b"01234")).unwrap();
        assert!(qos.get_next_packet().is_none());

        qos.push_received_chunk(&frame(3, 1, 10, b"56789")).unwrap();
        assert_eq!(qos.get_next_packet().unwrap(), &b"0123456789"[..]);
    }

    #[test]
    fn test_out_of_order_chunks() {
        let qos = QualityOfService::new();

        qos.push_received_chunk(&frame(9, 2, 9, b"ghi")).unwrap();
        qos.push_received_chunk(&frame(9, 0, 9, b"abc")).unwrap();
        assert!(qos.get_next_packet().is_none());

        qos.push_received_chunk(&frame(9, 1, 9, b"def")).unwrap();
        assert_eq!(qos.get_next_packet().unwrap(), &b"abcdefghi"[..]);
    }

    #[test]
    fn test_interleaved_messages() {
        let qos = QualityOfService::new();

        qos.push_received_chunk(&frame(1, 0, 6, b"one")).unwrap();
        qos.push_received_chunk(&frame(2, 0, 6, b"two")).unwrap();
        qos.push_received_chunk(&frame(2, 1, 6, b"TWO")).unwrap();
        qos.push_received_chunk(&frame(1, 1, 6, b"ONE")).unwrap();

        // Completion order, not message-id order.
        assert_eq!(qos.get_next_packet().unwrap(), &b"twoTWO"[..]);
        assert_eq!(qos.get_next_packet().unwrap(), &b"oneONE"[..]);
        assert!(qos.get_next_packet().is_none());
    }

    #[test]
    fn test_duplicate_chunk_is_idempotent() {
        let qos = QualityOfService::new();

        qos.push_received_chunk(&frame(5, 0, 6, b"abc")).unwrap();
        qos.push_received_chunk(&frame(5, 0, 6, b"abc")).unwrap();
        assert!(qos.get_next_packet().is_none());

        qos.push_received_chunk(&frame(5, 1, 6, b"def")).unwrap();
        assert_eq!(qos.get_next_packet().unwrap(), &b"abcdef"[..]);
        assert_eq!(qos.stats().duplicates_dropped, 1);
    }

    #[test]
    fn test_short_frame_is_decode_error() {
        let qos = QualityOfService::new();
        let err = qos.push_received_chunk(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err, MeshwireError::Decode(_)));
    }

    #[test]
    fn test_original_size_mismatch() {
        let qos = QualityOfService::new();

        qos.push_received_chunk(&frame(7, 0, 10, b"abc")).unwrap();
        let err = qos.push_received_chunk(&frame(7, 1, 12, b"def")).unwrap_err();
        assert!(matches!(err, MeshwireError::Protocol(_)));
    }

    #[test]
    fn test_overflowing_message_is_rejected() {
        let qos = QualityOfService::new();

        qos.push_received_chunk(&frame(8, 0, 4, b"abc")).unwrap();
        let err = qos.push_received_chunk(&frame(8, 1, 4, b"def")).unwrap_err();
        assert!(matches!(err, MeshwireError::Protocol(_)));

        // The poisoned message is discarded entirely.
        assert_eq!(qos.stats().pending_messages, 0);
    }

    #[test]
    fn test_eviction_on_overflow() {
        let qos = QualityOfService::new();

        // Fill the buffer with incomplete messages.
        for id in 0..MAX_PENDING_MESSAGES as u32 {
            qos.push_received_chunk(&frame(id, 0, 100, b"partial")).unwrap();
        }
        assert_eq!(qos.stats().pending_messages, MAX_PENDING_MESSAGES);

        // One more evicts the oldest.
        qos.push_received_chunk(&frame(9999, 0, 100, b"partial")).unwrap();
        assert_eq!(qos.stats().pending_messages, MAX_PENDING_MESSAGES);
        assert_eq!(qos.stats().messages_evicted, 1);
    }

    #[test]
    fn test_completion_surfaces_packet_once() {
        let qos = QualityOfService::new();

        qos.push_received_chunk(&frame(4, 0, 3, b"xyz")).unwrap();
        assert!(qos.get_next_packet().is_some());
        assert!(qos.get_next_packet().is_none());
        assert_eq!(qos.stats().packets_reassembled, 1);
    }

    #[test]
    fn test_zero_size_message_dropped() {
        let qos = QualityOfService::new();
        qos.push_received_chunk(&frame(6, 0, 0, b"")).unwrap();
        assert!(qos.get_next_packet().is_none());
        assert_eq!(qos.stats().pending_messages, 0);
    }
}
