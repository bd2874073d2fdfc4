//! Protocol module - chunk wire format and reassembly.
//!
//! This module implements the chunked framing protocol of the data plane:
//! - 12-byte chunk header encoding/decoding
//! - Chunk frame building
//! - Per-bridge QoS engine (message ids, out-of-order reassembly)

mod qos;
mod wire_format;

pub use qos::{QosStats, QualityOfService, MAX_PENDING_MESSAGES, MIN_FRAME_SIZE};
pub use wire_format::{build_chunk, ChunkHeader, HEADER_SIZE, MAX_MESSAGE_SIZE};
