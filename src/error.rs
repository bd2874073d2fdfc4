//! Error types for meshwire.

use thiserror::Error;

/// Main error type for all bridge operations.
#[derive(Debug, Error)]
pub enum MeshwireError {
    /// I/O error inside a transport device.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed buffer (argument block, chunk header, length-prefixed field).
    #[error("decode error: {0}")]
    Decode(String),

    /// Protocol contract breach (bad chunk on a negotiation channel, etc.).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A negotiation channel failed to move a packet in a single frame.
    #[error("negotiation channel does not support chunking: packet size {expected}, channel sent {actual}")]
    NegotiationChunking {
        /// Bytes the packet required.
        expected: usize,
        /// Bytes the transport actually accepted.
        actual: usize,
    },

    /// Transient transport failure raised by a device.
    #[error("transport error: {0}")]
    Transport(String),

    /// The owning relay has been dropped.
    #[error("relay is gone")]
    RelayGone,
}

/// Result type alias using MeshwireError.
pub type Result<T> = std::result::Result<T, MeshwireError>;
