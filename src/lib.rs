//! # meshwire
//!
//! Device bridge core for a relay node in a covert mesh.
//!
//! A relay node hosts multiple *devices* - transport endpoints exchanging
//! opaque byte payloads with peer devices elsewhere in the mesh. This crate
//! implements the adapter between a polymorphic transport ([`Device`]) and
//! the routing fabric ([`Relay`]): the per-device receive worker, write
//! serialization, and the chunked framing protocol that carries logical
//! packets over transports with small, irregular per-frame capacity.
//!
//! ## Architecture
//!
//! ```text
//! Relay ──► DeviceBridge::send_packet ──► chunking ──► Device transport
//! Device ──► DeviceBridge::pass_network_packet ──► QoS reassembly ──► Relay
//! ```
//!
//! Concrete transports and the relay's routing table live in host crates;
//! they plug in through the [`Device`] and [`Relay`] traits.
//!
//! ## Example
//!
//! ```ignore
//! use meshwire::{DeviceBridge, DeviceId, TypeHash};
//!
//! let bridge = DeviceBridge::new(
//!     Arc::downgrade(&relay),
//!     DeviceId(1),
//!     TypeHash(0x11aa22bb),
//!     device,
//!     false,
//!     false,
//!     Bytes::new(),
//! )?;
//! bridge.on_attach().await;
//! bridge.start_updating();
//! ```

pub mod bridge;
pub mod codec;
pub mod device;
pub mod error;
pub mod protocol;
pub mod relay;

pub use bridge::DeviceBridge;
pub use device::{Device, DeviceHandle, UpdateDelay, UpdateDelayPolicy};
pub use error::{MeshwireError, Result};
pub use relay::{DeviceId, LogMessage, Relay, Severity, TypeHash};
