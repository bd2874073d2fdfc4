//! Relay trait - the mesh-routing fabric that owns bridges.
//!
//! The relay registers devices, routes reassembled packets, and consumes
//! connector commands. Bridges hold only a weak back-reference to it.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::bridge::DeviceBridge;

/// Locally unique device identifier, assigned by the relay at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub u16);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}", self.0)
    }
}

/// Stable hash of a device's concrete type name.
///
/// The relay uses it to select compatible peers for a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeHash(pub u32);

impl fmt::Display for TypeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Log severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    /// Diagnostic detail.
    Debug,
    /// Normal operation.
    Info,
    /// Degraded but functional.
    Warning,
    /// Operation failed.
    Error,
}

/// A log line destined for the relay's sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMessage {
    /// Severity of the event.
    pub severity: Severity,
    /// Human-readable message.
    pub text: String,
}

impl LogMessage {
    /// Create a log message.
    pub fn new(severity: Severity, text: impl Into<String>) -> Self {
        Self {
            severity,
            text: text.into(),
        }
    }

    /// Shorthand for an Error-severity message.
    pub fn error(text: impl Into<String>) -> Self {
        Self::new(Severity::Error, text)
    }
}

/// The mesh router a bridge reports into.
#[async_trait]
pub trait Relay: Send + Sync {
    /// A fully reassembled logical packet arrived on `sender`.
    async fn on_packet_received(&self, packet: Bytes, sender: Arc<DeviceBridge>);

    /// Forward a command from a device to the local connector.
    async fn post_command_to_connector(&self, command: Bytes, sender: Arc<DeviceBridge>);

    /// Remove the bridge registered under `did` and detach it.
    async fn detach_device(&self, did: DeviceId);

    /// Sink a log message attributed to `did`.
    fn log(&self, message: LogMessage, did: Option<DeviceId>);
}
