//! Device trait - the polymorphic transport endpoint driven by a bridge.
//!
//! A device is a capability set over some transport (a network channel, a
//! peripheral, a local connector). The bridge is the sole driver of the
//! send side; inbound frames are pushed back through the bridge reference
//! delivered by [`Device::on_attach`].
//!
//! Concrete transports live in host crates; this crate ships only the
//! contract and the update-delay policy they share.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::bridge::DeviceBridge;
use crate::error::Result;

/// How often the receive worker polls [`Device::on_receive`].
///
/// `Random` draws a fresh delay from `[min, max]` on every tick, which
/// breaks up the timing signature of the poll loop. `Fixed` polls at a
/// constant period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateDelay {
    /// Constant delay between ticks.
    Fixed(Duration),
    /// Uniformly random delay within `[min, max]` per tick.
    Random {
        /// Lower bound, inclusive.
        min: Duration,
        /// Upper bound, inclusive.
        max: Duration,
    },
}

impl UpdateDelay {
    /// Draw the delay for the next tick.
    pub fn sample(&self) -> Duration {
        match *self {
            UpdateDelay::Fixed(delay) => delay,
            UpdateDelay::Random { min, max } => {
                if min >= max {
                    return min;
                }
                rand::thread_rng().gen_range(min..=max)
            }
        }
    }

    /// Largest delay this policy can produce.
    pub fn max(&self) -> Duration {
        match *self {
            UpdateDelay::Fixed(delay) => delay,
            UpdateDelay::Random { max, .. } => max,
        }
    }
}

impl Default for UpdateDelay {
    fn default() -> Self {
        UpdateDelay::Random {
            min: Duration::from_millis(300),
            max: Duration::from_millis(500),
        }
    }
}

/// Shared update-delay state for device implementations.
///
/// Devices embed one of these and forward their `update_delay` /
/// `set_update_delay` methods to it.
#[derive(Debug)]
pub struct UpdateDelayPolicy {
    delay: Mutex<UpdateDelay>,
}

impl UpdateDelayPolicy {
    /// Create a policy with the given initial delay.
    pub fn new(delay: UpdateDelay) -> Self {
        Self {
            delay: Mutex::new(delay),
        }
    }

    /// Replace the policy.
    pub fn set(&self, delay: UpdateDelay) {
        *self.delay.lock().unwrap_or_else(|e| e.into_inner()) = delay;
    }

    /// Current policy.
    pub fn get(&self) -> UpdateDelay {
        *self.delay.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Draw the delay for the next tick.
    pub fn sample(&self) -> Duration {
        self.get().sample()
    }
}

impl Default for UpdateDelayPolicy {
    fn default() -> Self {
        Self::new(UpdateDelay::default())
    }
}

/// A transport endpoint.
///
/// In production this wraps a real channel (HTTP relay, pipe, peripheral);
/// in tests it can be an in-memory double. Implementations must tolerate
/// concurrent calls only on the command plane; the bridge serializes every
/// send and command delivery under its write mutex.
#[async_trait]
pub trait Device: Send + Sync {
    /// One-shot back-reference delivery, called once after construction.
    ///
    /// The device upgrades the reference only when it needs to push an
    /// inbound frame or a connector command back through the bridge.
    async fn on_attach(&self, bridge: Weak<DeviceBridge>) {
        let _ = bridge;
    }

    /// Drive inbound I/O once. Called periodically by the receive worker.
    async fn on_receive(&self) -> Result<()>;

    /// Transmit up to `data.len()` bytes, returning how many bytes of
    /// `data` were actually moved (`<= data.len()`).
    ///
    /// Per-frame capacity is transport-defined and may vary per call; the
    /// bridge treats the return value as ground truth for its send cursor.
    async fn on_send_to_channel(&self, data: &[u8]) -> Result<usize>;

    /// Deliver a command from the local connector.
    async fn on_command_from_connector(&self, command: &[u8]) -> Result<()> {
        let _ = command;
        Ok(())
    }

    /// Execute a command synchronously and return its result buffer.
    async fn on_run_command(&self, command: &[u8]) -> Result<Bytes> {
        let _ = command;
        Ok(Bytes::new())
    }

    /// Identity probe.
    async fn on_who_am_i(&self) -> Result<Bytes> {
        Ok(Bytes::new())
    }

    /// Delay before the next receive tick.
    fn update_delay(&self) -> Duration;

    /// Replace the update-delay policy.
    fn set_update_delay(&self, delay: UpdateDelay);

    /// Whether this device is a mesh channel (as opposed to a peripheral
    /// or local connector).
    fn is_channel(&self) -> bool {
        true
    }
}

/// Convenience alias for a shared device handle.
pub type DeviceHandle = Arc<dyn Device>;
