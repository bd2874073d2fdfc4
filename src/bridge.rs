//! Device bridge - the adapter between a transport device and the relay.
//!
//! A bridge owns one [`Device`], drives its periodic receive polling from a
//! dedicated worker task, serializes every write into it, and implements
//! the chunked framing protocol that lets arbitrarily large logical packets
//! traverse transports with small, irregular per-frame capacity.
//!
//! # Lifecycle
//!
//! 1. The relay constructs the bridge when a device is attached.
//! 2. [`DeviceBridge::on_attach`] hands the device a weak back-reference.
//! 3. [`DeviceBridge::start_updating`] launches the receive worker.
//! 4. [`DeviceBridge::detach`] flips the liveness flag; the worker exits on
//!    its next tick and drops its strong handle.
//! 5. [`DeviceBridge::close`] asks the relay to remove the bridge by id.
//!
//! # Framing
//!
//! On a regular channel every outbound chunk is offered to the transport as
//! `header || remaining-payload`; the transport reports how many bytes it
//! actually moved and the send cursor advances by exactly that amount minus
//! the header. A negotiation channel must move each packet in a single
//! frame and never sees a chunk header on the send side.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use bytes::{Buf, Bytes};
use futures::FutureExt;
use tokio::sync::Mutex;

use crate::codec::ByteReader;
use crate::device::{Device, UpdateDelay};
use crate::error::{MeshwireError, Result};
use crate::protocol::{
    build_chunk, ChunkHeader, QosStats, QualityOfService, HEADER_SIZE, MAX_MESSAGE_SIZE,
    MIN_FRAME_SIZE,
};
use crate::relay::{DeviceId, LogMessage, Relay, TypeHash};

/// Per-device adapter binding a transport to the relay core.
pub struct DeviceBridge {
    this: Weak<DeviceBridge>,
    did: DeviceId,
    type_hash: TypeHash,
    relay: Weak<dyn Relay>,
    device: Arc<dyn Device>,
    is_negotiation_channel: bool,
    is_slave: bool,
    input_id: Bytes,
    output_id: Bytes,
    non_negotiated_arguments: Bytes,
    qos: QualityOfService,
    is_alive: AtomicBool,
    write_lock: Mutex<()>,
    error: StdMutex<Option<String>>,
}

impl std::fmt::Debug for DeviceBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBridge")
            .field("did", &self.did)
            .field("type_hash", &self.type_hash)
            .field("is_negotiation_channel", &self.is_negotiation_channel)
            .field("is_slave", &self.is_slave)
            .finish_non_exhaustive()
    }
}

impl DeviceBridge {
    /// Construct a bridge over `device`.
    ///
    /// On a negotiation channel `args` must open with two length-prefixed
    /// byte fields `(input_id, output_id)`; the remainder is retained
    /// verbatim for the device-specific handshake. A malformed argument
    /// buffer fails construction with [`MeshwireError::Decode`].
    pub fn new(
        relay: Weak<dyn Relay>,
        did: DeviceId,
        type_hash: TypeHash,
        device: Arc<dyn Device>,
        is_negotiation_channel: bool,
        is_slave: bool,
        args: Bytes,
    ) -> Result<Arc<Self>> {
        let (input_id, output_id, non_negotiated_arguments) = if is_negotiation_channel {
            let mut reader = ByteReader::new(&args);
            let input_id = Bytes::copy_from_slice(reader.read_bytes()?);
            let output_id = Bytes::copy_from_slice(reader.read_bytes()?);
            let remainder = Bytes::copy_from_slice(reader.remaining());
            (input_id, output_id, remainder)
        } else {
            (Bytes::new(), Bytes::new(), Bytes::new())
        };

        Ok(Arc::new_cyclic(|this| Self {
            this: this.clone(),
            did,
            type_hash,
            relay,
            device,
            is_negotiation_channel,
            is_slave,
            input_id,
            output_id,
            non_negotiated_arguments,
            qos: QualityOfService::new(),
            is_alive: AtomicBool::new(true),
            write_lock: Mutex::new(()),
            error: StdMutex::new(None),
        }))
    }

    /// Hand the device its back-reference. Called once post-construction.
    pub async fn on_attach(&self) {
        self.device.on_attach(self.this.clone()).await;
    }

    /// Stop the receive worker on its next tick. Idempotent.
    pub fn detach(&self) {
        self.is_alive.store(false, Ordering::Release);
    }

    /// Ask the relay to remove this bridge from its registry.
    pub async fn close(&self) -> Result<()> {
        self.relay()?.detach_device(self.did).await;
        Ok(())
    }

    /// Whether the worker is (or may still be) running.
    pub fn is_alive(&self) -> bool {
        self.is_alive.load(Ordering::Acquire)
    }

    /// Drive the device's inbound I/O once.
    pub async fn on_receive(&self) -> Result<()> {
        self.device.on_receive().await
    }

    /// Launch the receive worker.
    ///
    /// The worker holds a strong handle to the bridge, so dropping external
    /// references does not tear the bridge down until the worker observes
    /// the liveness flag cleared and exits. Errors from the device are
    /// logged and the loop continues; a panic in device code ends the
    /// worker with a single Error log line.
    pub fn start_updating(&self) {
        let bridge = self.self_handle();
        tokio::spawn(async move {
            let worker = Arc::clone(&bridge);
            let outcome = AssertUnwindSafe(async move {
                while worker.is_alive.load(Ordering::Acquire) {
                    tokio::time::sleep(worker.device.update_delay()).await;
                    if let Err(e) = worker.on_receive().await {
                        worker.log(LogMessage::error(format!("error while updating: {e}")));
                    }
                }
            })
            .catch_unwind()
            .await;

            if outcome.is_err() {
                bridge.log(LogMessage::error("unknown fault while updating, ending worker"));
                tracing::error!(did = %bridge.did, "device worker ended by panic");
            }
        });
    }

    /// Send a logical packet through the device.
    ///
    /// Chunks the packet on regular channels; on a negotiation channel the
    /// whole packet must go out in one transport frame or the send fails
    /// with [`MeshwireError::NegotiationChunking`].
    pub async fn send_packet(&self, packet: Bytes) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        if self.is_negotiation_channel {
            let sent = self.device.on_send_to_channel(&packet).await?;
            if sent != packet.len() {
                return Err(MeshwireError::NegotiationChunking {
                    expected: packet.len(),
                    actual: sent,
                });
            }
            return Ok(());
        }

        if packet.len() > MAX_MESSAGE_SIZE as usize {
            return Err(MeshwireError::Protocol(format!(
                "packet of {} bytes exceeds maximum message size {}",
                packet.len(),
                MAX_MESSAGE_SIZE
            )));
        }

        let original_size = packet.len() as u32;
        let message_id = self.qos.next_outgoing_id();
        let mut chunk_id = 0u32;
        let mut remaining = packet;

        while !remaining.is_empty() {
            let header = ChunkHeader::new(message_id, chunk_id, original_size);
            let frame = build_chunk(&header, &remaining);
            let sent = self.device.on_send_to_channel(&frame).await?;

            if sent > frame.len() {
                return Err(MeshwireError::Transport(format!(
                    "device reported {} bytes sent for a {}-byte frame",
                    sent,
                    frame.len()
                )));
            }

            if sent >= MIN_FRAME_SIZE || sent == frame.len() {
                chunk_id += 1;
                remaining.advance(sent - HEADER_SIZE);
            }
            // Otherwise the transport is signaling "too small, resend":
            // the identical frame is offered again on the next iteration.
        }

        Ok(())
    }

    /// Accept an inbound transport frame from the device.
    ///
    /// Regular channels buffer the chunk and forward each fully
    /// reassembled logical packet to the relay. The master side of a
    /// negotiation channel forwards the raw frame untouched; the slave
    /// side accepts only complete single-chunk messages.
    pub async fn pass_network_packet(&self, frame: Bytes) -> Result<()> {
        if self.is_negotiation_channel && !self.is_slave {
            self.relay()?
                .on_packet_received(frame, self.self_handle())
                .await;
            return Ok(());
        }

        if self.is_negotiation_channel {
            return self.pass_negotiation_frame(frame).await;
        }

        self.qos.push_received_chunk(&frame)?;
        if let Some(packet) = self.qos.get_next_packet() {
            self.relay()?
                .on_packet_received(packet, self.self_handle())
                .await;
        }
        Ok(())
    }

    /// Single-frame fast path for the accepting side of a negotiation
    /// channel. A frame that is not a complete single-chunk message is a
    /// peer contract breach: logged, recorded in the error status, dropped.
    async fn pass_negotiation_frame(&self, frame: Bytes) -> Result<()> {
        let violation = match ChunkHeader::decode(&frame) {
            None => format!("negotiation frame of {} bytes is shorter than a chunk header", frame.len()),
            Some(header)
                if header.chunk_id != 0
                    || frame.len() - HEADER_SIZE != header.original_size as usize =>
            {
                format!(
                    "negotiation channel received chunk {} of message {}, expected a complete single frame",
                    header.chunk_id, header.message_id
                )
            }
            Some(_) => {
                let payload = frame.slice(HEADER_SIZE..);
                self.relay()?
                    .on_packet_received(payload, self.self_handle())
                    .await;
                return Ok(());
            }
        };

        self.set_error_status(violation.as_str());
        self.log(LogMessage::error(violation.as_str()));
        Err(MeshwireError::Protocol(violation))
    }

    /// Forward a command from the device to the local connector.
    pub async fn post_command_to_connector(&self, command: Bytes) -> Result<()> {
        self.relay()?
            .post_command_to_connector(command, self.self_handle())
            .await;
        Ok(())
    }

    /// Deliver a connector command to the device, serialized with sends.
    pub async fn on_command_from_connector(&self, command: &[u8]) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.device.on_command_from_connector(command).await
    }

    /// Execute a command against the device and return its result buffer.
    pub async fn run_command(&self, command: &[u8]) -> Result<Bytes> {
        self.device.on_run_command(command).await
    }

    /// Identity probe, forwarded to the device.
    pub async fn who_are_you(&self) -> Result<Bytes> {
        self.device.on_who_am_i().await
    }

    /// Replace the device's update-delay policy.
    pub fn set_update_delay(&self, delay: UpdateDelay) {
        self.device.set_update_delay(delay);
    }

    /// Sink a log message into the relay, attributed to this device.
    pub fn log(&self, message: LogMessage) {
        if let Some(relay) = self.relay.upgrade() {
            relay.log(message, Some(self.did));
        }
    }

    /// Device identifier assigned by the relay.
    pub fn did(&self) -> DeviceId {
        self.did
    }

    /// Hash of the device's concrete type name.
    pub fn type_hash(&self) -> TypeHash {
        self.type_hash
    }

    /// Whether the device is a mesh channel.
    pub fn is_channel(&self) -> bool {
        self.device.is_channel()
    }

    /// Whether this is the dedicated handshake channel.
    pub fn is_negotiation_channel(&self) -> bool {
        self.is_negotiation_channel && self.is_channel()
    }

    /// Negotiation input id parsed at construction (empty otherwise).
    pub fn input_id(&self) -> &Bytes {
        &self.input_id
    }

    /// Negotiation output id parsed at construction (empty otherwise).
    pub fn output_id(&self) -> &Bytes {
        &self.output_id
    }

    /// Argument bytes left over after negotiation-id parsing.
    pub fn non_negotiated_arguments(&self) -> &Bytes {
        &self.non_negotiated_arguments
    }

    /// Reassembly counters of this bridge's QoS engine.
    pub fn qos_stats(&self) -> QosStats {
        self.qos.stats()
    }

    /// Record a last-error string for out-of-band inspection.
    pub fn set_error_status(&self, message: impl Into<String>) {
        *self.error.lock().unwrap_or_else(|e| e.into_inner()) = Some(message.into());
    }

    /// Last recorded error, if any.
    pub fn get_error_status(&self) -> Option<String> {
        self.error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn relay(&self) -> Result<Arc<dyn Relay>> {
        self.relay.upgrade().ok_or(MeshwireError::RelayGone)
    }

    fn self_handle(&self) -> Arc<Self> {
        // The cyclic self-reference cannot dangle while a method runs on a
        // live bridge.
        self.this.upgrade().expect("bridge self-reference is alive")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ByteWriter;
    use crate::device::UpdateDelayPolicy;
    use async_trait::async_trait;
    use std::time::Duration;

    struct NullDevice {
        delay: UpdateDelayPolicy,
    }

    impl NullDevice {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                delay: UpdateDelayPolicy::default(),
            })
        }
    }

    #[async_trait]
    impl Device for NullDevice {
        async fn on_receive(&self) -> Result<()> {
            Ok(())
        }

        async fn on_send_to_channel(&self, data: &[u8]) -> Result<usize> {
            Ok(data.len())
        }

        fn update_delay(&self) -> Duration {
            self.delay.sample()
        }

        fn set_update_delay(&self, delay: UpdateDelay) {
            self.delay.set(delay);
        }
    }

    fn orphan_bridge(is_negotiation_channel: bool, args: Bytes) -> Result<Arc<DeviceBridge>> {
        DeviceBridge::new(
            Weak::<NullRelay>::new(),
            DeviceId(1),
            TypeHash(0xABCD),
            NullDevice::new(),
            is_negotiation_channel,
            false,
            args,
        )
    }

    struct NullRelay;

    #[async_trait]
    impl Relay for NullRelay {
        async fn on_packet_received(&self, _packet: Bytes, _sender: Arc<DeviceBridge>) {}
        async fn post_command_to_connector(&self, _command: Bytes, _sender: Arc<DeviceBridge>) {}
        async fn detach_device(&self, _did: DeviceId) {}
        fn log(&self, _message: LogMessage, _did: Option<DeviceId>) {}
    }

    #[test]
    fn test_regular_bridge_ignores_args() {
        let bridge = orphan_bridge(false, Bytes::from_static(b"whatever")).unwrap();
        assert!(bridge.input_id().is_empty());
        assert!(bridge.output_id().is_empty());
        assert!(bridge.non_negotiated_arguments().is_empty());
    }

    #[test]
    fn test_negotiation_args_parsed() {
        let args = ByteWriter::new()
            .write_bytes(b"in-7")
            .write_bytes(b"out-9")
            .write_raw(b"handshake-rest")
            .freeze();

        let bridge = orphan_bridge(true, args).unwrap();
        assert_eq!(bridge.input_id(), &b"in-7"[..]);
        assert_eq!(bridge.output_id(), &b"out-9"[..]);
        assert_eq!(bridge.non_negotiated_arguments(), &b"handshake-rest"[..]);
    }

    #[test]
    fn test_malformed_negotiation_args_fail_construction() {
        let err = orphan_bridge(true, Bytes::from_static(&[0, 0, 0, 9, 1])).unwrap_err();
        assert!(matches!(err, MeshwireError::Decode(_)));
    }

    #[test]
    fn test_detach_is_idempotent() {
        let bridge = orphan_bridge(false, Bytes::new()).unwrap();
        assert!(bridge.is_alive());

        bridge.detach();
        bridge.detach();
        bridge.detach();
        assert!(!bridge.is_alive());
    }

    #[test]
    fn test_error_status_roundtrip() {
        let bridge = orphan_bridge(false, Bytes::new()).unwrap();
        assert!(bridge.get_error_status().is_none());

        bridge.set_error_status("channel misbehaved");
        assert_eq!(bridge.get_error_status().as_deref(), Some("channel misbehaved"));
    }

    #[tokio::test]
    async fn test_close_without_relay_reports_relay_gone() {
        let bridge = orphan_bridge(false, Bytes::new()).unwrap();
        let err = bridge.close().await.unwrap_err();
        assert!(matches!(err, MeshwireError::RelayGone));
    }
}
