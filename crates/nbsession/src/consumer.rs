//! Session consumers: the members of a room.
//!
//! A consumer is also a [`SessionExtension`], so attaching and detaching
//! follow the same lifecycle as every other extension.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use tokio::sync::mpsc;

use crate::events::SessionEventBus;
use crate::extensions::SessionExtension;
use crate::notifications::{Notification, SerializedNotification};
use crate::session::SessionHandle;
use crate::{lock, ConnectionState, ConsumerId};

/// Something a room can broadcast to.
///
/// `notify` is called synchronously on the broadcast path and must not
/// block.
pub trait SessionConsumer: SessionExtension {
    fn consumer_id(&self) -> ConsumerId;

    fn notify(&self, notification: &SerializedNotification);

    fn connection_state(&self) -> ConnectionState;

    /// Read-only viewer attached next to the main consumer.
    fn is_kiosk(&self) -> bool {
        false
    }
}

/// New random consumer id.
pub fn new_consumer_id() -> ConsumerId {
    uuid::Uuid::new_v4().to_string()
}

// ─── Channel consumer ────────────────────────────────────────────────────────

/// Consumer backed by an unbounded channel. The transport (a websocket
/// handler, typically) owns the receiving end and writes each payload to
/// its socket.
pub struct ChannelConsumer {
    consumer_id: ConsumerId,
    kiosk: bool,
    sender: mpsc::UnboundedSender<SerializedNotification>,
    state: Mutex<ConnectionState>,
}

impl ChannelConsumer {
    pub fn new(
        consumer_id: impl Into<ConsumerId>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SerializedNotification>) {
        Self::build(consumer_id.into(), false)
    }

    pub fn kiosk(
        consumer_id: impl Into<ConsumerId>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SerializedNotification>) {
        Self::build(consumer_id.into(), true)
    }

    fn build(
        consumer_id: ConsumerId,
        kiosk: bool,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SerializedNotification>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let consumer = Arc::new(Self {
            consumer_id,
            kiosk,
            sender,
            state: Mutex::new(ConnectionState::Open),
        });
        (consumer, receiver)
    }

    /// Used by the transport while a socket is (re)connecting.
    pub fn set_connection_state(&self, state: ConnectionState) {
        *lock(&self.state) = state;
    }
}

impl SessionExtension for ChannelConsumer {
    fn name(&self) -> &'static str {
        "channel-consumer"
    }

    fn on_attach(self: Arc<Self>, _session: SessionHandle, _bus: Arc<SessionEventBus>) -> anyhow::Result<()> {
        debug!("[consumer] {} attached (kiosk: {})", self.consumer_id, self.kiosk);
        Ok(())
    }

    fn on_detach(&self) -> anyhow::Result<()> {
        let mut state = lock(&self.state);
        if *state != ConnectionState::Closed {
            debug!("[consumer] {} detached", self.consumer_id);
            *state = ConnectionState::Closed;
        }
        Ok(())
    }
}

impl SessionConsumer for ChannelConsumer {
    fn consumer_id(&self) -> ConsumerId {
        self.consumer_id.clone()
    }

    fn notify(&self, notification: &SerializedNotification) {
        if self.sender.send(notification.clone()).is_err() {
            // Receiver gone: the socket closed without a detach.
            warn!(
                "[consumer] {} dropped {}: receiver closed",
                self.consumer_id, notification.op
            );
            *lock(&self.state) = ConnectionState::Closed;
        }
    }

    fn connection_state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    fn is_kiosk(&self) -> bool {
        self.kiosk
    }
}

// ─── Headless consumer ───────────────────────────────────────────────────────

/// Internal consumer with no client behind it, used by sessions started
/// without a browser (scripted runs, exports). Counts what it receives.
pub struct HeadlessConsumer {
    consumer_id: ConsumerId,
    received: AtomicUsize,
    state: Mutex<ConnectionState>,
}

impl HeadlessConsumer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            consumer_id: format!("headless-{}", new_consumer_id()),
            received: AtomicUsize::new(0),
            state: Mutex::new(ConnectionState::Open),
        })
    }

    pub fn received(&self) -> usize {
        self.received.load(Ordering::Relaxed)
    }
}

impl SessionExtension for HeadlessConsumer {
    fn name(&self) -> &'static str {
        "headless-consumer"
    }

    fn on_attach(self: Arc<Self>, _session: SessionHandle, _bus: Arc<SessionEventBus>) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_detach(&self) -> anyhow::Result<()> {
        *lock(&self.state) = ConnectionState::Closed;
        Ok(())
    }
}

impl SessionConsumer for HeadlessConsumer {
    fn consumer_id(&self) -> ConsumerId {
        self.consumer_id.clone()
    }

    fn notify(&self, _notification: &SerializedNotification) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    fn connection_state(&self) -> ConnectionState {
        *lock(&self.state)
    }
}

// ─── Replay capture ──────────────────────────────────────────────────────────

/// Records every notification it receives, decoded. Used to capture a
/// session's output stream (e.g. for exporting a run) and in tests.
pub struct ReplayCaptureConsumer {
    consumer_id: ConsumerId,
    captured: Mutex<Vec<Notification>>,
    state: Mutex<ConnectionState>,
}

impl ReplayCaptureConsumer {
    pub fn new(consumer_id: impl Into<ConsumerId>) -> Arc<Self> {
        Arc::new(Self {
            consumer_id: consumer_id.into(),
            captured: Mutex::new(Vec::new()),
            state: Mutex::new(ConnectionState::Open),
        })
    }

    pub fn captured(&self) -> Vec<Notification> {
        lock(&self.captured).clone()
    }

    pub fn ops(&self) -> Vec<&'static str> {
        lock(&self.captured).iter().map(Notification::op).collect()
    }

    /// Take everything captured so far.
    pub fn drain(&self) -> Vec<Notification> {
        std::mem::take(&mut *lock(&self.captured))
    }
}

impl SessionExtension for ReplayCaptureConsumer {
    fn name(&self) -> &'static str {
        "replay-capture"
    }

    fn on_attach(self: Arc<Self>, _session: SessionHandle, _bus: Arc<SessionEventBus>) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_detach(&self) -> anyhow::Result<()> {
        *lock(&self.state) = ConnectionState::Closed;
        Ok(())
    }
}

impl SessionConsumer for ReplayCaptureConsumer {
    fn consumer_id(&self) -> ConsumerId {
        self.consumer_id.clone()
    }

    fn notify(&self, notification: &SerializedNotification) {
        match notification.parse() {
            Ok(parsed) => lock(&self.captured).push(parsed),
            Err(e) => warn!("[consumer] Failed to decode {}: {}", notification.op, e),
        }
    }

    fn connection_state(&self) -> ConnectionState {
        *lock(&self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reload() -> SerializedNotification {
        SerializedNotification::new(&Notification::Reload).unwrap()
    }

    #[test]
    fn test_channel_consumer_delivers_shared_payload() {
        let (consumer, mut rx) = ChannelConsumer::new("c1");
        let message = reload();
        consumer.notify(&message);

        let received = rx.try_recv().unwrap();
        assert!(Arc::ptr_eq(&received.payload, &message.payload));
        assert_eq!(consumer.consumer_id(), "c1");
        assert!(!consumer.is_kiosk());
    }

    #[test]
    fn test_channel_consumer_closes_when_receiver_dropped() {
        let (consumer, rx) = ChannelConsumer::kiosk("k1");
        assert!(consumer.is_kiosk());
        drop(rx);
        consumer.notify(&reload());
        assert_eq!(consumer.connection_state(), ConnectionState::Closed);
    }

    #[test]
    fn test_detach_is_idempotent() {
        let (consumer, _rx) = ChannelConsumer::new("c1");
        consumer.on_detach().unwrap();
        consumer.on_detach().unwrap();
        assert_eq!(consumer.connection_state(), ConnectionState::Closed);
    }

    #[test]
    fn test_capture_and_headless() {
        let capture = ReplayCaptureConsumer::new("capture");
        capture.notify(&reload());
        capture.notify(&SerializedNotification::new(&Notification::Interrupted).unwrap());
        assert_eq!(capture.ops(), vec!["reload", "interrupted"]);
        assert_eq!(capture.drain().len(), 2);
        assert!(capture.captured().is_empty());

        let headless = HeadlessConsumer::new();
        headless.notify(&reload());
        assert_eq!(headless.received(), 1);
        assert!(headless.consumer_id().starts_with("headless-"));
    }
}
