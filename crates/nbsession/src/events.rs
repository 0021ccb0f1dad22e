//! Session event bus.
//!
//! Extensions observe a session through [`SessionEventListener`] callbacks
//! instead of reaching into its internals. Listeners run synchronously on the
//! emitting task, one after another in subscription order; a failing
//! listener is logged and the remaining listeners still run.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::warn;

use crate::commands::Command;
use crate::lock;
use crate::notifications::Notification;
use crate::session::Session;

/// Handle returned by [`SessionEventBus::subscribe`].
pub type ListenerId = u64;

/// Callbacks for session lifecycle and per-message events. Every method
/// defaults to doing nothing.
///
/// `on_notification_sent` runs while the session holds its delivery lock,
/// so it must not call [`Session::notify`] or attach consumers.
#[allow(unused_variables)]
pub trait SessionEventListener: Send + Sync {
    fn on_session_created(&self, session: &Session) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_session_closed(&self, session: &Session) -> anyhow::Result<()> {
        Ok(())
    }

    /// The session was resumed by a new connection; `old_id` is the id it
    /// had while orphaned.
    fn on_session_resumed(&self, session: &Session, old_id: &str) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_notebook_renamed(&self, session: &Session, old_path: Option<&Path>) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_received_command(
        &self,
        session: &Session,
        command: &Command,
        from_consumer_id: Option<&str>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_notification_sent(&self, session: &Session, notification: &Notification) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_received_stdin(&self, session: &Session, text: &str) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_consumer_attached(&self, session: &Session, consumer_id: &str, main: bool) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_consumer_detached(&self, session: &Session, consumer_id: &str) -> anyhow::Result<()> {
        Ok(())
    }

    /// The whole session view was swapped out (cache restore).
    fn on_view_replaced(&self, session: &Session) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Pub-sub bus owned by one session.
#[derive(Default)]
pub struct SessionEventBus {
    listeners: Mutex<Vec<(ListenerId, Arc<dyn SessionEventListener>)>>,
    next_id: AtomicU64,
}

impl SessionEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: Arc<dyn SessionEventListener>) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.listeners).push((id, listener));
        id
    }

    /// Returns false if the listener was not subscribed. Unsubscribing twice
    /// is harmless.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = lock(&self.listeners);
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).len()
    }

    /// Run `f` against every listener. The listener list is snapshotted
    /// first, so callbacks may subscribe or unsubscribe freely.
    pub fn emit<F>(&self, event: &str, f: F)
    where
        F: Fn(&dyn SessionEventListener) -> anyhow::Result<()>,
    {
        let snapshot: Vec<Arc<dyn SessionEventListener>> = lock(&self.listeners)
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in snapshot {
            if let Err(e) = f(listener.as_ref()) {
                warn!("[session-events] Listener failed on {}: {:#}", event, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Quiet;

    impl SessionEventListener for Quiet {}

    fn reached(bus: &SessionEventBus) -> usize {
        let calls = AtomicUsize::new(0);
        bus.emit("test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        calls.load(Ordering::SeqCst)
    }

    #[test]
    fn test_subscribe_unsubscribe() {
        let bus = SessionEventBus::new();
        let a = bus.subscribe(Arc::new(Quiet));
        let b = bus.subscribe(Arc::new(Quiet));
        assert_ne!(a, b);
        assert_eq!(bus.listener_count(), 2);
        assert_eq!(reached(&bus), 2);

        assert!(bus.unsubscribe(a));
        assert!(!bus.unsubscribe(a));
        assert_eq!(reached(&bus), 1);
    }

    #[test]
    fn test_failing_listener_does_not_stop_others() {
        let bus = SessionEventBus::new();
        bus.subscribe(Arc::new(Quiet));
        bus.subscribe(Arc::new(Quiet));

        let calls = AtomicUsize::new(0);
        bus.emit("test", |_| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                anyhow::bail!("first listener fails");
            }
            Ok(())
        });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_listener_may_unsubscribe_during_emit() {
        let bus = Arc::new(SessionEventBus::new());
        let id = bus.subscribe(Arc::new(Quiet));
        bus.subscribe(Arc::new(Quiet));

        let inner = bus.clone();
        bus.emit("test", |_| {
            inner.unsubscribe(id);
            Ok(())
        });
        assert_eq!(bus.listener_count(), 1);
    }
}
