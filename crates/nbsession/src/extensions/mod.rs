//! Behaviors attached to a session through the event bus.
//!
//! Every extension follows the same contract: `on_attach` subscribes to the
//! bus (and may spawn tasks), `on_detach` undoes it. Detach may be called
//! more than once and must be harmless the second time.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::events::{ListenerId, SessionEventBus, SessionEventListener};
use crate::file_change::FileChangeCoordinator;
use crate::lock;
use crate::session::SessionHandle;
use crate::watcher::FileWatcher;

pub mod caching;
pub mod file_watcher;
pub mod heartbeat;
pub mod logging;
pub mod notification_listener;
pub mod queue;
pub mod replay;
pub mod session_view;

pub use caching::CachingExtension;
pub use file_watcher::FileWatcherExtension;
pub use heartbeat::HeartbeatExtension;
pub use logging::LoggingExtension;
pub use notification_listener::NotificationListenerExtension;
pub use queue::QueueExtension;
pub use replay::ReplayExtension;
pub use session_view::SessionViewExtension;

pub trait SessionExtension: Send + Sync {
    fn name(&self) -> &'static str;

    fn on_attach(self: Arc<Self>, session: SessionHandle, bus: Arc<SessionEventBus>) -> anyhow::Result<()>;

    fn on_detach(&self) -> anyhow::Result<()>;
}

/// A bus subscription that can be dropped exactly once.
#[derive(Default)]
pub(crate) struct Subscription {
    inner: Mutex<Option<(Arc<SessionEventBus>, ListenerId)>>,
}

impl Subscription {
    pub(crate) fn subscribe(&self, bus: Arc<SessionEventBus>, listener: Arc<dyn SessionEventListener>) {
        let id = bus.subscribe(listener);
        if let Some((old_bus, old_id)) = lock(&self.inner).replace((bus, id)) {
            old_bus.unsubscribe(old_id);
        }
    }

    /// Returns false if nothing was subscribed.
    pub(crate) fn unsubscribe(&self) -> bool {
        match lock(&self.inner).take() {
            Some((bus, id)) => bus.unsubscribe(id),
            None => false,
        }
    }
}

/// Extensions every session gets, in attach order. The session view is
/// populated before anything else observes a notification, and the queue
/// forwarder runs after the view has recorded a command.
pub fn default_extensions() -> Vec<Arc<dyn SessionExtension>> {
    vec![
        Arc::new(SessionViewExtension::new()),
        Arc::new(QueueExtension::new()),
        Arc::new(NotificationListenerExtension::new()),
        Arc::new(HeartbeatExtension::new()),
        Arc::new(ReplayExtension::new()),
        Arc::new(LoggingExtension::new()),
    ]
}

/// Optional extensions, enabled by the session manager depending on mode and
/// config.
pub fn caching_extension(cache_dir: PathBuf) -> Arc<dyn SessionExtension> {
    Arc::new(CachingExtension::new(cache_dir))
}

pub fn file_watcher_extension(
    watcher: Arc<dyn FileWatcher>,
    coordinator: Arc<FileChangeCoordinator>,
) -> Arc<dyn SessionExtension> {
    Arc::new(FileWatcherExtension::new(watcher, coordinator))
}
