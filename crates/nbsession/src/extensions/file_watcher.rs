//! Hooks a session's notebook file into the file watcher.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use log::{debug, warn};

use crate::events::{SessionEventBus, SessionEventListener};
use crate::file_change::FileChangeCoordinator;
use crate::lock;
use crate::session::{Session, SessionHandle};
use crate::watcher::{CallbackId, FileWatcher, WatchCallback};

use super::{SessionExtension, Subscription};

pub struct FileWatcherExtension {
    watcher: Arc<dyn FileWatcher>,
    coordinator: Arc<FileChangeCoordinator>,
    session: Mutex<Option<SessionHandle>>,
    registration: Mutex<Option<(PathBuf, CallbackId)>>,
    subscription: Subscription,
}

impl FileWatcherExtension {
    pub fn new(watcher: Arc<dyn FileWatcher>, coordinator: Arc<FileChangeCoordinator>) -> Self {
        Self {
            watcher,
            coordinator,
            session: Mutex::new(None),
            registration: Mutex::new(None),
            subscription: Subscription::default(),
        }
    }

    pub fn watched_path(&self) -> Option<PathBuf> {
        lock(&self.registration).as_ref().map(|(path, _)| path.clone())
    }

    fn callback(&self, handle: SessionHandle) -> WatchCallback {
        let coordinator = self.coordinator.clone();
        Arc::new(move |path: PathBuf| {
            let coordinator = coordinator.clone();
            let handle = handle.clone();
            Box::pin(async move {
                if let Some(session) = handle.get() {
                    let outcome = coordinator.handle_change(&session, &path).await;
                    debug!("[file-watch] {:?}: {:?}", path, outcome);
                }
            })
        })
    }

    fn register(&self, path: &Path) -> anyhow::Result<()> {
        let handle = lock(&self.session)
            .clone()
            .ok_or_else(|| anyhow!("not attached"))?;
        let id = self.watcher.add_callback(path, self.callback(handle))?;
        if let Some((old_path, old_id)) = lock(&self.registration).replace((path.to_path_buf(), id)) {
            self.watcher.remove_callback(&old_path, old_id);
        }
        Ok(())
    }

    fn unregister(&self) {
        if let Some((path, id)) = lock(&self.registration).take() {
            self.watcher.remove_callback(&path, id);
        }
    }
}

impl SessionExtension for FileWatcherExtension {
    fn name(&self) -> &'static str {
        "file-watcher"
    }

    fn on_attach(self: Arc<Self>, handle: SessionHandle, bus: Arc<SessionEventBus>) -> anyhow::Result<()> {
        let session = handle.get().ok_or_else(|| anyhow!("session dropped before attach"))?;
        *lock(&self.session) = Some(handle);
        if let Some(path) = session.notebook_path() {
            self.register(&path)?;
        }
        self.subscription.subscribe(bus, self.clone());
        Ok(())
    }

    fn on_detach(&self) -> anyhow::Result<()> {
        self.subscription.unsubscribe();
        self.unregister();
        Ok(())
    }
}

impl SessionEventListener for FileWatcherExtension {
    fn on_notebook_renamed(&self, session: &Session, _old_path: Option<&Path>) -> anyhow::Result<()> {
        match session.notebook_path() {
            Some(path) => self.register(&path),
            None => {
                warn!("[file-watch] Renamed notebook has no path, unwatching");
                self.unregister();
                Ok(())
            }
        }
    }
}
