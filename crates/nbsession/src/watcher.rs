//! File watching for notebook files.
//!
//! [`FileWatcherManager`] keeps one debounced `notify` watcher per watched
//! file (on the parent directory, so editors that save by rename are still
//! seen) and dispatches matching events to async callbacks on a tokio task.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context};
use futures::future::BoxFuture;
use log::{debug, error, info, warn};
use notify_debouncer_mini::{DebounceEventResult, Debouncer};
use tokio::task::JoinHandle;

use crate::lock;

/// Async callback invoked with the path that changed.
pub type WatchCallback = Arc<dyn Fn(PathBuf) -> BoxFuture<'static, ()> + Send + Sync>;

/// Handle returned by [`FileWatcher::add_callback`].
pub type CallbackId = u64;

pub trait FileWatcher: Send + Sync {
    fn add_callback(&self, path: &Path, callback: WatchCallback) -> anyhow::Result<CallbackId>;

    /// Returns false if no such callback was registered.
    fn remove_callback(&self, path: &Path, id: CallbackId) -> bool;

    /// Drop every watch.
    fn stop(&self);
}

type CallbackList = Arc<Mutex<Vec<(CallbackId, WatchCallback)>>>;

struct WatchEntry {
    callbacks: CallbackList,
    _debouncer: Debouncer<notify::RecommendedWatcher>,
    task: JoinHandle<()>,
}

impl Drop for WatchEntry {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// `notify`-backed [`FileWatcher`]. Must be used inside a tokio runtime.
pub struct FileWatcherManager {
    debounce: Duration,
    watches: Mutex<HashMap<PathBuf, WatchEntry>>,
    next_id: AtomicU64,
}

impl Default for FileWatcherManager {
    fn default() -> Self {
        Self::new()
    }
}

impl FileWatcherManager {
    pub fn new() -> Self {
        Self::with_debounce(Duration::from_millis(500))
    }

    pub fn with_debounce(debounce: Duration) -> Self {
        Self {
            debounce,
            watches: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn watched_paths(&self) -> Vec<PathBuf> {
        lock(&self.watches).keys().cloned().collect()
    }

    fn start_watch(&self, target: PathBuf) -> anyhow::Result<WatchEntry> {
        let parent = target
            .parent()
            .ok_or_else(|| anyhow!("cannot watch {:?}: no parent directory", target))?
            .to_path_buf();

        // Bridge from the notify callback thread into tokio
        let (tx, mut rx) = tokio::sync::mpsc::channel::<DebounceEventResult>(16);
        let mut debouncer = notify_debouncer_mini::new_debouncer(self.debounce, move |res: DebounceEventResult| {
            let _ = tx.blocking_send(res);
        })
        .context("failed to create file watcher")?;
        debouncer
            .watcher()
            .watch(&parent, notify::RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch {:?}", parent))?;

        let callbacks: CallbackList = Arc::new(Mutex::new(Vec::new()));
        let task_callbacks = callbacks.clone();
        let task_target = target.clone();
        let task = tokio::spawn(async move {
            while let Some(result) = rx.recv().await {
                match result {
                    Ok(events) => {
                        if !events.iter().any(|e| same_file(&e.path, &task_target)) {
                            continue;
                        }
                        let current: Vec<WatchCallback> =
                            lock(&task_callbacks).iter().map(|(_, cb)| cb.clone()).collect();
                        debug!(
                            "[file-watch] {:?} changed, {} callback(s)",
                            task_target,
                            current.len()
                        );
                        for callback in current {
                            callback(task_target.clone()).await;
                        }
                    }
                    Err(e) => warn!("[file-watch] Watch error: {:?}", e),
                }
            }
        });

        info!("[file-watch] Watching {:?}", target);
        Ok(WatchEntry {
            callbacks,
            _debouncer: debouncer,
            task,
        })
    }
}

fn watch_key(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

fn same_file(event_path: &Path, target: &Path) -> bool {
    event_path == target || watch_key(event_path) == target
}

impl FileWatcher for FileWatcherManager {
    fn add_callback(&self, path: &Path, callback: WatchCallback) -> anyhow::Result<CallbackId> {
        let key = watch_key(path);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut watches = lock(&self.watches);
        if !watches.contains_key(&key) {
            let entry = self.start_watch(key.clone()).map_err(|e| {
                error!("[file-watch] {:#}", e);
                e
            })?;
            watches.insert(key.clone(), entry);
        }
        if let Some(entry) = watches.get(&key) {
            lock(&entry.callbacks).push((id, callback));
        }
        Ok(id)
    }

    fn remove_callback(&self, path: &Path, id: CallbackId) -> bool {
        let key = watch_key(path);
        let mut watches = lock(&self.watches);
        let Some(entry) = watches.get(&key) else {
            return false;
        };
        let (removed, now_empty) = {
            let mut callbacks = lock(&entry.callbacks);
            let before = callbacks.len();
            callbacks.retain(|(callback_id, _)| *callback_id != id);
            (callbacks.len() != before, callbacks.is_empty())
        };
        if now_empty {
            watches.remove(&key);
            info!("[file-watch] Stopped watching {:?}", key);
        }
        removed
    }

    fn stop(&self) {
        let mut watches = lock(&self.watches);
        if !watches.is_empty() {
            info!("[file-watch] Stopping {} watch(es)", watches.len());
        }
        watches.clear();
    }
}
