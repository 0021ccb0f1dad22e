//! Disk-backed session view cache.
//!
//! The view is written to `<cache_dir>/<sha256(notebook path)>.json` on a
//! fixed interval while it has unsaved changes, and once more on detach.
//! On attach a cache file is restored only if it was written by the same
//! crate version for exactly the same cell ids and codes.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;

use crate::commands::Command;
use crate::events::{SessionEventBus, SessionEventListener};
use crate::file_manager::CellSource;
use crate::notifications::Notification;
use crate::session::{Session, SessionHandle};
use crate::session_view::SessionView;
use crate::{lock, session_cache_filename};

use super::{SessionExtension, Subscription};

pub const CACHE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// On-disk cache layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheFile {
    pub version: String,
    pub cache_key: String,
    pub view: SessionView,
}

/// Hash of the crate version plus every cell id and code, in order.
pub fn cache_key(cells: &[CellSource]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(CACHE_VERSION.as_bytes());
    for cell in cells {
        hasher.update([0u8]);
        hasher.update(cell.cell_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(cell.code.as_bytes());
    }
    hex::encode(hasher.finalize())
}

pub fn read_cache(path: &Path) -> anyhow::Result<Option<CacheFile>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("failed to read {:?}", path)),
    };
    let file = serde_json::from_str(&contents).with_context(|| format!("failed to parse {:?}", path))?;
    Ok(Some(file))
}

/// Write through a temp file so a crash never leaves half a cache behind.
pub fn write_cache(path: &Path, file: &CacheFile) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("failed to create {:?}", parent))?;
    }
    let json = serde_json::to_string(file)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).with_context(|| format!("failed to write {:?}", tmp))?;
    std::fs::rename(&tmp, path).with_context(|| format!("failed to move cache into {:?}", path))?;
    Ok(())
}

pub struct CachingExtension {
    cache_dir: PathBuf,
    session: Mutex<Option<SessionHandle>>,
    cache_path: Mutex<Option<PathBuf>>,
    dirty: AtomicBool,
    subscription: Subscription,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CachingExtension {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self {
            cache_dir,
            session: Mutex::new(None),
            cache_path: Mutex::new(None),
            dirty: AtomicBool::new(false),
            subscription: Subscription::default(),
            task: Mutex::new(None),
        }
    }

    pub fn cache_path(&self) -> Option<PathBuf> {
        lock(&self.cache_path).clone()
    }

    fn cache_path_for(&self, notebook_path: &Path) -> PathBuf {
        self.cache_dir.join(session_cache_filename(notebook_path))
    }

    /// Write the current view now.
    pub fn write_now(&self) -> anyhow::Result<()> {
        let Some(path) = self.cache_path() else {
            return Ok(());
        };
        let session = lock(&self.session)
            .as_ref()
            .and_then(SessionHandle::get)
            .ok_or_else(|| anyhow!("session is gone"))?;
        let file = CacheFile {
            version: CACHE_VERSION.to_string(),
            cache_key: cache_key(&session.cells()),
            view: session.view_snapshot(),
        };
        write_cache(&path, &file)?;
        debug!("[cache] Wrote {:?}", path);
        Ok(())
    }

    fn restore(&self, session: &Session, path: &Path) {
        match read_cache(path) {
            Ok(Some(file)) if file.version == CACHE_VERSION && file.cache_key == cache_key(&session.cells()) => {
                info!("[cache] Restoring session view from {:?}", path);
                session.replace_view(file.view);
            }
            Ok(Some(_)) => debug!("[cache] Ignoring stale cache {:?}", path),
            Ok(None) => {}
            Err(e) => warn!("[cache] {:#}", e),
        }
    }
}

impl SessionExtension for CachingExtension {
    fn name(&self) -> &'static str {
        "caching"
    }

    fn on_attach(self: Arc<Self>, handle: SessionHandle, bus: Arc<SessionEventBus>) -> anyhow::Result<()> {
        let runtime = tokio::runtime::Handle::try_current().context("no tokio runtime")?;
        let session = handle.get().ok_or_else(|| anyhow!("session dropped before attach"))?;
        let Some(notebook_path) = session.notebook_path() else {
            debug!("[cache] Notebook is unsaved, caching disabled");
            return Ok(());
        };
        let path = self.cache_path_for(&notebook_path);
        *lock(&self.cache_path) = Some(path.clone());
        *lock(&self.session) = Some(handle);

        self.restore(&session, &path);
        self.subscription.subscribe(bus, self.clone());

        let period = session.config().runtime_config().cache_interval();
        let this = self.clone();
        let task = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !this.dirty.swap(false, Ordering::SeqCst) {
                    continue;
                }
                let writer = this.clone();
                match tokio::task::spawn_blocking(move || writer.write_now()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("[cache] Failed to write cache: {:#}", e),
                    Err(e) => warn!("[cache] Cache writer panicked: {}", e),
                }
            }
        });
        if let Some(previous) = lock(&self.task).replace(task) {
            previous.abort();
        }
        Ok(())
    }

    fn on_detach(&self) -> anyhow::Result<()> {
        self.subscription.unsubscribe();
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
        if self.dirty.swap(false, Ordering::SeqCst) {
            self.write_now()?;
        }
        Ok(())
    }
}

impl SessionEventListener for CachingExtension {
    fn on_notification_sent(&self, _session: &Session, _notification: &Notification) -> anyhow::Result<()> {
        self.dirty.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn on_received_command(
        &self,
        _session: &Session,
        _command: &Command,
        _from_consumer_id: Option<&str>,
    ) -> anyhow::Result<()> {
        self.dirty.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn on_notebook_renamed(&self, session: &Session, _old_path: Option<&Path>) -> anyhow::Result<()> {
        if let Some(notebook_path) = session.notebook_path() {
            let path = self.cache_path_for(&notebook_path);
            info!("[cache] Cache moves to {:?}", path);
            *lock(&self.cache_path) = Some(path);
            self.dirty.store(true, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extensions::SessionViewExtension;
    use crate::session::test_support::{params, FakeLauncher};
    use crate::SessionMode;

    async fn start(cache_dir: &Path) -> (Arc<Session>, Arc<CachingExtension>) {
        let caching = Arc::new(CachingExtension::new(cache_dir.to_path_buf()));
        let mut params = params(FakeLauncher::new(), SessionMode::Edit);
        params.extensions = vec![Arc::new(SessionViewExtension::new()), caching.clone()];
        (Session::start(params).await.unwrap(), caching)
    }

    #[test]
    fn test_cache_key_tracks_ids_and_codes() {
        let base = vec![CellSource::new("a", "x = 1")];
        assert_eq!(cache_key(&base), cache_key(&base.clone()));
        assert_ne!(cache_key(&base), cache_key(&[CellSource::new("a", "x = 2")]));
        assert_ne!(cache_key(&base), cache_key(&[CellSource::new("b", "x = 1")]));
    }

    #[tokio::test]
    async fn test_flush_on_detach_and_restore() {
        let dir = tempfile::TempDir::new().unwrap();
        let (session, caching) = start(dir.path()).await;
        let path = caching.cache_path().unwrap();
        assert!(path.starts_with(dir.path()));

        session.notify(
            Notification::UpdateCellIds {
                cell_ids: vec!["c1".into(), "c2".into()],
            },
            None,
        );
        session.close();
        let written = read_cache(&path).unwrap().unwrap();
        assert_eq!(written.version, CACHE_VERSION);

        let (restored, _) = start(dir.path()).await;
        assert_eq!(restored.view_snapshot(), written.view);
        assert!(!restored.view_snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_stale_cache_is_ignored() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join(session_cache_filename(Path::new("/notebooks/nb.py")));
        let mut view = SessionView::new();
        view.add_notification(&Notification::UpdateCellIds {
            cell_ids: vec!["other".into()],
        });
        write_cache(
            &path,
            &CacheFile {
                version: CACHE_VERSION.into(),
                cache_key: "not-the-key".into(),
                view,
            },
        )
        .unwrap();

        let (session, _) = start(dir.path()).await;
        assert!(session.view_snapshot().is_empty());
    }

    #[test]
    fn test_missing_cache_reads_none() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(read_cache(&dir.path().join("missing.json")).unwrap().is_none());
    }
}
