//! Keyed store of live sessions.
//!
//! Lookups are synchronous and cheap. Mutations come in two flavors: the
//! async ones take a tokio write lock so that check-then-insert sequences
//! in the manager (idempotent create, resume-then-rename) do not race; the
//! `_sync` ones are for callers already on a non-async path such as event
//! listeners.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use log::{debug, warn};

use crate::session::Session;
use crate::{lock, SessionId};

#[derive(Default)]
pub struct SessionRepository {
    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
    write_lock: tokio::sync::Mutex<()>,
}

impl SessionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold the write lock across a multi-step update.
    pub async fn write(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.write_lock.lock().await
    }

    pub async fn add(&self, session: Arc<Session>) {
        let _guard = self.write().await;
        self.add_sync(session);
    }

    pub fn add_sync(&self, session: Arc<Session>) {
        let id = session.session_id();
        debug!("[session-repo] Adding {}", id);
        if let Some(previous) = lock(&self.sessions).insert(id.clone(), session) {
            warn!("[session-repo] Replaced existing session {} ({})", id, previous.file_key());
        }
    }

    pub async fn remove(&self, session_id: &str) -> Option<Arc<Session>> {
        let _guard = self.write().await;
        self.remove_sync(session_id)
    }

    pub fn remove_sync(&self, session_id: &str) -> Option<Arc<Session>> {
        let removed = lock(&self.sessions).remove(session_id);
        if removed.is_some() {
            debug!("[session-repo] Removed {}", session_id);
        }
        removed
    }

    /// Remove `session` only if it is still stored under its id. A session
    /// that was resumed under a new id is left alone.
    pub fn remove_if_same(&self, session: &Session) -> bool {
        let mut sessions = lock(&self.sessions);
        let id = session.session_id();
        match sessions.get(&id) {
            Some(stored) if std::ptr::eq(stored.as_ref(), session) => {
                sessions.remove(&id);
                debug!("[session-repo] Removed {}", id);
                true
            }
            _ => false,
        }
    }

    /// Re-key a session. The session's own id is updated too.
    pub async fn rename(&self, old_id: &str, new_id: &str) -> bool {
        let _guard = self.write().await;
        self.rename_sync(old_id, new_id)
    }

    pub fn rename_sync(&self, old_id: &str, new_id: &str) -> bool {
        let mut sessions = lock(&self.sessions);
        let Some(session) = sessions.remove(old_id) else {
            warn!("[session-repo] Cannot rename unknown session {}", old_id);
            return false;
        };
        session.set_session_id(new_id.to_string());
        if let Some(displaced) = sessions.insert(new_id.to_string(), session) {
            warn!(
                "[session-repo] Rename {} -> {} displaced session for {}",
                old_id,
                new_id,
                displaced.file_key()
            );
        }
        debug!("[session-repo] Renamed {} -> {}", old_id, new_id);
        true
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        lock(&self.sessions).get(session_id).cloned()
    }

    pub fn get_by_file_key(&self, file_key: &str) -> Vec<Arc<Session>> {
        lock(&self.sessions)
            .values()
            .filter(|session| session.file_key() == file_key)
            .cloned()
            .collect()
    }

    pub fn get_by_consumer(&self, consumer_id: &str) -> Option<Arc<Session>> {
        lock(&self.sessions)
            .values()
            .find(|session| session.has_consumer(consumer_id))
            .cloned()
    }

    pub fn get_by_path(&self, path: &Path) -> Option<Arc<Session>> {
        self.all()
            .into_iter()
            .find(|session| session.notebook_path().as_deref() == Some(path))
    }

    pub fn all(&self) -> Vec<Arc<Session>> {
        lock(&self.sessions).values().cloned().collect()
    }

    pub fn ids(&self) -> Vec<SessionId> {
        lock(&self.sessions).keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.sessions).is_empty()
    }

    /// Sessions whose kernel is no longer alive.
    pub fn dead_sessions(&self) -> Vec<Arc<Session>> {
        lock(&self.sessions)
            .values()
            .filter(|session| !session.is_kernel_alive())
            .cloned()
            .collect()
    }
}
