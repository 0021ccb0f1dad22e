//! nbsession - session management core for notebook servers.
//!
//! A session pairs one notebook with one isolated execution kernel (a child
//! process in edit mode, a thread in run mode, or a sandboxed interpreter
//! reached over framed stdio) and fans kernel notifications out to any
//! number of attached consumers through a broadcast room.
//!
//! The moving parts, leaf first:
//!
//! - [`queues`]: the per-kernel queue set (control, UI updates, completion,
//!   stdin, interrupt, output stream)
//! - [`kernel`]: kernel managers and the kernel-side command loop
//! - [`room`] / [`consumer`]: broadcast group and its members
//! - [`session_view`]: latest-value journal replayed to reconnecting clients
//! - [`events`] / [`extensions`]: pub-sub bus and the behaviors hung off it
//! - [`session`]: the aggregate tying all of the above together
//! - [`repository`] / [`resume`] / [`manager`]: session lookup, resumption
//!   and top-level orchestration
//! - [`file_change`] / [`watcher`]: reacting to on-disk notebook edits
//! - [`batching`]: compaction of UI-element and widget-model update bursts

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub mod batching;
pub mod buffers;
pub mod commands;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod error;
pub mod events;
pub mod extensions;
pub mod file_change;
pub mod file_manager;
pub mod kernel;
pub mod manager;
pub mod notifications;
pub mod queues;
pub mod repository;
pub mod resume;
pub mod room;
pub mod session;
pub mod session_view;
pub mod token;
pub mod watcher;

pub use error::SessionError;

/// Identifier of a notebook cell.
pub type CellId = String;

/// Identifier of a consumer attached to a session room.
pub type ConsumerId = String;

/// Opaque session identifier chosen by the transport layer.
pub type SessionId = String;

/// Key identifying a notebook file: its path, or a placeholder for
/// notebooks that have not been saved yet.
pub type FileKey = String;

// ============================================================================
// Types
// ============================================================================

/// How notebooks are served.
///
/// Edit mode gives each notebook an interactive kernel process; run mode
/// serves read-only apps and runs kernels on threads to keep many sessions
/// cheap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    Edit,
    Run,
}

impl std::fmt::Display for SessionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionMode::Edit => write!(f, "edit"),
            SessionMode::Run => write!(f, "run"),
        }
    }
}

/// Connection state of a consumer, and by extension of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Open,
    Connecting,
    Closed,
    /// Kernel alive but no main consumer attached.
    Orphaned,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Open => write!(f, "open"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Closed => write!(f, "closed"),
            ConnectionState::Orphaned => write!(f, "orphaned"),
        }
    }
}

/// Lifecycle of a kernel execution unit. There is no transition out of
/// `Stopped`; a fresh kernel needs a fresh manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelState {
    NotStarted,
    Running,
    Stopped,
}

impl std::fmt::Display for KernelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KernelState::NotStarted => write!(f, "not_started"),
            KernelState::Running => write!(f, "running"),
            KernelState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Close codes handed to the transport when a connection is refused or
/// terminated by the session layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum CloseCode {
    Normal = 1000,
    /// A primary editor is already connected to this notebook.
    AlreadyConnected = 1003,
    Forbidden = 1008,
    UnexpectedError = 1011,
}

impl CloseCode {
    pub fn code(self) -> u16 {
        self as u16
    }
}

/// Lock a std mutex, recovering the data if a holder panicked.
///
/// Session bookkeeping stays usable after a panicking extension; the data
/// behind these locks is always left consistent between statements.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Paths
// ============================================================================

/// Base directory for nbsession state: `~/.cache/nbsession/`.
pub fn base_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("nbsession")
}

/// Default directory for persisted session views.
pub fn default_session_cache_dir() -> PathBuf {
    base_dir().join("sessions")
}

/// Cache file name for a notebook: SHA-256 of its path plus `.json`, so
/// notebooks with the same file name in different directories never collide.
pub fn session_cache_filename(notebook_path: &Path) -> String {
    let hash = hex::encode(Sha256::digest(notebook_path.to_string_lossy().as_bytes()));
    format!("{}.json", hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_mode_display() {
        assert_eq!(SessionMode::Edit.to_string(), "edit");
        assert_eq!(SessionMode::Run.to_string(), "run");
    }

    #[test]
    fn test_session_mode_serialize() {
        let json = serde_json::to_string(&SessionMode::Run).unwrap();
        assert_eq!(json, "\"run\"");
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Orphaned.to_string(), "orphaned");
        assert_eq!(ConnectionState::Open.to_string(), "open");
    }

    #[test]
    fn test_close_codes() {
        assert_eq!(CloseCode::Normal.code(), 1000);
        assert_eq!(CloseCode::AlreadyConnected.code(), 1003);
        assert_eq!(CloseCode::UnexpectedError.code(), 1011);
    }

    #[test]
    fn test_cache_filename_is_stable_and_distinct() {
        let a = session_cache_filename(Path::new("/a/notebook.py"));
        let b = session_cache_filename(Path::new("/b/notebook.py"));
        assert_eq!(a, session_cache_filename(Path::new("/a/notebook.py")));
        assert_ne!(a, b);
        assert!(a.ends_with(".json"));
        assert_eq!(a.len(), 64 + ".json".len());
    }
}
