//! Deciding which existing session a reconnecting client gets back.
//!
//! Edit mode resumes by notebook: a reconnect for a file with exactly one
//! orphaned session takes it over under the new session id. Run mode
//! resumes by identity only, so app viewers never land in each other's
//! sessions.

use std::sync::Arc;

use log::{error, info};

use crate::repository::SessionRepository;
use crate::session::Session;
use crate::{ConnectionState, SessionMode};

#[derive(Debug, thiserror::Error)]
pub enum ResumeError {
    /// More than one orphaned session for one notebook. Only one editor
    /// session per file can be orphaned at a time, so this is a bookkeeping
    /// bug rather than a user error.
    #[error("{count} orphaned sessions for {file_key}; expected at most one")]
    AmbiguousOrphans { file_key: String, count: usize },
}

pub trait ResumeStrategy: Send + Sync {
    /// Find the session `new_session_id` should take over. Renaming it in
    /// the repository is the caller's job.
    fn find_resumable(
        &self,
        repo: &SessionRepository,
        new_session_id: &str,
        file_key: &str,
    ) -> Result<Option<Arc<Session>>, ResumeError>;
}

pub fn strategy_for_mode(mode: SessionMode) -> Arc<dyn ResumeStrategy> {
    match mode {
        SessionMode::Edit => Arc::new(EditResumeStrategy),
        SessionMode::Run => Arc::new(RunResumeStrategy),
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct EditResumeStrategy;

impl ResumeStrategy for EditResumeStrategy {
    fn find_resumable(
        &self,
        repo: &SessionRepository,
        new_session_id: &str,
        file_key: &str,
    ) -> Result<Option<Arc<Session>>, ResumeError> {
        let mut orphans: Vec<_> = repo
            .get_by_file_key(file_key)
            .into_iter()
            .filter(|session| session.connection_state() == ConnectionState::Orphaned)
            .collect();
        match orphans.len() {
            0 => Ok(None),
            1 => {
                let session = orphans.remove(0);
                info!(
                    "[resume] {} takes over orphaned session {} for {}",
                    new_session_id,
                    session.session_id(),
                    file_key
                );
                Ok(Some(session))
            }
            count => {
                let err = ResumeError::AmbiguousOrphans {
                    file_key: file_key.to_string(),
                    count,
                };
                error!("[resume] {}", err);
                Err(err)
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RunResumeStrategy;

impl ResumeStrategy for RunResumeStrategy {
    fn find_resumable(
        &self,
        repo: &SessionRepository,
        new_session_id: &str,
        file_key: &str,
    ) -> Result<Option<Arc<Session>>, ResumeError> {
        Ok(repo.get(new_session_id).filter(|session| {
            session.file_key() == file_key && session.connection_state() == ConnectionState::Orphaned
        }))
    }
}
