//! Reacting to on-disk edits of a session's notebook.
//!
//! Watch events for one file are handled one at a time (a lock per canonical
//! path). Each change reloads the notebook, diffs the cell set against what
//! was loaded before, and hands the diff to a mode-specific
//! [`ReloadStrategy`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};

use crate::commands::Command;
use crate::config::OnCellChange;
use crate::file_manager::CellSource;
use crate::notifications::Notification;
use crate::session::Session;
use crate::{lock, CellId, SessionMode};

/// Cells that differ between two loads of a notebook.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CellDiff {
    pub changed: BTreeSet<CellId>,
    pub added: BTreeSet<CellId>,
    pub deleted: BTreeSet<CellId>,
}

impl CellDiff {
    pub fn between(before: &[CellSource], after: &[CellSource]) -> Self {
        let old: HashMap<&str, &str> = before
            .iter()
            .map(|cell| (cell.cell_id.as_str(), cell.code.as_str()))
            .collect();
        let new: HashMap<&str, &str> = after
            .iter()
            .map(|cell| (cell.cell_id.as_str(), cell.code.as_str()))
            .collect();

        let mut diff = CellDiff::default();
        for (cell_id, code) in &new {
            match old.get(cell_id) {
                None => {
                    diff.added.insert(cell_id.to_string());
                }
                Some(previous) if previous != code => {
                    diff.changed.insert(cell_id.to_string());
                }
                Some(_) => {}
            }
        }
        for cell_id in old.keys() {
            if !new.contains_key(cell_id) {
                diff.deleted.insert(cell_id.to_string());
            }
        }
        diff
    }

    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.added.is_empty() && self.deleted.is_empty()
    }
}

/// What handling a change amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileChangeOutcome {
    /// The file holds what the session itself last wrote.
    SelfWrite,
    /// Reloading failed (typically a syntax error mid-edit); the previously
    /// loaded notebook stays in effect.
    ReloadFailed,
    Unchanged,
    Applied(CellDiff),
}

/// Mode-specific reaction to a reloaded notebook.
pub trait ReloadStrategy: Send + Sync {
    fn handle_reload(&self, session: &Session, diff: &CellDiff, cells: &[CellSource]);
}

/// Edit mode: keep the editor's cell list current and either re-run changed
/// cells or mark them stale.
pub struct EditReloadStrategy {
    pub on_cell_change: OnCellChange,
}

impl ReloadStrategy for EditReloadStrategy {
    fn handle_reload(&self, session: &Session, diff: &CellDiff, cells: &[CellSource]) {
        session.notify(
            Notification::UpdateCellIds {
                cell_ids: cells.iter().map(|cell| cell.cell_id.clone()).collect(),
            },
            None,
        );

        let touched: Vec<&CellSource> = cells
            .iter()
            .filter(|cell| diff.changed.contains(&cell.cell_id) || diff.added.contains(&cell.cell_id))
            .collect();

        match self.on_cell_change {
            OnCellChange::Autorun => {
                let command = Command::SyncGraph {
                    cells: cells
                        .iter()
                        .map(|cell| (cell.cell_id.clone(), cell.code.clone()))
                        .collect::<BTreeMap<_, _>>(),
                    run_ids: touched.iter().map(|cell| cell.cell_id.clone()).collect(),
                    delete_ids: diff.deleted.iter().cloned().collect(),
                };
                session.put_control_request(command, None);
            }
            OnCellChange::Lazy => {
                for cell_id in &diff.deleted {
                    session.put_control_request(
                        Command::DeleteCell {
                            cell_id: cell_id.clone(),
                        },
                        None,
                    );
                }
                if !touched.is_empty() {
                    session.notify(
                        Notification::UpdateCellCodes {
                            cell_ids: touched.iter().map(|cell| cell.cell_id.clone()).collect(),
                            codes: touched.iter().map(|cell| cell.code.clone()).collect(),
                            code_is_stale: true,
                        },
                        None,
                    );
                }
            }
        }
    }
}

/// Run mode: let the frontend refetch.
pub struct RunReloadStrategy;

impl ReloadStrategy for RunReloadStrategy {
    fn handle_reload(&self, session: &Session, _diff: &CellDiff, _cells: &[CellSource]) {
        session.notify(Notification::Reload, None);
    }
}

/// Serializes and applies file changes.
pub struct FileChangeCoordinator {
    strategy: Arc<dyn ReloadStrategy>,
    locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl FileChangeCoordinator {
    pub fn new(strategy: Arc<dyn ReloadStrategy>) -> Self {
        Self {
            strategy,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Coordinator with the default strategy for `mode`.
    pub fn for_mode(mode: SessionMode, on_cell_change: OnCellChange) -> Self {
        let strategy: Arc<dyn ReloadStrategy> = match mode {
            SessionMode::Edit => Arc::new(EditReloadStrategy { on_cell_change }),
            SessionMode::Run => Arc::new(RunReloadStrategy),
        };
        Self::new(strategy)
    }

    fn path_lock(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let key = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        lock(&self.locks).entry(key).or_default().clone()
    }

    pub async fn handle_change(&self, session: &Session, path: &Path) -> FileChangeOutcome {
        let path_lock = self.path_lock(path);
        let _guard = path_lock.lock().await;

        if let Some(last_saved) = session.with_file_manager(|fm| fm.last_saved_contents()) {
            if let Ok(on_disk) = tokio::fs::read_to_string(path).await {
                if on_disk == last_saved {
                    debug!("[file-change] Skipping self-write of {:?}", path);
                    return FileChangeOutcome::SelfWrite;
                }
            }
        }

        let reloaded = session.with_file_manager(|fm| {
            let before = fm.cells();
            fm.reload().map(|_| (before, fm.cells()))
        });
        let (before, after) = match reloaded {
            Ok(cells) => cells,
            Err(e) => {
                warn!("[file-change] Failed to reload {:?}: {:#}", path, e);
                return FileChangeOutcome::ReloadFailed;
            }
        };

        let diff = CellDiff::between(&before, &after);
        if diff.is_empty() {
            debug!("[file-change] {:?} changed on disk but no cell differs", path);
            return FileChangeOutcome::Unchanged;
        }
        info!(
            "[file-change] {:?}: {} changed, {} added, {} deleted",
            path,
            diff.changed.len(),
            diff.added.len(),
            diff.deleted.len()
        );
        self.strategy.handle_reload(session, &diff, &after);
        FileChangeOutcome::Applied(diff)
    }
}
