//! Shared fixtures for the integration tests: a file-backed notebook, the
//! calculator kernel and helpers for reading a consumer's stream.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use nbsession::config::{RuntimeConfig, StaticConfig};
use nbsession::file_manager::{CellSource, NotebookFileManager, NotebookResolver};
use nbsession::kernel::{DefaultKernelLauncher, KernelCommand};
use nbsession::manager::{SessionManager, SessionManagerConfig};
use nbsession::notifications::{CellStatus, Notification, SerializedNotification};
use nbsession::{CellId, SessionMode};
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

pub const TIMEOUT: Duration = Duration::from_secs(5);

// ─── Notebook files ──────────────────────────────────────────────────────────

/// Render cells in the `# cell: <id>` format understood by [`FileNotebook`].
pub fn render(cells: &[(&str, &str)]) -> String {
    cells
        .iter()
        .map(|(id, code)| format!("# cell: {}\n{}\n", id, code))
        .collect()
}

pub fn write_notebook(dir: &Path, name: &str, cells: &[(&str, &str)]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, render(cells)).unwrap();
    path
}

fn parse(contents: &str) -> Vec<CellSource> {
    let mut cells: Vec<CellSource> = Vec::new();
    for line in contents.lines() {
        if let Some(id) = line.strip_prefix("# cell: ") {
            cells.push(CellSource::new(id.trim(), ""));
        } else if let Some(cell) = cells.last_mut() {
            if !cell.code.is_empty() {
                cell.code.push('\n');
            }
            cell.code.push_str(line);
        }
    }
    cells
}

pub struct FileNotebook {
    path: PathBuf,
    cells: Vec<CellSource>,
    last_saved: Option<String>,
}

impl FileNotebook {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
        Ok(Self {
            path: path.to_path_buf(),
            cells: parse(&contents),
            last_saved: None,
        })
    }
}

impl NotebookFileManager for FileNotebook {
    fn path(&self) -> Option<PathBuf> {
        Some(self.path.clone())
    }

    fn cells(&self) -> Vec<CellSource> {
        self.cells.clone()
    }

    fn reload(&mut self) -> anyhow::Result<HashSet<CellId>> {
        let contents = std::fs::read_to_string(&self.path)?;
        let cells = parse(&contents);
        if cells.is_empty() && !contents.trim().is_empty() {
            anyhow::bail!("no cells found in {:?}", self.path);
        }
        let before: BTreeMap<_, _> = self
            .cells
            .iter()
            .map(|cell| (cell.cell_id.clone(), cell.code.clone()))
            .collect();
        let changed = cells
            .iter()
            .filter(|cell| before.get(&cell.cell_id) != Some(&cell.code))
            .map(|cell| cell.cell_id.clone())
            .collect();
        self.cells = cells;
        Ok(changed)
    }

    fn save(&mut self, contents: &str) -> anyhow::Result<()> {
        std::fs::write(&self.path, contents)?;
        self.cells = parse(contents);
        self.last_saved = Some(contents.to_string());
        Ok(())
    }

    fn last_saved_contents(&self) -> Option<String> {
        self.last_saved.clone()
    }

    fn rename(&mut self, new_path: &Path) -> anyhow::Result<()> {
        std::fs::rename(&self.path, new_path)?;
        self.path = new_path.to_path_buf();
        Ok(())
    }
}

/// File keys are paths.
pub struct FileResolver;

impl NotebookResolver for FileResolver {
    fn resolve(&self, file_key: &str) -> anyhow::Result<Box<dyn NotebookFileManager>> {
        Ok(Box::new(FileNotebook::open(Path::new(file_key))?))
    }
}

// ─── Kernels ─────────────────────────────────────────────────────────────────

#[path = "../../src/bin/nbsession-calc-kernel/calculator.rs"]
mod calculator;

pub use calculator::{Calculator, CalculatorFactory};

/// The calculator kernel host built alongside these tests.
pub fn calc_kernel_command() -> KernelCommand {
    KernelCommand::new(env!("CARGO_BIN_EXE_nbsession-calc-kernel"))
}

/// Thread kernels in run mode, calculator processes in edit mode.
pub fn launcher() -> DefaultKernelLauncher {
    DefaultKernelLauncher::new(Arc::new(CalculatorFactory))
        .with_process_command(calc_kernel_command())
}

// ─── Managers ────────────────────────────────────────────────────────────────

/// Session manager over files in `dir`.
pub fn manager(mode: SessionMode, runtime: RuntimeConfig, dir: &TempDir) -> SessionManager {
    manager_with(mode, runtime, dir, launcher())
}

pub fn manager_with(
    mode: SessionMode,
    runtime: RuntimeConfig,
    dir: &TempDir,
    launcher: DefaultKernelLauncher,
) -> SessionManager {
    SessionManager::new(
        SessionManagerConfig {
            mode,
            cache_dir: dir.path().join("cache"),
            ..SessionManagerConfig::default()
        },
        Arc::new(StaticConfig(runtime)),
        Arc::new(FileResolver),
        Arc::new(launcher),
    )
}

pub fn file_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

// ─── Streams ─────────────────────────────────────────────────────────────────

/// Next notification, or `None` if the stream ended or nothing arrived
/// within [`TIMEOUT`].
pub async fn next(rx: &mut UnboundedReceiver<SerializedNotification>) -> Option<Notification> {
    match tokio::time::timeout(TIMEOUT, rx.recv()).await {
        Ok(Some(message)) => Some(message.parse().unwrap()),
        _ => None,
    }
}

/// Read until `predicate` matches; panics on timeout.
pub async fn wait_for(
    rx: &mut UnboundedReceiver<SerializedNotification>,
    predicate: impl Fn(&Notification) -> bool,
) -> Notification {
    loop {
        match next(rx).await {
            Some(notification) if predicate(&notification) => return notification,
            Some(_) => continue,
            None => panic!("stream ended before the expected notification"),
        }
    }
}

pub fn is_idle(cell_id: &str) -> impl Fn(&Notification) -> bool + '_ {
    move |notification| {
        matches!(
            notification,
            Notification::CellOp(op) if op.cell_id == cell_id && op.status == Some(CellStatus::Idle)
        )
    }
}

pub fn output_text(notification: &Notification) -> Option<String> {
    match notification {
        Notification::CellOp(op) => op
            .output
            .as_ref()
            .and_then(|output| output.data.as_str())
            .map(str::to_string),
        _ => None,
    }
}

/// Poll `condition` until it holds or [`TIMEOUT`] passes.
pub async fn eventually(condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}
