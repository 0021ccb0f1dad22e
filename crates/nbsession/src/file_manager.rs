//! Notebook file access.
//!
//! Parsing and writing the notebook format is not this crate's business;
//! sessions talk to the file through [`NotebookFileManager`], and the
//! session manager turns file keys into file managers through a
//! [`NotebookResolver`].

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::bail;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::CellId;

/// One cell as stored in the notebook file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellSource {
    pub cell_id: CellId,
    pub code: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub config: Value,
}

impl CellSource {
    pub fn new(cell_id: impl Into<CellId>, code: impl Into<String>) -> Self {
        Self {
            cell_id: cell_id.into(),
            code: code.into(),
            name: String::new(),
            config: Value::Null,
        }
    }
}

/// Authoritative source for which cells exist.
pub trait NotebookFileManager: Send {
    /// Absolute path of the notebook, `None` if it was never saved.
    fn path(&self) -> Option<PathBuf>;

    fn filename(&self) -> Option<String> {
        self.path()
            .and_then(|path| path.file_name().map(|name| name.to_string_lossy().into_owned()))
    }

    /// Cells in notebook order.
    fn cells(&self) -> Vec<CellSource>;

    /// Layout config stored next to the notebook, if any.
    fn read_layout_config(&self) -> Option<Value> {
        None
    }

    /// Re-read the file. Returns the ids of cells whose code changed. On
    /// error the previously loaded cells stay in place.
    fn reload(&mut self) -> anyhow::Result<HashSet<CellId>>;

    /// Write `contents` to the notebook file.
    fn save(&mut self, contents: &str) -> anyhow::Result<()>;

    /// Contents of the most recent `save`, used to recognize our own writes
    /// when the watcher fires.
    fn last_saved_contents(&self) -> Option<String>;

    fn rename(&mut self, new_path: &Path) -> anyhow::Result<()>;
}

/// Maps a file key to a file manager.
pub trait NotebookResolver: Send + Sync {
    fn resolve(&self, file_key: &str) -> anyhow::Result<Box<dyn NotebookFileManager>>;
}

/// Unsaved notebook held only in memory.
#[derive(Debug, Default, Clone)]
pub struct InMemoryNotebook {
    path: Option<PathBuf>,
    cells: Vec<CellSource>,
    last_saved: Option<String>,
}

impl InMemoryNotebook {
    pub fn new(cells: Vec<CellSource>) -> Self {
        Self {
            path: None,
            cells,
            last_saved: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }
}

impl NotebookFileManager for InMemoryNotebook {
    fn path(&self) -> Option<PathBuf> {
        self.path.clone()
    }

    fn cells(&self) -> Vec<CellSource> {
        self.cells.clone()
    }

    fn reload(&mut self) -> anyhow::Result<HashSet<CellId>> {
        Ok(HashSet::new())
    }

    fn save(&mut self, contents: &str) -> anyhow::Result<()> {
        self.last_saved = Some(contents.to_string());
        Ok(())
    }

    fn last_saved_contents(&self) -> Option<String> {
        self.last_saved.clone()
    }

    fn rename(&mut self, new_path: &Path) -> anyhow::Result<()> {
        if new_path.as_os_str().is_empty() {
            bail!("new notebook path is empty");
        }
        self.path = Some(new_path.to_path_buf());
        Ok(())
    }
}
