//! Control-plane commands sent from consumers to the kernel.
//!
//! Commands are JSON objects tagged by a `type` field:
//!
//! ```text
//! {"type": "execute_cells", "cell_ids": ["c1"], "codes": ["x = 1"]}
//! ```
//!
//! Variants carrying parallel arrays validate their lengths both when built
//! through a constructor and when decoded from the wire, so a malformed
//! command never reaches the kernel.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::buffers::{deserialize_buffers, serialize_buffers};
use crate::CellId;

/// Error building or decoding a command.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("{left} and {right} must have the same length ({left_len} != {right_len})")]
    LengthMismatch {
        left: &'static str,
        left_len: usize,
        right: &'static str,
        right_len: usize,
    },
}

fn check_parallel(
    left: &'static str,
    left_len: usize,
    right: &'static str,
    right_len: usize,
) -> Result<(), CommandError> {
    if left_len == right_len {
        Ok(())
    } else {
        Err(CommandError::LengthMismatch {
            left,
            left_len,
            right,
            right_len,
        })
    }
}

/// Fresh dedup token for UI-element updates.
pub fn new_token() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ─── Execute cells ───────────────────────────────────────────────────────────

/// Run a set of cells with the given code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ExecuteCellsWire")]
pub struct ExecuteCells {
    cell_ids: Vec<CellId>,
    codes: Vec<String>,
}

#[derive(Deserialize)]
struct ExecuteCellsWire {
    cell_ids: Vec<CellId>,
    codes: Vec<String>,
}

impl TryFrom<ExecuteCellsWire> for ExecuteCells {
    type Error = CommandError;

    fn try_from(wire: ExecuteCellsWire) -> Result<Self, Self::Error> {
        Self::new(wire.cell_ids, wire.codes)
    }
}

impl ExecuteCells {
    pub fn new(cell_ids: Vec<CellId>, codes: Vec<String>) -> Result<Self, CommandError> {
        check_parallel("cell_ids", cell_ids.len(), "codes", codes.len())?;
        Ok(Self { cell_ids, codes })
    }

    pub fn cell_ids(&self) -> &[CellId] {
        &self.cell_ids
    }

    pub fn codes(&self) -> &[String] {
        &self.codes
    }

    /// `(cell_id, code)` pairs in request order.
    pub fn iter(&self) -> impl Iterator<Item = (&CellId, &String)> {
        self.cell_ids.iter().zip(self.codes.iter())
    }

    pub fn is_empty(&self) -> bool {
        self.cell_ids.is_empty()
    }
}

/// Bootstrap request built when a notebook is first loaded (or "run all"):
/// every cell plus the UI values the frontend already knows about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateNotebook {
    pub execution: ExecuteCells,
    #[serde(default)]
    pub ui_values: BTreeMap<String, Value>,
    /// When false the kernel registers the cells without running them.
    pub auto_run: bool,
}

// ─── UI elements and widget models ───────────────────────────────────────────

/// Set the values of UI elements (sliders, dropdowns, ...).
///
/// The token identifies one frontend interaction. The same command is put on
/// both the control queue and the UI batching queue, and the token lets the
/// kernel apply each interaction exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "UpdateUiElementWire")]
pub struct UpdateUiElement {
    object_ids: Vec<String>,
    values: Vec<Value>,
    token: String,
}

#[derive(Deserialize)]
struct UpdateUiElementWire {
    object_ids: Vec<String>,
    values: Vec<Value>,
    #[serde(default = "new_token")]
    token: String,
}

impl TryFrom<UpdateUiElementWire> for UpdateUiElement {
    type Error = CommandError;

    fn try_from(wire: UpdateUiElementWire) -> Result<Self, Self::Error> {
        Self::with_token(wire.object_ids, wire.values, wire.token)
    }
}

impl UpdateUiElement {
    /// Build an update with a fresh token.
    pub fn new(object_ids: Vec<String>, values: Vec<Value>) -> Result<Self, CommandError> {
        Self::with_token(object_ids, values, new_token())
    }

    pub fn with_token(
        object_ids: Vec<String>,
        values: Vec<Value>,
        token: impl Into<String>,
    ) -> Result<Self, CommandError> {
        check_parallel("object_ids", object_ids.len(), "values", values.len())?;
        Ok(Self {
            object_ids,
            values,
            token: token.into(),
        })
    }

    /// Build an update from `(object_id, value)` pairs.
    pub fn from_pairs(pairs: Vec<(String, Value)>, token: impl Into<String>) -> Self {
        let (object_ids, values) = pairs.into_iter().unzip();
        Self {
            object_ids,
            values,
            token: token.into(),
        }
    }

    pub fn object_ids(&self) -> &[String] {
        &self.object_ids
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// `(object_id, value)` pairs in request order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.object_ids.iter().zip(self.values.iter())
    }
}

/// Widget-model message method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelMethod {
    /// State delta; mergeable.
    Update,
    /// Opaque custom message; never merged.
    Custom,
}

/// Frontend-originated widget-model message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelUpdateMessage {
    pub method: ModelMethod,
    #[serde(default)]
    pub state: Map<String, Value>,
    /// Location of each binary buffer inside `state`. The first segment is
    /// the state key the buffer belongs to.
    #[serde(default)]
    pub buffer_paths: Vec<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
}

/// Update a widget model's state, or send it a custom message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "UpdateWidgetModelWire")]
pub struct UpdateWidgetModel {
    pub model_id: String,
    pub message: ModelUpdateMessage,
    #[serde(serialize_with = "serialize_buffers")]
    pub buffers: Vec<Bytes>,
}

#[derive(Deserialize)]
struct UpdateWidgetModelWire {
    model_id: String,
    message: ModelUpdateMessage,
    #[serde(default, deserialize_with = "deserialize_buffers")]
    buffers: Vec<Bytes>,
}

impl TryFrom<UpdateWidgetModelWire> for UpdateWidgetModel {
    type Error = CommandError;

    fn try_from(wire: UpdateWidgetModelWire) -> Result<Self, Self::Error> {
        Self::new(wire.model_id, wire.message, wire.buffers)
    }
}

impl UpdateWidgetModel {
    pub fn new(
        model_id: impl Into<String>,
        message: ModelUpdateMessage,
        buffers: Vec<Bytes>,
    ) -> Result<Self, CommandError> {
        check_parallel(
            "buffer_paths",
            message.buffer_paths.len(),
            "buffers",
            buffers.len(),
        )?;
        Ok(Self {
            model_id: model_id.into(),
            message,
            buffers,
        })
    }

    /// State-delta update with no binary buffers.
    pub fn update(model_id: impl Into<String>, state: Map<String, Value>) -> Self {
        Self {
            model_id: model_id.into(),
            message: ModelUpdateMessage {
                method: ModelMethod::Update,
                state,
                buffer_paths: Vec::new(),
                content: None,
            },
            buffers: Vec::new(),
        }
    }

    /// Custom message for the model.
    pub fn custom(model_id: impl Into<String>, content: Value) -> Self {
        Self {
            model_id: model_id.into(),
            message: ModelUpdateMessage {
                method: ModelMethod::Custom,
                state: Map::new(),
                buffer_paths: Vec::new(),
                content: Some(content),
            },
            buffers: Vec::new(),
        }
    }
}

// ─── Command ─────────────────────────────────────────────────────────────────

/// Commands sent from consumers to the kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Run the given cells.
    ExecuteCells(ExecuteCells),

    /// Run every cell currently marked stale.
    ExecuteStaleCells,

    /// Run throwaway code outside the dependency graph.
    ExecuteScratchpad { code: String },

    /// Initial load or "run all".
    CreateNotebook(CreateNotebook),

    /// Reconcile the kernel's cell set with `cells`, deleting `delete_ids`
    /// and running `run_ids` in one pass.
    SyncGraph {
        cells: BTreeMap<CellId, String>,
        run_ids: Vec<CellId>,
        delete_ids: Vec<CellId>,
    },

    /// Remove a cell from the graph.
    DeleteCell { cell_id: CellId },

    UpdateUiElement(UpdateUiElement),

    UpdateWidgetModel(UpdateWidgetModel),

    /// Call a function exposed by a UI element.
    InvokeFunction {
        function_call_id: String,
        namespace: String,
        function_name: String,
        #[serde(default)]
        args: Value,
    },

    UpdateCellConfig { configs: BTreeMap<CellId, Value> },

    UpdateUserConfig { config: Value },

    InstallPackages {
        manager: String,
        versions: BTreeMap<String, String>,
    },

    PreviewDatasetColumn {
        source_type: String,
        source: String,
        table_name: String,
        column_name: String,
    },

    PreviewSqlTable {
        request_id: String,
        engine: String,
        database: String,
        schema: String,
        table_name: String,
    },

    ListSqlTables {
        request_id: String,
        engine: String,
        database: String,
        schema: String,
    },

    ListSecretKeys { request_id: String },

    /// Code completion; routed to the completion queue, never the control
    /// queue.
    CodeCompletion {
        id: String,
        document: String,
        cell_id: CellId,
    },

    /// The notebook file was renamed.
    Rename { filename: String },

    /// Ask the kernel to exit its command loop.
    StopKernel,
}

impl Command {
    /// Build an execute-cells command, validating the parallel arrays.
    pub fn execute_cells(cell_ids: Vec<CellId>, codes: Vec<String>) -> Result<Self, CommandError> {
        Ok(Command::ExecuteCells(ExecuteCells::new(cell_ids, codes)?))
    }

    /// Build a UI-element update with a fresh token.
    pub fn update_ui_element(
        object_ids: Vec<String>,
        values: Vec<Value>,
    ) -> Result<Self, CommandError> {
        Ok(Command::UpdateUiElement(UpdateUiElement::new(
            object_ids, values,
        )?))
    }

    /// Wire tag of this command.
    pub fn kind(&self) -> &'static str {
        match self {
            Command::ExecuteCells(_) => "execute_cells",
            Command::ExecuteStaleCells => "execute_stale_cells",
            Command::ExecuteScratchpad { .. } => "execute_scratchpad",
            Command::CreateNotebook(_) => "create_notebook",
            Command::SyncGraph { .. } => "sync_graph",
            Command::DeleteCell { .. } => "delete_cell",
            Command::UpdateUiElement(_) => "update_ui_element",
            Command::UpdateWidgetModel(_) => "update_widget_model",
            Command::InvokeFunction { .. } => "invoke_function",
            Command::UpdateCellConfig { .. } => "update_cell_config",
            Command::UpdateUserConfig { .. } => "update_user_config",
            Command::InstallPackages { .. } => "install_packages",
            Command::PreviewDatasetColumn { .. } => "preview_dataset_column",
            Command::PreviewSqlTable { .. } => "preview_sql_table",
            Command::ListSqlTables { .. } => "list_sql_tables",
            Command::ListSecretKeys { .. } => "list_secret_keys",
            Command::CodeCompletion { .. } => "code_completion",
            Command::Rename { .. } => "rename",
            Command::StopKernel => "stop_kernel",
        }
    }

    /// UI-element and widget-model updates go through the batching queue in
    /// addition to the control queue.
    pub fn is_batched_update(&self) -> bool {
        matches!(
            self,
            Command::UpdateUiElement(_) | Command::UpdateWidgetModel(_)
        )
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
