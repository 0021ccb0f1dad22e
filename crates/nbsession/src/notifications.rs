//! Kernel and session notifications delivered to consumers.
//!
//! Notifications are JSON objects tagged by an `op` field:
//!
//! ```text
//! {"op": "cell_op", "cell_id": "c1", "status": "idle", ...}
//! ```
//!
//! A notification is serialized exactly once per broadcast
//! ([`SerializedNotification`]) and the same payload is handed to every
//! consumer in the room.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::buffers::{deserialize_buffers, serialize_buffers};
use crate::CellId;

// ─── Cell operations ─────────────────────────────────────────────────────────

/// Execution status of a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CellStatus {
    Idle,
    Queued,
    Running,
    /// An ancestor is disabled, so the cell will not run.
    DisabledTransitively,
}

/// A single output or console chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellOutput {
    /// `output`, `stdout`, `stderr`, `stdin`, `marimo-error`, ...
    pub channel: String,
    pub mimetype: String,
    pub data: Value,
    #[serde(default)]
    pub timestamp: f64,
}

impl CellOutput {
    pub fn new(channel: impl Into<String>, mimetype: impl Into<String>, data: Value) -> Self {
        Self {
            channel: channel.into(),
            mimetype: mimetype.into(),
            data,
            timestamp: now_timestamp(),
        }
    }

    /// Plain-text stdout chunk.
    pub fn stdout(text: impl Into<String>) -> Self {
        Self::new("stdout", "text/plain", Value::String(text.into()))
    }

    /// Plain-text stderr chunk.
    pub fn stderr(text: impl Into<String>) -> Self {
        Self::new("stderr", "text/plain", Value::String(text.into()))
    }

    /// Pending stdin prompt. The session view fills in the response once
    /// the user submits input.
    pub fn stdin_prompt(prompt: impl Into<String>) -> Self {
        Self::new("stdin", "text/plain", Value::String(prompt.into()))
    }

    pub fn is_stdin(&self) -> bool {
        self.channel == "stdin"
    }
}

/// Status, output and console update for one cell.
///
/// Every field except `cell_id` is optional: absent fields leave the
/// previously known value untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellNotification {
    pub cell_id: CellId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<CellStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<CellOutput>,
    /// Console chunks to append. `Some(vec![])` clears the console.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub console: Option<Vec<CellOutput>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stale_inputs: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default)]
    pub timestamp: f64,
}

impl CellNotification {
    pub fn new(cell_id: impl Into<CellId>) -> Self {
        Self {
            cell_id: cell_id.into(),
            status: None,
            output: None,
            console: None,
            stale_inputs: None,
            run_id: None,
            timestamp: now_timestamp(),
        }
    }

    pub fn with_status(mut self, status: CellStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_output(mut self, output: CellOutput) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_console(mut self, console: Vec<CellOutput>) -> Self {
        self.console = Some(console);
        self
    }
}

/// Seconds since the Unix epoch, as the frontend expects.
pub fn now_timestamp() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

// ─── Variables and data ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableDeclaration {
    pub name: String,
    #[serde(default)]
    pub declared_by: Vec<CellId>,
    #[serde(default)]
    pub used_by: Vec<CellId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableValue {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datatype: Option<String>,
}

/// A table known to the kernel (dataframe, SQL table, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataTable {
    pub name: String,
    /// Where the table lives, e.g. `memory` or a connection name.
    pub source: String,
    pub source_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_rows: Option<u64>,
    #[serde(default)]
    pub columns: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSourceConnection {
    pub name: String,
    pub source: String,
    pub dialect: String,
    pub display_name: String,
}

// ─── Kernel ready ────────────────────────────────────────────────────────────

/// Bootstrap payload: the first message every newly attached consumer
/// receives.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KernelReady {
    pub cell_ids: Vec<CellId>,
    pub codes: Vec<String>,
    pub names: Vec<String>,
    pub configs: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout: Option<Value>,
    /// Whether the consumer is reattaching to a session with existing state.
    pub resumed: bool,
    #[serde(default)]
    pub ui_values: BTreeMap<String, Value>,
    #[serde(default)]
    pub last_executed_code: BTreeMap<CellId, String>,
    #[serde(default)]
    pub last_execution_time: BTreeMap<CellId, f64>,
    #[serde(default)]
    pub kiosk: bool,
    #[serde(default)]
    pub capabilities: BTreeMap<String, bool>,
}

// ─── Widget models ───────────────────────────────────────────────────────────

/// Kernel-originated widget-model lifecycle message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum ModelMessage {
    Open {
        state: Map<String, Value>,
        #[serde(default)]
        buffer_paths: Vec<Vec<Value>>,
        #[serde(
            default,
            serialize_with = "serialize_buffers",
            deserialize_with = "deserialize_buffers"
        )]
        buffers: Vec<Bytes>,
    },
    Update {
        state: Map<String, Value>,
        #[serde(default)]
        buffer_paths: Vec<Vec<Value>>,
        #[serde(
            default,
            serialize_with = "serialize_buffers",
            deserialize_with = "deserialize_buffers"
        )]
        buffers: Vec<Bytes>,
    },
    Custom {
        content: Value,
        #[serde(
            default,
            serialize_with = "serialize_buffers",
            deserialize_with = "deserialize_buffers"
        )]
        buffers: Vec<Bytes>,
    },
    Close,
}

// ─── Logs ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Start,
    Append,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageStatus {
    Queued,
    Installing,
    Installed,
    Failed,
}

// ─── Notification ────────────────────────────────────────────────────────────

/// Messages from the kernel (or the session itself) to consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Notification {
    CellOp(CellNotification),

    Variables {
        variables: Vec<VariableDeclaration>,
    },

    VariableValues {
        variables: Vec<VariableValue>,
    },

    Datasets {
        tables: Vec<DataTable>,
        /// When set, every known table from this source is dropped first.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        clear_channel: Option<String>,
    },

    DataSourceConnections {
        connections: Vec<DataSourceConnection>,
    },

    /// Current cell ordering.
    UpdateCellIds {
        cell_ids: Vec<CellId>,
    },

    /// Cell code changed outside the editor.
    UpdateCellCodes {
        cell_ids: Vec<CellId>,
        codes: Vec<String>,
        code_is_stale: bool,
    },

    /// Tell the frontend to refetch the notebook.
    Reload,

    /// Sent to a consumer that resumed an orphaned session.
    Reconnected,

    Alert {
        title: String,
        description: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        variant: Option<String>,
    },

    Banner {
        title: String,
        description: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        variant: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        action: Option<String>,
    },

    KernelReady(KernelReady),

    ModelLifecycle {
        model_id: String,
        message: ModelMessage,
    },

    StartupLogs {
        content: String,
        status: LogStatus,
    },

    InstallingPackageAlert {
        packages: BTreeMap<String, PackageStatus>,
        /// Per-package log chunk to append.
        #[serde(default)]
        logs: BTreeMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        log_status: Option<LogStatus>,
    },

    CompletionResult {
        completion_id: String,
        prefix_length: usize,
        options: Vec<Value>,
    },

    SecretKeysResult {
        request_id: String,
        secrets: Vec<String>,
    },

    FunctionCallResult {
        function_call_id: String,
        return_value: Value,
        #[serde(default)]
        status: Value,
    },

    SqlTablePreview {
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        table: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    SqlTableListPreview {
        request_id: String,
        tables: Vec<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    DataColumnPreview {
        table_name: String,
        column_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chart_spec: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    Interrupted,

    CompletedRun,
}

impl Notification {
    /// Wire tag of this notification.
    pub fn op(&self) -> &'static str {
        match self {
            Notification::CellOp(_) => "cell_op",
            Notification::Variables { .. } => "variables",
            Notification::VariableValues { .. } => "variable_values",
            Notification::Datasets { .. } => "datasets",
            Notification::DataSourceConnections { .. } => "data_source_connections",
            Notification::UpdateCellIds { .. } => "update_cell_ids",
            Notification::UpdateCellCodes { .. } => "update_cell_codes",
            Notification::Reload => "reload",
            Notification::Reconnected => "reconnected",
            Notification::Alert { .. } => "alert",
            Notification::Banner { .. } => "banner",
            Notification::KernelReady(_) => "kernel_ready",
            Notification::ModelLifecycle { .. } => "model_lifecycle",
            Notification::StartupLogs { .. } => "startup_logs",
            Notification::InstallingPackageAlert { .. } => "installing_package_alert",
            Notification::CompletionResult { .. } => "completion_result",
            Notification::SecretKeysResult { .. } => "secret_keys_result",
            Notification::FunctionCallResult { .. } => "function_call_result",
            Notification::SqlTablePreview { .. } => "sql_table_preview",
            Notification::SqlTableListPreview { .. } => "sql_table_list_preview",
            Notification::DataColumnPreview { .. } => "data_column_preview",
            Notification::Interrupted => "interrupted",
            Notification::CompletedRun => "completed_run",
        }
    }

    /// Build an alert with no variant.
    pub fn alert(title: impl Into<String>, description: impl Into<String>) -> Self {
        Notification::Alert {
            title: title.into(),
            description: description.into(),
            variant: None,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// A notification serialized once and shared by every recipient.
#[derive(Debug, Clone, PartialEq)]
pub struct SerializedNotification {
    pub op: &'static str,
    pub payload: Arc<str>,
}

impl SerializedNotification {
    pub fn new(notification: &Notification) -> Result<Self, serde_json::Error> {
        Ok(Self {
            op: notification.op(),
            payload: Arc::from(notification.to_json()?),
        })
    }

    /// Decode the payload back into a [`Notification`].
    pub fn parse(&self) -> Result<Notification, serde_json::Error> {
        Notification::from_json(&self.payload)
    }
}
