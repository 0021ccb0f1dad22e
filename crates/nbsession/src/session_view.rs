//! Latest-value journal of a session.
//!
//! The view keeps only the newest state per logical key: one merged cell
//! notification per cell, the current variable table, datasets by name,
//! widget models by id, and so on. Replaying it ([`SessionView::notifications`])
//! brings a freshly attached consumer up to date without resending history.
//! The same structure is what the caching extension writes to disk.

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::buffers::{deserialize_buffers, serialize_buffers};
use crate::commands::Command;
use crate::notifications::{
    CellNotification, CellStatus, DataSourceConnection, DataTable, LogStatus, ModelMessage,
    Notification, PackageStatus, VariableDeclaration, VariableValue,
};
use crate::CellId;

/// Open state of one widget model, merged from its lifecycle messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelState {
    pub model_id: String,
    pub state: Map<String, Value>,
    #[serde(default)]
    pub buffer_paths: Vec<Vec<Value>>,
    #[serde(
        default,
        serialize_with = "serialize_buffers",
        deserialize_with = "deserialize_buffers"
    )]
    pub buffers: Vec<Bytes>,
}

impl ModelState {
    fn apply_update(&mut self, state: Map<String, Value>, buffer_paths: Vec<Vec<Value>>, buffers: Vec<Bytes>) {
        for (key, value) in state {
            let mut kept_paths = Vec::with_capacity(self.buffer_paths.len());
            let mut kept_buffers = Vec::with_capacity(self.buffers.len());
            for (path, buffer) in self.buffer_paths.drain(..).zip(self.buffers.drain(..)) {
                if path.first().and_then(Value::as_str) != Some(key.as_str()) {
                    kept_paths.push(path);
                    kept_buffers.push(buffer);
                }
            }
            self.buffer_paths = kept_paths;
            self.buffers = kept_buffers;
            self.state.insert(key, value);
        }
        self.buffer_paths.extend(buffer_paths);
        self.buffers.extend(buffers);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartupLog {
    pub content: String,
    pub status: LogStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackageLogs {
    pub packages: BTreeMap<String, PackageStatus>,
    pub logs: BTreeMap<String, String>,
    pub log_status: Option<LogStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionView {
    cell_notifications: BTreeMap<CellId, CellNotification>,
    /// First-seen order of `cell_notifications`.
    cell_order: Vec<CellId>,
    last_executed_code: BTreeMap<CellId, String>,
    /// Milliseconds spent in the last completed run of each cell.
    last_execution_time: BTreeMap<CellId, f64>,
    #[serde(skip)]
    running_since: HashMap<CellId, f64>,
    ui_values: BTreeMap<String, Value>,
    variables: Option<Vec<VariableDeclaration>>,
    variable_values: BTreeMap<String, VariableValue>,
    datasets: Option<Vec<DataTable>>,
    connections: Option<Vec<DataSourceConnection>>,
    cell_ids: Option<Vec<CellId>>,
    stale_codes: BTreeMap<CellId, String>,
    models: Vec<ModelState>,
    startup_logs: Option<StartupLog>,
    package_logs: Option<PackageLogs>,
}

impl SessionView {
    pub fn new() -> Self {
        Self::default()
    }

    /// True until the first notification or control request is recorded.
    pub fn is_empty(&self) -> bool {
        self.cell_notifications.is_empty()
            && self.last_executed_code.is_empty()
            && self.ui_values.is_empty()
            && self.variables.is_none()
            && self.variable_values.is_empty()
            && self.datasets.is_none()
            && self.connections.is_none()
            && self.cell_ids.is_none()
            && self.stale_codes.is_empty()
            && self.models.is_empty()
            && self.startup_logs.is_none()
            && self.package_logs.is_none()
    }

    // ─── Ingestion ───────────────────────────────────────────────────────

    /// Merge a notification into the view. Notifications with no lasting
    /// state (alerts, reload, request results) are ignored.
    pub fn add_notification(&mut self, notification: &Notification) {
        match notification {
            Notification::CellOp(cell) => self.add_cell_notification(cell),
            Notification::Variables { variables } => {
                self.variable_values
                    .retain(|name, _| variables.iter().any(|v| &v.name == name));
                self.variables = Some(variables.clone());
            }
            Notification::VariableValues { variables } => {
                for value in variables {
                    self.variable_values.insert(value.name.clone(), value.clone());
                }
            }
            Notification::Datasets {
                tables,
                clear_channel,
            } => {
                let datasets = self.datasets.get_or_insert_with(Vec::new);
                if let Some(source) = clear_channel {
                    datasets.retain(|table| &table.source != source);
                }
                for table in tables {
                    match datasets.iter_mut().find(|t| t.name == table.name) {
                        Some(existing) => *existing = table.clone(),
                        None => datasets.push(table.clone()),
                    }
                }
            }
            Notification::DataSourceConnections { connections } => {
                let known = self.connections.get_or_insert_with(Vec::new);
                for connection in connections {
                    match known.iter_mut().find(|c| c.name == connection.name) {
                        Some(existing) => *existing = connection.clone(),
                        None => known.push(connection.clone()),
                    }
                }
            }
            Notification::UpdateCellIds { cell_ids } => {
                self.cell_ids = Some(cell_ids.clone());
            }
            Notification::UpdateCellCodes {
                cell_ids,
                codes,
                code_is_stale,
            } => {
                for (cell_id, code) in cell_ids.iter().zip(codes) {
                    if *code_is_stale {
                        self.stale_codes.insert(cell_id.clone(), code.clone());
                    } else {
                        self.stale_codes.remove(cell_id);
                    }
                }
            }
            Notification::ModelLifecycle { model_id, message } => self.add_model_message(model_id, message),
            Notification::StartupLogs { content, status } => match (&mut self.startup_logs, status) {
                (Some(log), LogStatus::Append | LogStatus::Done) => {
                    log.content.push_str(content);
                    log.status = *status;
                }
                (slot, _) => {
                    *slot = Some(StartupLog {
                        content: content.clone(),
                        status: *status,
                    });
                }
            },
            Notification::InstallingPackageAlert {
                packages,
                logs,
                log_status,
            } => {
                let package_logs = self.package_logs.get_or_insert_with(PackageLogs::default);
                package_logs
                    .packages
                    .extend(packages.iter().map(|(name, status)| (name.clone(), *status)));
                for (name, chunk) in logs {
                    if *log_status == Some(LogStatus::Start) {
                        package_logs.logs.insert(name.clone(), chunk.clone());
                    } else {
                        package_logs.logs.entry(name.clone()).or_default().push_str(chunk);
                    }
                }
                if log_status.is_some() {
                    package_logs.log_status = *log_status;
                }
            }
            Notification::Reload
            | Notification::Reconnected
            | Notification::Alert { .. }
            | Notification::Banner { .. }
            | Notification::KernelReady(_)
            | Notification::CompletionResult { .. }
            | Notification::SecretKeysResult { .. }
            | Notification::FunctionCallResult { .. }
            | Notification::SqlTablePreview { .. }
            | Notification::SqlTableListPreview { .. }
            | Notification::DataColumnPreview { .. }
            | Notification::Interrupted
            | Notification::CompletedRun => {}
        }
    }

    fn add_cell_notification(&mut self, next: &CellNotification) {
        self.track_execution_time(next);

        let Some(previous) = self.cell_notifications.get_mut(&next.cell_id) else {
            self.cell_order.push(next.cell_id.clone());
            self.cell_notifications.insert(next.cell_id.clone(), next.clone());
            return;
        };

        let starts_run = next.status == Some(CellStatus::Running) && previous.status != Some(CellStatus::Running);
        if starts_run {
            previous.console = Some(next.console.clone().unwrap_or_default());
        } else if let Some(console) = &next.console {
            if console.is_empty() {
                previous.console = Some(Vec::new());
            } else {
                previous.console.get_or_insert_with(Vec::new).extend(console.iter().cloned());
            }
        }
        if next.status.is_some() {
            previous.status = next.status;
        }
        if next.output.is_some() {
            previous.output = next.output.clone();
        }
        if next.stale_inputs.is_some() {
            previous.stale_inputs = next.stale_inputs;
        }
        if next.run_id.is_some() {
            previous.run_id = next.run_id.clone();
        }
        previous.timestamp = next.timestamp;
    }

    fn track_execution_time(&mut self, next: &CellNotification) {
        match next.status {
            Some(CellStatus::Running) => {
                self.running_since.insert(next.cell_id.clone(), next.timestamp);
            }
            Some(CellStatus::Idle) => {
                if let Some(started) = self.running_since.remove(&next.cell_id) {
                    let elapsed_ms = ((next.timestamp - started) * 1000.0).max(0.0);
                    self.last_execution_time.insert(next.cell_id.clone(), elapsed_ms);
                }
            }
            _ => {}
        }
    }

    fn add_model_message(&mut self, model_id: &str, message: &ModelMessage) {
        match message {
            ModelMessage::Open {
                state,
                buffer_paths,
                buffers,
            } => {
                let opened = ModelState {
                    model_id: model_id.to_string(),
                    state: state.clone(),
                    buffer_paths: buffer_paths.clone(),
                    buffers: buffers.clone(),
                };
                match self.models.iter_mut().find(|m| m.model_id == model_id) {
                    Some(existing) => *existing = opened,
                    None => self.models.push(opened),
                }
            }
            ModelMessage::Update {
                state,
                buffer_paths,
                buffers,
            } => {
                if let Some(model) = self.models.iter_mut().find(|m| m.model_id == model_id) {
                    model.apply_update(state.clone(), buffer_paths.clone(), buffers.clone());
                }
            }
            ModelMessage::Custom { .. } => {}
            ModelMessage::Close => self.models.retain(|m| m.model_id != model_id),
        }
    }

    /// Record what a consumer asked the kernel to do, so reconnecting
    /// clients see current UI values and the code each cell last ran.
    pub fn add_control_request(&mut self, command: &Command) {
        match command {
            Command::ExecuteCells(execution) => {
                for (cell_id, code) in execution.iter() {
                    self.record_execution(cell_id, code);
                }
            }
            Command::CreateNotebook(create) => {
                for (cell_id, code) in create.execution.iter() {
                    self.record_execution(cell_id, code);
                }
                self.ui_values
                    .extend(create.ui_values.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            Command::UpdateUiElement(update) => {
                for (object_id, value) in update.iter() {
                    self.ui_values.insert(object_id.clone(), value.clone());
                }
            }
            Command::SyncGraph {
                cells,
                run_ids,
                delete_ids,
            } => {
                for cell_id in delete_ids {
                    self.remove_cell(cell_id);
                }
                for cell_id in run_ids {
                    if let Some(code) = cells.get(cell_id) {
                        self.record_execution(cell_id, code);
                    }
                }
            }
            Command::DeleteCell { cell_id } => self.remove_cell(cell_id),
            _ => {}
        }
    }

    fn record_execution(&mut self, cell_id: &CellId, code: &str) {
        self.last_executed_code.insert(cell_id.clone(), code.to_string());
        self.stale_codes.remove(cell_id);
    }

    fn remove_cell(&mut self, cell_id: &str) {
        self.cell_notifications.remove(cell_id);
        self.cell_order.retain(|id| id != cell_id);
        self.last_executed_code.remove(cell_id);
        self.last_execution_time.remove(cell_id);
        self.running_since.remove(cell_id);
        self.stale_codes.remove(cell_id);
    }

    /// Attach a submitted stdin response to the newest pending prompt.
    /// Returns false if no prompt is waiting.
    pub fn add_stdin(&mut self, text: &str) -> bool {
        for cell_id in self.cell_order.iter().rev() {
            let Some(console) = self
                .cell_notifications
                .get_mut(cell_id)
                .and_then(|cell| cell.console.as_mut())
            else {
                continue;
            };
            let pending = console
                .iter_mut()
                .rev()
                .find(|entry| entry.is_stdin() && entry.data.is_string());
            if let Some(entry) = pending {
                let prompt = entry.data.take();
                entry.data = json!({ "prompt": prompt, "response": text });
                return true;
            }
        }
        false
    }

    // ─── Accessors ───────────────────────────────────────────────────────

    pub fn cell_notification(&self, cell_id: &str) -> Option<&CellNotification> {
        self.cell_notifications.get(cell_id)
    }

    pub fn last_executed_code(&self) -> &BTreeMap<CellId, String> {
        &self.last_executed_code
    }

    pub fn last_execution_time(&self) -> &BTreeMap<CellId, f64> {
        &self.last_execution_time
    }

    pub fn ui_values(&self) -> &BTreeMap<String, Value> {
        &self.ui_values
    }

    pub fn variable_values(&self) -> &BTreeMap<String, VariableValue> {
        &self.variable_values
    }

    pub fn datasets(&self) -> &[DataTable] {
        self.datasets.as_deref().unwrap_or_default()
    }

    pub fn models(&self) -> &[ModelState] {
        &self.models
    }

    pub fn stale_codes(&self) -> &BTreeMap<CellId, String> {
        &self.stale_codes
    }

    pub fn startup_logs(&self) -> Option<&StartupLog> {
        self.startup_logs.as_ref()
    }

    pub fn package_logs(&self) -> Option<&PackageLogs> {
        self.package_logs.as_ref()
    }

    // ─── Replay ──────────────────────────────────────────────────────────

    /// The view as an ordered list of notifications. Structural state
    /// (cell order, variables, data) comes before cell output so the client
    /// can place outputs as they arrive.
    pub fn notifications(&self) -> Vec<Notification> {
        let mut out = Vec::new();

        if let Some(cell_ids) = &self.cell_ids {
            out.push(Notification::UpdateCellIds {
                cell_ids: cell_ids.clone(),
            });
        }
        if let Some(variables) = &self.variables {
            out.push(Notification::Variables {
                variables: variables.clone(),
            });
        }
        if !self.variable_values.is_empty() {
            out.push(Notification::VariableValues {
                variables: self.variable_values.values().cloned().collect(),
            });
        }
        if let Some(tables) = &self.datasets {
            out.push(Notification::Datasets {
                tables: tables.clone(),
                clear_channel: None,
            });
        }
        if let Some(connections) = &self.connections {
            out.push(Notification::DataSourceConnections {
                connections: connections.clone(),
            });
        }
        for model in &self.models {
            out.push(Notification::ModelLifecycle {
                model_id: model.model_id.clone(),
                message: ModelMessage::Open {
                    state: model.state.clone(),
                    buffer_paths: model.buffer_paths.clone(),
                    buffers: model.buffers.clone(),
                },
            });
        }
        for cell_id in &self.cell_order {
            if let Some(cell) = self.cell_notifications.get(cell_id) {
                out.push(Notification::CellOp(cell.clone()));
            }
        }
        if !self.stale_codes.is_empty() {
            let (cell_ids, codes) = self
                .stale_codes
                .iter()
                .map(|(id, code)| (id.clone(), code.clone()))
                .unzip();
            out.push(Notification::UpdateCellCodes {
                cell_ids,
                codes,
                code_is_stale: true,
            });
        }
        if let Some(log) = &self.startup_logs {
            out.push(Notification::StartupLogs {
                content: log.content.clone(),
                status: log.status,
            });
        }
        if let Some(package_logs) = &self.package_logs {
            out.push(Notification::InstallingPackageAlert {
                packages: package_logs.packages.clone(),
                logs: package_logs.logs.clone(),
                log_status: package_logs.log_status,
            });
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::UpdateUiElement;
    use crate::notifications::CellOutput;

    fn cell(cell_id: &str, timestamp: f64) -> CellNotification {
        CellNotification {
            timestamp,
            ..CellNotification::new(cell_id)
        }
    }

    fn op(cell: CellNotification) -> Notification {
        Notification::CellOp(cell)
    }

    #[test]
    fn test_cell_merge_keeps_missing_fields() {
        let mut view = SessionView::new();
        view.add_notification(&op(cell("c1", 1.0)
            .with_status(CellStatus::Idle)
            .with_output(CellOutput::new("output", "text/plain", json!("2")))));
        view.add_notification(&op(cell("c1", 2.0).with_status(CellStatus::Queued)));

        let merged = view.cell_notification("c1").unwrap();
        assert_eq!(merged.status, Some(CellStatus::Queued));
        assert_eq!(merged.output.as_ref().unwrap().data, json!("2"));
        assert_eq!(view.notifications().len(), 1);
    }

    #[test]
    fn test_console_appends_and_resets_on_run() {
        let mut view = SessionView::new();
        view.add_notification(&op(cell("c1", 1.0)
            .with_status(CellStatus::Running)
            .with_console(vec![CellOutput::stdout("a")])));
        view.add_notification(&op(cell("c1", 1.5).with_console(vec![CellOutput::stdout("b")])));
        assert_eq!(view.cell_notification("c1").unwrap().console.as_ref().unwrap().len(), 2);

        view.add_notification(&op(cell("c1", 2.0).with_status(CellStatus::Idle)));
        view.add_notification(&op(cell("c1", 3.0).with_status(CellStatus::Running)));
        assert!(view.cell_notification("c1").unwrap().console.as_ref().unwrap().is_empty());

        view.add_notification(&op(cell("c1", 3.5).with_console(vec![CellOutput::stdout("c")])));
        view.add_notification(&op(cell("c1", 4.0).with_console(vec![])));
        assert!(view.cell_notification("c1").unwrap().console.as_ref().unwrap().is_empty());
    }

    #[test]
    fn test_execution_time_in_millis() {
        let mut view = SessionView::new();
        view.add_notification(&op(cell("c1", 10.0).with_status(CellStatus::Running)));
        view.add_notification(&op(cell("c1", 10.25).with_status(CellStatus::Idle)));
        assert_eq!(view.last_execution_time()["c1"], 250.0);
    }

    #[test]
    fn test_variables_prune_values() {
        let mut view = SessionView::new();
        view.add_notification(&Notification::VariableValues {
            variables: vec![
                VariableValue {
                    name: "x".into(),
                    value: Some("1".into()),
                    datatype: Some("int".into()),
                },
                VariableValue {
                    name: "y".into(),
                    value: Some("2".into()),
                    datatype: None,
                },
            ],
        });
        view.add_notification(&Notification::Variables {
            variables: vec![VariableDeclaration {
                name: "x".into(),
                declared_by: vec!["c1".into()],
                used_by: vec![],
            }],
        });
        assert_eq!(view.variable_values().keys().collect::<Vec<_>>(), vec!["x"]);
    }

    #[test]
    fn test_datasets_merge_by_name_and_clear_channel() {
        let table = |name: &str, source: &str, rows: u64| DataTable {
            name: name.into(),
            source: source.into(),
            source_type: "local".into(),
            num_rows: Some(rows),
            columns: vec![],
        };
        let mut view = SessionView::new();
        view.add_notification(&Notification::Datasets {
            tables: vec![table("a", "memory", 1), table("b", "duckdb", 1)],
            clear_channel: None,
        });
        view.add_notification(&Notification::Datasets {
            tables: vec![table("a", "memory", 5)],
            clear_channel: None,
        });
        assert_eq!(view.datasets().len(), 2);
        assert_eq!(view.datasets()[0].num_rows, Some(5));

        view.add_notification(&Notification::Datasets {
            tables: vec![],
            clear_channel: Some("duckdb".into()),
        });
        assert_eq!(view.datasets().len(), 1);
    }

    #[test]
    fn test_model_lifecycle() {
        let mut view = SessionView::new();
        let mut state = Map::new();
        state.insert("value".into(), json!(1));
        state.insert("data".into(), Value::Null);
        view.add_notification(&Notification::ModelLifecycle {
            model_id: "m1".into(),
            message: ModelMessage::Open {
                state,
                buffer_paths: vec![vec![json!("data")]],
                buffers: vec![Bytes::from_static(b"b1")],
            },
        });

        let mut update = Map::new();
        update.insert("data".into(), Value::Null);
        view.add_notification(&Notification::ModelLifecycle {
            model_id: "m1".into(),
            message: ModelMessage::Update {
                state: update,
                buffer_paths: vec![vec![json!("data")]],
                buffers: vec![Bytes::from_static(b"b2")],
            },
        });
        let model = &view.models()[0];
        assert_eq!(model.buffers, vec![Bytes::from_static(b"b2")]);
        assert_eq!(model.state["value"], json!(1));

        view.add_notification(&Notification::ModelLifecycle {
            model_id: "m1".into(),
            message: ModelMessage::Close,
        });
        assert!(view.models().is_empty());
    }

    #[test]
    fn test_control_requests() {
        let mut view = SessionView::new();
        view.add_notification(&Notification::UpdateCellCodes {
            cell_ids: vec!["c1".into()],
            codes: vec!["x = 2".into()],
            code_is_stale: true,
        });
        view.add_control_request(&Command::execute_cells(vec!["c1".into()], vec!["x = 2".into()]).unwrap());
        view.add_control_request(&Command::UpdateUiElement(UpdateUiElement::from_pairs(
            vec![("slider".into(), json!(3))],
            "t1",
        )));
        assert_eq!(view.last_executed_code()["c1"], "x = 2");
        assert!(view.stale_codes().is_empty());
        assert_eq!(view.ui_values()["slider"], json!(3));

        view.add_control_request(&Command::DeleteCell { cell_id: "c1".into() });
        assert!(view.last_executed_code().is_empty());
    }

    #[test]
    fn test_stdin_response_fills_latest_prompt() {
        let mut view = SessionView::new();
        view.add_notification(&op(cell("c1", 1.0)
            .with_status(CellStatus::Running)
            .with_console(vec![CellOutput::stdin_prompt("name? ")])));
        assert!(view.add_stdin("ada"));
        assert!(!view.add_stdin("again"));

        let console = view.cell_notification("c1").unwrap().console.clone().unwrap();
        assert_eq!(console[0].data, json!({"prompt": "name? ", "response": "ada"}));
    }

    #[test]
    fn test_logs_accumulate() {
        let mut view = SessionView::new();
        view.add_notification(&Notification::StartupLogs {
            content: "a".into(),
            status: LogStatus::Start,
        });
        view.add_notification(&Notification::StartupLogs {
            content: "b".into(),
            status: LogStatus::Done,
        });
        assert_eq!(view.startup_logs().unwrap().content, "ab");

        let alert = |status, chunk: &str, log_status| Notification::InstallingPackageAlert {
            packages: BTreeMap::from([("numpy".to_string(), status)]),
            logs: BTreeMap::from([("numpy".to_string(), chunk.to_string())]),
            log_status: Some(log_status),
        };
        view.add_notification(&alert(PackageStatus::Installing, "get ", LogStatus::Start));
        view.add_notification(&alert(PackageStatus::Installed, "done", LogStatus::Done));
        let logs = view.package_logs().unwrap();
        assert_eq!(logs.logs["numpy"], "get done");
        assert_eq!(logs.packages["numpy"], PackageStatus::Installed);
    }

    #[test]
    fn test_replay_order_and_persistence() {
        let mut view = SessionView::new();
        assert!(view.is_empty());
        view.add_notification(&op(cell("c1", 1.0).with_status(CellStatus::Idle)));
        view.add_notification(&Notification::UpdateCellIds {
            cell_ids: vec!["c1".into()],
        });
        view.add_notification(&Notification::alert("ignored", "not replayed"));
        assert!(!view.is_empty());

        let ops: Vec<_> = view.notifications().iter().map(Notification::op).collect();
        assert_eq!(ops, vec!["update_cell_ids", "cell_op"]);

        let json = serde_json::to_string(&view).unwrap();
        let restored: SessionView = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, view);
    }
}
