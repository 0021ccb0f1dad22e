//! The session aggregate.
//!
//! A [`Session`] owns one kernel, its queue set, a room of consumers, the
//! session view and the event bus. Everything else (forwarding commands to
//! the kernel, distributing kernel output, caching, heartbeats) is an
//! extension hung off the bus.
//!
//! Lock order inside a session: delivery, then view, then room, then the
//! file manager. Event listeners run with no session lock held, except
//! `on_notification_sent`, which runs under the delivery lock.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::{debug, error, info, warn};
use serde_json::Value;

use crate::commands::{Command, CreateNotebook, ExecuteCells, UpdateUiElement};
use crate::config::ConfigManager;
use crate::consumer::SessionConsumer;
use crate::error::SessionError;
use crate::events::{SessionEventBus, SessionEventListener};
use crate::extensions::SessionExtension;
use crate::file_manager::{CellSource, NotebookFileManager};
use crate::kernel::{KernelLaunchInfo, KernelLauncher, KernelManager};
use crate::notifications::{KernelReady, Notification, SerializedNotification};
use crate::queues::QueueManager;
use crate::room::Room;
use crate::session_view::SessionView;
use crate::{lock, CellId, ConnectionState, ConsumerId, FileKey, KernelState, SessionId, SessionMode};

/// Weak back-reference handed to extensions. Extensions must not keep a
/// session alive.
#[derive(Clone)]
pub struct SessionHandle(Weak<Session>);

impl SessionHandle {
    pub fn get(&self) -> Option<Arc<Session>> {
        self.0.upgrade()
    }
}

/// Everything needed to start a session.
pub struct SessionParams {
    pub session_id: SessionId,
    pub file_key: FileKey,
    pub mode: SessionMode,
    pub file_manager: Box<dyn NotebookFileManager>,
    pub launcher: Arc<dyn KernelLauncher>,
    pub config: Arc<dyn ConfigManager>,
    pub query_params: BTreeMap<String, String>,
    pub user_config: Value,
    /// Attached in order after the kernel starts.
    pub extensions: Vec<Arc<dyn SessionExtension>>,
    /// Subscribed before any extension attaches.
    pub listeners: Vec<Arc<dyn SessionEventListener>>,
}

/// Initial UI state for [`Session::instantiate`].
#[derive(Debug, Clone, Default)]
pub struct InstantiateRequest {
    pub object_ids: Vec<String>,
    pub values: Vec<Value>,
    pub auto_run: bool,
}

enum ExtensionEntry {
    Extension(Arc<dyn SessionExtension>),
    Consumer(Arc<dyn SessionConsumer>),
}

impl ExtensionEntry {
    fn name(&self) -> &'static str {
        match self {
            ExtensionEntry::Extension(extension) => extension.name(),
            ExtensionEntry::Consumer(consumer) => consumer.name(),
        }
    }

    fn detach(&self) -> anyhow::Result<()> {
        match self {
            ExtensionEntry::Extension(extension) => extension.on_detach(),
            ExtensionEntry::Consumer(consumer) => consumer.on_detach(),
        }
    }

    fn is_consumer(&self, consumer_id: &str) -> bool {
        matches!(self, ExtensionEntry::Consumer(c) if c.consumer_id() == consumer_id)
    }
}

pub struct Session {
    self_ref: Weak<Session>,
    initialization_id: String,
    session_id: Mutex<SessionId>,
    mode: SessionMode,
    file_key: FileKey,
    kernel: Arc<dyn KernelManager>,
    queues: Arc<QueueManager>,
    room: Mutex<Room>,
    /// Serializes broadcasts against consumer attachment, so a new consumer
    /// sees the view replay and then every later notification exactly once.
    delivery: Mutex<()>,
    view: Mutex<SessionView>,
    extensions: Mutex<Vec<ExtensionEntry>>,
    bus: Arc<SessionEventBus>,
    file_manager: Mutex<Box<dyn NotebookFileManager>>,
    config: Arc<dyn ConfigManager>,
    closed: AtomicBool,
}

impl Session {
    /// Start the kernel, then build the session and attach `extensions`.
    /// Fails if the kernel cannot be started; nothing is left running in
    /// that case.
    pub async fn start(params: SessionParams) -> Result<Arc<Session>, SessionError> {
        let SessionParams {
            session_id,
            file_key,
            mode,
            file_manager,
            launcher,
            config,
            query_params,
            user_config,
            extensions,
            listeners,
        } = params;

        let launch = KernelLaunchInfo {
            mode,
            file_key: file_key.clone(),
            filename: file_manager.filename(),
            cell_configs: file_manager
                .cells()
                .into_iter()
                .map(|cell| (cell.cell_id, cell.config))
                .collect(),
            query_params,
            user_config,
        };
        let launched = launcher.launch(launch).await?;

        let bus = Arc::new(SessionEventBus::new());
        for listener in listeners {
            bus.subscribe(listener);
        }

        let initialization_id =
            uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_URL, file_key.as_bytes()).to_string();
        let session = Arc::new_cyclic(|self_ref| Session {
            self_ref: self_ref.clone(),
            initialization_id,
            session_id: Mutex::new(session_id),
            mode,
            file_key,
            kernel: launched.manager,
            queues: launched.queues,
            room: Mutex::new(Room::new()),
            delivery: Mutex::new(()),
            view: Mutex::new(SessionView::new()),
            extensions: Mutex::new(Vec::new()),
            bus,
            file_manager: Mutex::new(file_manager),
            config,
            closed: AtomicBool::new(false),
        });

        for extension in extensions {
            session.attach_extension(extension);
        }
        info!(
            "[session] Started session {} for {} ({} mode, kernel {})",
            session.session_id(),
            session.file_key,
            mode,
            session.kernel_state()
        );
        Ok(session)
    }

    /// Attach an extension. A failing attach is logged and the extension is
    /// dropped; the session carries on without it.
    pub fn attach_extension(&self, extension: Arc<dyn SessionExtension>) {
        let name = extension.name();
        match extension.clone().on_attach(self.handle(), self.bus.clone()) {
            Ok(()) => {
                debug!("[session] Attached extension {}", name);
                lock(&self.extensions).push(ExtensionEntry::Extension(extension));
            }
            Err(e) => error!("[session] Extension {} failed to attach: {:#}", name, e),
        }
    }

    // ─── Identity ────────────────────────────────────────────────────────

    pub fn session_id(&self) -> SessionId {
        lock(&self.session_id).clone()
    }

    /// Rewrite the session id. Only the repository should call this, as
    /// part of a rename.
    pub fn set_session_id(&self, session_id: SessionId) {
        *lock(&self.session_id) = session_id;
    }

    /// Stable across resumes; derived from the file key.
    pub fn initialization_id(&self) -> &str {
        &self.initialization_id
    }

    pub fn file_key(&self) -> &str {
        &self.file_key
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle(self.self_ref.clone())
    }

    pub fn bus(&self) -> Arc<SessionEventBus> {
        self.bus.clone()
    }

    pub fn queues(&self) -> Arc<QueueManager> {
        self.queues.clone()
    }

    pub fn config(&self) -> Arc<dyn ConfigManager> {
        self.config.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn extension_names(&self) -> Vec<&'static str> {
        lock(&self.extensions).iter().map(ExtensionEntry::name).collect()
    }

    // ─── Commands ────────────────────────────────────────────────────────

    /// Hand a command to the kernel. Returns immediately; effects arrive
    /// later as notifications.
    pub fn put_control_request(&self, command: Command, from_consumer_id: Option<&str>) {
        if self.is_closed() {
            warn!("[session] Dropping {} for closed session", command.kind());
            return;
        }
        self.bus.emit("received_command", |listener| {
            listener.on_received_command(self, &command, from_consumer_id)
        });
    }

    /// Answer a pending stdin prompt.
    pub fn put_input(&self, text: &str) {
        if self.is_closed() {
            return;
        }
        self.bus
            .emit("received_stdin", |listener| listener.on_received_stdin(self, text));
    }

    /// Submit the bootstrap command: every cell, plus the UI values the
    /// frontend already holds.
    pub fn instantiate(&self, request: InstantiateRequest) -> Result<(), SessionError> {
        let ui = UpdateUiElement::new(request.object_ids, request.values)?;
        let (cell_ids, codes) = self
            .cells()
            .into_iter()
            .map(|cell| (cell.cell_id, cell.code))
            .unzip();
        let execution = ExecuteCells::new(cell_ids, codes)?;
        info!(
            "[session] Instantiating {} cells (auto_run: {})",
            execution.cell_ids().len(),
            request.auto_run
        );
        self.put_control_request(
            Command::CreateNotebook(CreateNotebook {
                execution,
                ui_values: ui.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                auto_run: request.auto_run,
            }),
            None,
        );
        Ok(())
    }

    // ─── Consumers ───────────────────────────────────────────────────────

    /// Attach a consumer. It first receives the kernel-ready bootstrap and a
    /// replay of the view, then joins the room.
    pub fn connect_consumer(
        &self,
        consumer: Arc<dyn SessionConsumer>,
        main: bool,
    ) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        let consumer_id = consumer.consumer_id();
        {
            let _delivery = lock(&self.delivery);
            lock(&self.room).check_can_add(&consumer_id, main)?;

            consumer
                .clone()
                .on_attach(self.handle(), self.bus.clone())
                .map_err(|source| SessionError::Extension {
                    name: consumer.name(),
                    source,
                })?;

            let (ready, replay) = {
                let view = lock(&self.view);
                let ready = self.kernel_ready_from(&view, !view.is_empty(), consumer.is_kiosk());
                (ready, view.notifications())
            };
            for notification in std::iter::once(Notification::KernelReady(ready)).chain(replay) {
                match SerializedNotification::new(&notification) {
                    Ok(serialized) => consumer.notify(&serialized),
                    Err(e) => warn!("[session] Failed to serialize {}: {}", notification.op(), e),
                }
            }

            lock(&self.room).add_consumer(consumer.clone(), main)?;
            lock(&self.extensions).push(ExtensionEntry::Consumer(consumer));
        }

        info!(
            "[session] Consumer {} connected to {} (main: {})",
            consumer_id,
            self.session_id(),
            main
        );
        self.bus.emit("consumer_attached", |listener| {
            listener.on_consumer_attached(self, &consumer_id, main)
        });
        Ok(())
    }

    /// Detach a consumer. Returns false if it was not attached.
    pub fn disconnect_consumer(&self, consumer_id: &str) -> bool {
        let removed = lock(&self.room).remove_consumer(consumer_id).is_some();
        lock(&self.extensions).retain(|entry| !entry.is_consumer(consumer_id));
        if removed {
            info!("[session] Consumer {} disconnected from {}", consumer_id, self.session_id());
            self.bus.emit("consumer_detached", |listener| {
                listener.on_consumer_detached(self, consumer_id)
            });
        }
        removed
    }

    /// Detach the main consumer, leaving the session orphaned.
    pub fn disconnect_main_consumer(&self) -> Option<ConsumerId> {
        let main = lock(&self.room).main_consumer_id().map(str::to_string)?;
        self.disconnect_consumer(&main);
        Some(main)
    }

    pub fn main_consumer_id(&self) -> Option<ConsumerId> {
        lock(&self.room).main_consumer_id().map(str::to_string)
    }

    pub fn consumer_ids(&self) -> Vec<ConsumerId> {
        lock(&self.room).consumer_ids()
    }

    pub fn has_consumer(&self, consumer_id: &str) -> bool {
        lock(&self.room).contains(consumer_id)
    }

    /// OPEN/CONNECTING follow the main consumer; no main consumer means
    /// ORPHANED; CLOSED is terminal.
    pub fn connection_state(&self) -> ConnectionState {
        if self.is_closed() {
            return ConnectionState::Closed;
        }
        match lock(&self.room).main_consumer() {
            Some(main) => match main.connection_state() {
                ConnectionState::Closed => ConnectionState::Orphaned,
                state => state,
            },
            None => ConnectionState::Orphaned,
        }
    }

    // ─── Notifications ───────────────────────────────────────────────────

    /// Broadcast to the room, skipping `from_consumer_id`, then fire the
    /// notification-sent event once.
    pub fn notify(&self, notification: Notification, from_consumer_id: Option<&str>) {
        if self.is_closed() {
            debug!("[session] Dropping {} for closed session", notification.op());
            return;
        }
        let serialized = match SerializedNotification::new(&notification) {
            Ok(serialized) => serialized,
            Err(e) => {
                warn!("[session] Failed to serialize {}: {}", notification.op(), e);
                return;
            }
        };

        let _delivery = lock(&self.delivery);
        lock(&self.room).broadcast(&serialized, from_consumer_id);
        self.bus.emit("notification_sent", |listener| {
            listener.on_notification_sent(self, &notification)
        });
    }

    /// Send to a single consumer without touching the view.
    pub fn send_to(&self, consumer_id: &str, notification: &Notification) -> bool {
        match SerializedNotification::new(notification) {
            Ok(serialized) => {
                let _delivery = lock(&self.delivery);
                lock(&self.room).send_to(consumer_id, &serialized)
            }
            Err(e) => {
                warn!("[session] Failed to serialize {}: {}", notification.op(), e);
                false
            }
        }
    }

    /// Replay the view to every open consumer.
    pub fn broadcast_view(&self) {
        let _delivery = lock(&self.delivery);
        let replay = lock(&self.view).notifications();
        let room = lock(&self.room);
        for notification in replay {
            match SerializedNotification::new(&notification) {
                Ok(serialized) => {
                    room.broadcast(&serialized, None);
                }
                Err(e) => warn!("[session] Failed to serialize {}: {}", notification.op(), e),
            }
        }
    }

    // ─── View ────────────────────────────────────────────────────────────

    pub fn view_snapshot(&self) -> SessionView {
        lock(&self.view).clone()
    }

    pub fn update_view<R>(&self, f: impl FnOnce(&mut SessionView) -> R) -> R {
        f(&mut *lock(&self.view))
    }

    /// Swap in a whole view (cache restore) and tell listeners.
    pub fn replace_view(&self, view: SessionView) {
        *lock(&self.view) = view;
        self.bus
            .emit("view_replaced", |listener| listener.on_view_replaced(self));
    }

    /// Bootstrap payload for a consumer.
    pub fn kernel_ready(&self, resumed: bool, kiosk: bool) -> KernelReady {
        let view = lock(&self.view);
        self.kernel_ready_from(&view, resumed, kiosk)
    }

    fn kernel_ready_from(&self, view: &SessionView, resumed: bool, kiosk: bool) -> KernelReady {
        let (cells, layout) = self.with_file_manager(|fm| (fm.cells(), fm.read_layout_config()));
        let mut ready = KernelReady {
            layout,
            resumed,
            ui_values: view.ui_values().clone(),
            last_executed_code: view.last_executed_code().clone(),
            last_execution_time: view.last_execution_time().clone(),
            kiosk,
            capabilities: BTreeMap::from([
                ("interrupt".to_string(), self.mode == SessionMode::Edit),
                ("stdin".to_string(), true),
            ]),
            ..KernelReady::default()
        };
        for cell in cells {
            ready.cell_ids.push(cell.cell_id);
            ready.codes.push(cell.code);
            ready.names.push(cell.name);
            ready.configs.push(cell.config);
        }
        ready
    }

    // ─── Notebook file ───────────────────────────────────────────────────

    pub fn with_file_manager<R>(&self, f: impl FnOnce(&mut dyn NotebookFileManager) -> R) -> R {
        let mut file_manager = lock(&self.file_manager);
        f(&mut **file_manager)
    }

    pub fn cells(&self) -> Vec<CellSource> {
        self.with_file_manager(|fm| fm.cells())
    }

    pub fn notebook_path(&self) -> Option<PathBuf> {
        self.with_file_manager(|fm| fm.path())
    }

    pub fn save_notebook(&self, contents: &str) -> Result<(), SessionError> {
        self.with_file_manager(|fm| fm.save(contents))
            .map_err(SessionError::FileManager)
    }

    pub fn reload_notebook(&self) -> anyhow::Result<HashSet<CellId>> {
        self.with_file_manager(|fm| fm.reload())
    }

    /// Point the session at a new file path and let extensions re-point.
    pub fn rename_path(&self, new_path: &Path) -> Result<(), SessionError> {
        let (old_path, filename) = self.with_file_manager(|fm| {
            let old_path = fm.path();
            fm.rename(new_path).map(|()| (old_path, fm.filename()))
        })
        .map_err(SessionError::FileManager)?;

        info!("[session] Renamed notebook to {}", new_path.display());
        if let Some(filename) = filename {
            self.put_control_request(Command::Rename { filename }, None);
        }
        self.bus.emit("notebook_renamed", |listener| {
            listener.on_notebook_renamed(self, old_path.as_deref())
        });
        Ok(())
    }

    // ─── Kernel ──────────────────────────────────────────────────────────

    pub fn try_interrupt(&self) {
        self.kernel.interrupt_kernel();
    }

    pub fn kernel_state(&self) -> KernelState {
        self.kernel.kernel_state()
    }

    pub fn is_kernel_alive(&self) -> bool {
        self.kernel.is_alive()
    }

    pub fn kernel_pid(&self) -> Option<u32> {
        self.kernel.pid()
    }

    // ─── Teardown ────────────────────────────────────────────────────────

    /// Detach every extension, clear the room and shut the kernel down.
    /// Safe to call more than once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("[session] Closing session {}", self.session_id());

        let entries = std::mem::take(&mut *lock(&self.extensions));
        for entry in &entries {
            if let Err(e) = entry.detach() {
                warn!("[session] Extension {} failed to detach: {:#}", entry.name(), e);
            }
        }
        lock(&self.room).close();
        self.kernel.close_kernel();

        self.bus
            .emit("session_closed", |listener| listener.on_session_closed(self));
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            debug!("[session] Session {} dropped without close", self.file_key);
            self.kernel.close_kernel();
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::consumer::{ChannelConsumer, ReplayCaptureConsumer};
    use crate::notifications::CellNotification;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Recorder {
        commands: Mutex<Vec<String>>,
        sent: AtomicUsize,
        closed: AtomicUsize,
        renamed: Mutex<Option<PathBuf>>,
    }

    impl SessionEventListener for Recorder {
        fn on_received_command(
            &self,
            _session: &Session,
            command: &Command,
            _from: Option<&str>,
        ) -> anyhow::Result<()> {
            lock(&self.commands).push(command.kind().to_string());
            Ok(())
        }

        fn on_notification_sent(&self, _session: &Session, _n: &Notification) -> anyhow::Result<()> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn on_session_closed(&self, _session: &Session) -> anyhow::Result<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn on_notebook_renamed(&self, _session: &Session, old: Option<&Path>) -> anyhow::Result<()> {
            *lock(&self.renamed) = old.map(Path::to_path_buf);
            Ok(())
        }
    }

    async fn session_with(recorder: Arc<Recorder>) -> (Arc<Session>, Arc<FakeLauncher>) {
        let launcher = FakeLauncher::new();
        let mut params = params(launcher.clone(), SessionMode::Edit);
        params.listeners.push(recorder);
        (Session::start(params).await.unwrap(), launcher)
    }

    #[tokio::test]
    async fn test_kernel_ready_is_first_message() {
        let (session, _) = session_with(Arc::new(Recorder::default())).await;
        let capture = ReplayCaptureConsumer::new("main");
        session.connect_consumer(capture.clone(), true).unwrap();

        let captured = capture.captured();
        let Notification::KernelReady(ready) = &captured[0] else {
            panic!("expected kernel_ready first, got {:?}", captured[0]);
        };
        assert_eq!(ready.cell_ids, vec!["c1", "c2"]);
        assert_eq!(ready.codes, vec!["x = 1", "y = x + 1"]);
        assert!(!ready.resumed);
        assert_eq!(session.connection_state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn test_second_main_consumer_rejected() {
        let (session, _) = session_with(Arc::new(Recorder::default())).await;
        let (a, _rx_a) = ChannelConsumer::new("a");
        let (b, _rx_b) = ChannelConsumer::new("b");
        session.connect_consumer(a, true).unwrap();
        let err = session.connect_consumer(b.clone(), true).unwrap_err();
        assert!(matches!(err, SessionError::MainConsumerExists(_)));
        // the rejected consumer was never attached
        assert_eq!(b.connection_state(), ConnectionState::Open);
        assert_eq!(session.consumer_ids(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_notify_excludes_sender_and_fires_once() {
        let recorder = Arc::new(Recorder::default());
        let (session, _) = session_with(recorder.clone()).await;
        let (main, mut rx_main) = ChannelConsumer::new("main");
        let (kiosk, mut rx_kiosk) = ChannelConsumer::kiosk("kiosk");
        session.connect_consumer(main, true).unwrap();
        session.connect_consumer(kiosk, false).unwrap();
        assert_eq!(rx_main.try_recv().unwrap().op, "kernel_ready");
        assert_eq!(rx_kiosk.try_recv().unwrap().op, "kernel_ready");

        session.notify(Notification::Reload, Some("main"));
        assert!(rx_main.try_recv().is_err());
        assert_eq!(rx_kiosk.try_recv().unwrap().op, "reload");
        assert_eq!(recorder.sent.load(Ordering::SeqCst), 1);

        session.notify(Notification::Interrupted, None);
        assert_eq!(rx_main.try_recv().unwrap().op, "interrupted");
        assert_eq!(rx_kiosk.try_recv().unwrap().op, "interrupted");
    }

    #[tokio::test]
    async fn test_orphaned_after_main_disconnect() {
        let (session, _) = session_with(Arc::new(Recorder::default())).await;
        assert_eq!(session.connection_state(), ConnectionState::Orphaned);
        assert!(session.disconnect_main_consumer().is_none());

        let (main, _rx) = ChannelConsumer::new("main");
        session.connect_consumer(main.clone(), true).unwrap();
        assert_eq!(session.disconnect_main_consumer().as_deref(), Some("main"));
        assert_eq!(main.connection_state(), ConnectionState::Closed);
        assert_eq!(session.connection_state(), ConnectionState::Orphaned);
        assert!(!session.disconnect_consumer("main"));
    }

    #[tokio::test]
    async fn test_replay_on_connect() {
        let (session, _) = session_with(Arc::new(Recorder::default())).await;
        session.update_view(|view| {
            view.add_notification(&Notification::CellOp(CellNotification::new("c1")));
        });

        let capture = ReplayCaptureConsumer::new("late");
        session.connect_consumer(capture.clone(), false).unwrap();
        assert_eq!(capture.ops(), vec!["kernel_ready", "cell_op"]);
        let Notification::KernelReady(ready) = &capture.captured()[0] else {
            panic!("expected kernel_ready");
        };
        assert!(ready.resumed);
    }

    #[tokio::test]
    async fn test_instantiate_and_validation() {
        let recorder = Arc::new(Recorder::default());
        let (session, _) = session_with(recorder.clone()).await;
        session
            .instantiate(InstantiateRequest {
                object_ids: vec!["slider".into()],
                values: vec![json!(1)],
                auto_run: true,
            })
            .unwrap();
        assert_eq!(*lock(&recorder.commands), vec!["create_notebook"]);

        let err = session
            .instantiate(InstantiateRequest {
                object_ids: vec!["slider".into()],
                values: vec![],
                auto_run: true,
            })
            .unwrap_err();
        assert!(matches!(err, SessionError::Command(_)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let recorder = Arc::new(Recorder::default());
        let (session, launcher) = session_with(recorder.clone()).await;
        let (main, _rx) = ChannelConsumer::new("main");
        session.connect_consumer(main.clone(), true).unwrap();

        session.close();
        session.close();
        assert_eq!(recorder.closed.load(Ordering::SeqCst), 1);
        assert_eq!(launcher.kernel.closes.load(Ordering::SeqCst), 1);
        assert_eq!(main.connection_state(), ConnectionState::Closed);
        assert_eq!(session.connection_state(), ConnectionState::Closed);
        assert!(session.extension_names().is_empty());

        session.put_control_request(Command::ExecuteStaleCells, None);
        assert!(lock(&recorder.commands).is_empty());
        let (late, _rx) = ChannelConsumer::new("late");
        assert!(matches!(session.connect_consumer(late, false), Err(SessionError::Closed)));
    }

    #[tokio::test]
    async fn test_rename_path() {
        let recorder = Arc::new(Recorder::default());
        let (session, _) = session_with(recorder.clone()).await;
        session.rename_path(Path::new("/notebooks/renamed.py")).unwrap();

        assert_eq!(session.notebook_path(), Some(PathBuf::from("/notebooks/renamed.py")));
        assert_eq!(*lock(&recorder.commands), vec!["rename"]);
        assert_eq!(
            lock(&recorder.renamed).as_deref(),
            Some(Path::new("/notebooks/nb.py"))
        );
    }

    #[tokio::test]
    async fn test_identity() {
        let (session, launcher) = session_with(Arc::new(Recorder::default())).await;
        let expected = uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_URL, b"/notebooks/nb.py").to_string();
        assert_eq!(session.initialization_id(), expected);

        session.set_session_id("s2".into());
        assert_eq!(session.session_id(), "s2");
        assert_eq!(session.initialization_id(), expected);

        session.try_interrupt();
        assert_eq!(launcher.kernel.interrupts.load(Ordering::SeqCst), 1);
        assert!(session.is_kernel_alive());
        assert_eq!(session.kernel_state(), KernelState::Running);
    }
}
