//! Top-level session orchestration.
//!
//! The [`SessionManager`] is what a transport talks to. A typical
//! connection runs:
//!
//! 1. [`SessionManager::check_can_connect`] to refuse a second editor,
//! 2. [`SessionManager::maybe_resume_session`] to take over an orphaned
//!    session if there is one,
//! 3. [`SessionManager::create_session`], which attaches the consumer to
//!    the resumed session or starts a new one,
//! 4. [`SessionManager::release_main_consumer`] when the socket closes.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{error, info, warn};
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::config::ConfigManager;
use crate::consumer::SessionConsumer;
use crate::error::SessionError;
use crate::events::SessionEventListener;
use crate::extensions::{caching_extension, default_extensions, file_watcher_extension};
use crate::file_change::FileChangeCoordinator;
use crate::file_manager::NotebookResolver;
use crate::kernel::KernelLauncher;
use crate::repository::SessionRepository;
use crate::resume::{strategy_for_mode, ResumeStrategy};
use crate::session::{InstantiateRequest, Session, SessionParams};
use crate::token::TokenManager;
use crate::watcher::{FileWatcher, FileWatcherManager};
use crate::{
    default_session_cache_dir, lock, CloseCode, ConnectionState, ConsumerId, FileKey, SessionId,
    SessionMode,
};

/// Session manager configuration.
#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    pub mode: SessionMode,
    /// Watch notebook files and react to external edits.
    pub watch: bool,
    /// Directory for persisted session views.
    pub cache_dir: PathBuf,
    /// Passed through to every kernel.
    pub user_config: Value,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            mode: SessionMode::Edit,
            watch: false,
            cache_dir: default_session_cache_dir(),
            user_config: Value::Null,
        }
    }
}

/// A side process shared by all sessions (for example a language server),
/// stopped when the manager shuts down.
pub trait AuxiliaryServer: Send + Sync {
    fn name(&self) -> &'static str;

    fn stop(&self);
}

/// Drops a session from the repository when it closes, whoever closed it.
struct RepositoryCleanup {
    repo: Arc<SessionRepository>,
}

impl SessionEventListener for RepositoryCleanup {
    fn on_session_closed(&self, session: &Session) -> anyhow::Result<()> {
        self.repo.remove_if_same(session);
        Ok(())
    }
}

pub struct SessionManager {
    config: SessionManagerConfig,
    runtime_config: Arc<dyn ConfigManager>,
    resolver: Arc<dyn NotebookResolver>,
    launcher: Arc<dyn KernelLauncher>,
    repo: Arc<SessionRepository>,
    resume_strategy: Arc<dyn ResumeStrategy>,
    coordinator: Arc<FileChangeCoordinator>,
    watcher: Mutex<Option<Arc<dyn FileWatcher>>>,
    tokens: TokenManager,
    listeners: Mutex<Vec<Arc<dyn SessionEventListener>>>,
    auxiliary: Mutex<Vec<Arc<dyn AuxiliaryServer>>>,
    ttl_tasks: Arc<Mutex<HashMap<SessionId, TtlTask>>>,
    ttl_generation: AtomicU64,
}

/// A pending run-mode expiry. The generation tells a finished task whether
/// the map entry is still its own.
struct TtlTask {
    generation: u64,
    handle: JoinHandle<()>,
}

impl SessionManager {
    pub fn new(
        config: SessionManagerConfig,
        runtime_config: Arc<dyn ConfigManager>,
        resolver: Arc<dyn NotebookResolver>,
        launcher: Arc<dyn KernelLauncher>,
    ) -> Self {
        let coordinator = Arc::new(FileChangeCoordinator::for_mode(
            config.mode,
            runtime_config.runtime_config().on_cell_change,
        ));
        let manager = Self {
            resume_strategy: strategy_for_mode(config.mode),
            config,
            runtime_config,
            resolver,
            launcher,
            repo: Arc::new(SessionRepository::new()),
            coordinator,
            watcher: Mutex::new(None),
            tokens: TokenManager::new(),
            listeners: Mutex::new(Vec::new()),
            auxiliary: Mutex::new(Vec::new()),
            ttl_tasks: Arc::new(Mutex::new(HashMap::new())),
            ttl_generation: AtomicU64::new(0),
        };
        if manager.config.watch {
            manager.start_file_watcher();
        }
        manager
    }

    /// Replace the resume strategy chosen from the mode.
    pub fn with_resume_strategy(mut self, strategy: Arc<dyn ResumeStrategy>) -> Self {
        self.resume_strategy = strategy;
        self
    }

    /// Use `watcher` instead of the notify-backed one.
    pub fn with_file_watcher(self, watcher: Arc<dyn FileWatcher>) -> Self {
        *lock(&self.watcher) = Some(watcher);
        self
    }

    pub fn mode(&self) -> SessionMode {
        self.config.mode
    }

    pub fn repository(&self) -> &SessionRepository {
        &self.repo
    }

    pub fn server_token(&self) -> &str {
        self.tokens.server_token()
    }

    pub fn validate_server_token(&self, token: Option<&str>) -> bool {
        self.tokens.validate(token)
    }

    /// Subscribe `listener` to every session created from now on.
    pub fn add_listener(&self, listener: Arc<dyn SessionEventListener>) {
        lock(&self.listeners).push(listener);
    }

    pub fn add_auxiliary_server(&self, server: Arc<dyn AuxiliaryServer>) {
        lock(&self.auxiliary).push(server);
    }

    pub fn get_session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.repo.get(session_id)
    }

    pub fn get_session_by_consumer(&self, consumer_id: &str) -> Option<Arc<Session>> {
        self.repo.get_by_consumer(consumer_id)
    }

    pub fn session_count(&self) -> usize {
        self.repo.len()
    }

    // ─── Connect / create ────────────────────────────────────────────────

    /// Whether any session for `file_key` has an open main consumer.
    pub fn any_clients_connected(&self, file_key: &str) -> bool {
        self.repo
            .get_by_file_key(file_key)
            .iter()
            .any(|session| session.connection_state() == ConnectionState::Open)
    }

    /// Refuse a new primary editor while another one is connected, unless
    /// collaborative editing is on. Run mode never refuses.
    pub fn check_can_connect(&self, file_key: &str) -> Result<(), SessionError> {
        if self.config.mode != SessionMode::Edit || self.runtime_config.runtime_config().collaborative {
            return Ok(());
        }
        if self.any_clients_connected(file_key) {
            warn!("[session-manager] Refusing second editor for {}", file_key);
            return Err(SessionError::Refused {
                code: CloseCode::AlreadyConnected,
                reason: format!("{} is already open in another window", file_key),
            });
        }
        Ok(())
    }

    /// Attach `consumer` to session `session_id`, starting the session
    /// first if it does not exist. The kernel is running when this returns.
    ///
    /// The kernel starts without holding the repository lock. If another
    /// caller stored a session under the same id meanwhile, the new session
    /// is closed and the consumer joins the stored one.
    pub async fn create_session(
        &self,
        session_id: SessionId,
        consumer: Arc<dyn SessionConsumer>,
        main: bool,
        query_params: BTreeMap<String, String>,
        file_key: FileKey,
        auto_instantiate: bool,
    ) -> Result<Arc<Session>, SessionError> {
        {
            let _guard = self.repo.write().await;
            if let Some(existing) = self.repo.get(&session_id) {
                return self.join_existing(existing, consumer, main);
            }
        }

        let file_manager = self
            .resolver
            .resolve(&file_key)
            .map_err(|source| SessionError::Resolve {
                file_key: file_key.clone(),
                source,
            })?;

        let runtime = self.runtime_config.runtime_config();
        let mut extensions = default_extensions();
        if self.config.mode == SessionMode::Edit && runtime.cache_enabled && !auto_instantiate {
            extensions.push(caching_extension(self.config.cache_dir.clone()));
        }
        if let Some(watcher) = self.file_watcher() {
            extensions.push(file_watcher_extension(watcher, self.coordinator.clone()));
        }

        let mut listeners = lock(&self.listeners).clone();
        listeners.push(Arc::new(RepositoryCleanup {
            repo: self.repo.clone(),
        }));

        let session = Session::start(SessionParams {
            session_id: session_id.clone(),
            file_key,
            mode: self.config.mode,
            file_manager,
            launcher: self.launcher.clone(),
            config: self.runtime_config.clone(),
            query_params,
            user_config: self.config.user_config.clone(),
            extensions,
            listeners,
        })
        .await?;

        let _guard = self.repo.write().await;
        if let Some(existing) = self.repo.get(&session_id) {
            warn!(
                "[session-manager] Session {} was created concurrently, closing the duplicate",
                session_id
            );
            session.close();
            return self.join_existing(existing, consumer, main);
        }

        if let Err(e) = session.connect_consumer(consumer, main) {
            error!("[session-manager] Initial consumer failed to attach: {}", e);
            session.close();
            return Err(e);
        }
        self.repo.add_sync(session.clone());

        let created = session.clone();
        tokio::spawn(async move {
            created
                .bus()
                .emit("session_created", |listener| listener.on_session_created(&created));
        });

        if auto_instantiate {
            session.instantiate(InstantiateRequest {
                auto_run: true,
                ..InstantiateRequest::default()
            })?;
        }
        Ok(session)
    }

    fn join_existing(
        &self,
        existing: Arc<Session>,
        consumer: Arc<dyn SessionConsumer>,
        main: bool,
    ) -> Result<Arc<Session>, SessionError> {
        if !existing.has_consumer(&consumer.consumer_id()) {
            existing.connect_consumer(consumer, main)?;
        }
        if main {
            self.cancel_ttl(&existing.session_id());
        }
        Ok(existing)
    }

    /// Take over an existing session for a reconnecting client. Sessions
    /// with dead kernels are purged first.
    pub async fn maybe_resume_session(
        &self,
        new_session_id: &str,
        file_key: &str,
    ) -> Result<Option<Arc<Session>>, SessionError> {
        let _guard = self.repo.write().await;

        for dead in self.repo.dead_sessions() {
            let id = dead.session_id();
            warn!("[session-manager] Purging session {} with dead kernel", id);
            self.cancel_ttl(&id);
            self.repo.remove_sync(&id);
            dead.close();
        }

        let Some(session) = self
            .resume_strategy
            .find_resumable(&self.repo, new_session_id, file_key)?
        else {
            return Ok(None);
        };

        let old_id = session.session_id();
        self.cancel_ttl(&old_id);
        if old_id != new_session_id {
            self.repo.rename_sync(&old_id, new_session_id);
        }
        info!("[session-manager] Resumed session {} as {}", old_id, new_session_id);
        session
            .bus()
            .emit("session_resumed", |listener| listener.on_session_resumed(&session, &old_id));
        Ok(Some(session))
    }

    // ─── Disconnect / close ──────────────────────────────────────────────

    /// Detach the main consumer of `session_id`. In run mode the session is
    /// closed if nobody reconnects within the TTL; in edit mode it stays
    /// orphaned until resumed or closed.
    pub fn release_main_consumer(&self, session_id: &str) -> Option<ConsumerId> {
        let session = self.repo.get(session_id)?;
        let released = session.disconnect_main_consumer();
        if self.config.mode == SessionMode::Run {
            self.schedule_ttl(session);
        }
        released
    }

    fn schedule_ttl(&self, session: Arc<Session>) {
        let ttl = self.runtime_config.runtime_config().ttl();
        let repo = self.repo.clone();
        let tasks = self.ttl_tasks.clone();
        let session_id = session.session_id();
        let generation = self.ttl_generation.fetch_add(1, Ordering::SeqCst);
        info!("[session-manager] Session {} expires in {:?} unless resumed", session_id, ttl);

        // Held across spawn and insert so the task cannot finish before its
        // entry exists.
        let mut pending = lock(&self.ttl_tasks);
        let key = session_id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if session.connection_state() != ConnectionState::Open {
                info!("[session-manager] Session {} expired", session.session_id());
                repo.remove_if_same(&session);
                session.close();
            }
            let mut tasks = lock(&tasks);
            if tasks.get(&key).is_some_and(|task| task.generation == generation) {
                tasks.remove(&key);
            }
        });
        if let Some(previous) = pending.insert(session_id, TtlTask { generation, handle }) {
            previous.handle.abort();
        }
    }

    fn cancel_ttl(&self, session_id: &str) {
        if let Some(task) = lock(&self.ttl_tasks).remove(session_id) {
            task.handle.abort();
        }
    }

    pub async fn close_session(&self, session_id: &str) -> bool {
        self.cancel_ttl(session_id);
        match self.repo.remove(session_id).await {
            Some(session) => {
                session.close();
                true
            }
            None => false,
        }
    }

    pub async fn close_all_sessions(&self) {
        let _guard = self.repo.write().await;
        let sessions = self.repo.all();
        info!("[session-manager] Closing {} sessions", sessions.len());
        for session in sessions {
            let id = session.session_id();
            self.cancel_ttl(&id);
            self.repo.remove_sync(&id);
            session.close();
        }
    }

    /// Close every session, stop watching files and stop auxiliary servers.
    pub async fn shutdown(&self) {
        self.close_all_sessions().await;
        self.stop_file_watcher();
        let servers = std::mem::take(&mut *lock(&self.auxiliary));
        for server in servers {
            info!("[session-manager] Stopping {}", server.name());
            server.stop();
        }
    }

    // ─── File watching ───────────────────────────────────────────────────

    fn file_watcher(&self) -> Option<Arc<dyn FileWatcher>> {
        lock(&self.watcher).clone()
    }

    /// Start watching notebook files for sessions created from now on.
    pub fn start_file_watcher(&self) -> Arc<dyn FileWatcher> {
        let mut watcher = lock(&self.watcher);
        if let Some(existing) = watcher.as_ref() {
            return existing.clone();
        }
        info!("[session-manager] Watching notebook files for external edits");
        let created: Arc<dyn FileWatcher> = Arc::new(FileWatcherManager::new());
        *watcher = Some(created.clone());
        created
    }

    pub fn stop_file_watcher(&self) {
        if let Some(watcher) = lock(&self.watcher).take() {
            info!("[session-manager] Stopping file watcher");
            watcher.stop();
        }
    }
}
