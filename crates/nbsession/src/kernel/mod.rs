//! Kernel managers: start, interrupt and stop the unit that runs cell code.
//!
//! Three backends share one [`KernelManager`] contract:
//!
//! - [`thread::ThreadKernelManager`]: run mode. The kernel loop runs on an
//!   OS thread inside this process and writes to the in-memory output
//!   stream. Cheap, but cannot be interrupted.
//! - [`process::SubprocessKernelManager`]: edit mode. The kernel runs in a
//!   child process reached over framed stdio, so SIGINT can stop runaway
//!   cell code without touching the session process.
//! - The same subprocess manager pointed at a different interpreter (for
//!   example a user's virtual environment) for external-environment mode.
//!
//! A manager moves through NOT_STARTED → RUNNING → STOPPED once. A fresh
//! kernel needs a fresh manager.

pub mod process;
pub mod runtime;
pub mod stdio;
pub mod thread;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use log::{error, info};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::RuntimeConfig;
use crate::queues::QueueManager;
use crate::{CellId, FileKey, KernelState, SessionMode};

use self::process::{ProcessOptions, SubprocessKernelManager};
use self::runtime::RuntimeFactory;
use self::thread::ThreadKernelManager;

/// Errors starting or talking to a kernel.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("failed to spawn kernel process: {0}")]
    Spawn(#[source] std::io::Error),

    /// The kernel never printed its ready token. Fatal; never retried.
    #[error("kernel handshake failed: {reason}\n--- kernel stderr ---\n{stderr}")]
    Handshake { reason: String, stderr: String },

    #[error("failed to start kernel thread: {0}")]
    Thread(#[source] std::io::Error),

    #[error("failed to create kernel runtime: {0:#}")]
    Runtime(#[source] anyhow::Error),

    #[error("kernel queues were already taken")]
    QueuesTaken,

    #[error("kernel already started")]
    AlreadyStarted,

    /// Edit mode needs a child process and none is configured.
    #[error("no kernel command configured for {0} mode")]
    NoKernelCommand(SessionMode),

    #[error("kernel I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything a kernel needs to know about the notebook it serves. Sent to
/// kernel child processes as the first frame after the handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelLaunchInfo {
    pub mode: SessionMode,
    pub file_key: FileKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default)]
    pub cell_configs: BTreeMap<CellId, Value>,
    #[serde(default)]
    pub query_params: BTreeMap<String, String>,
    #[serde(default)]
    pub user_config: Value,
}

/// Uniform control surface over thread and process kernels.
pub trait KernelManager: Send + Sync {
    fn kernel_state(&self) -> KernelState;

    fn is_alive(&self) -> bool;

    /// Process id; `None` for thread kernels and kernels not yet started.
    fn pid(&self) -> Option<u32>;

    /// Ask running cell code to stop. A no-op for thread kernels.
    fn interrupt_kernel(&self);

    /// Send stop, close every queue and force-terminate after the grace
    /// window. Never blocks. Idempotent.
    fn close_kernel(&self);
}

/// A program to run as a kernel child process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
}

impl KernelCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// A user-selected interpreter living inside a virtual environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalInterpreter {
    /// Path to the interpreter binary, e.g. `.venv/bin/python`.
    pub interpreter: PathBuf,
    /// Arguments that make the interpreter host a kernel over stdio.
    pub args: Vec<String>,
}

impl ExternalInterpreter {
    /// Kernel command with the environment activated: `VIRTUAL_ENV` set and
    /// its `bin` directory first on `PATH`.
    pub fn command(&self) -> KernelCommand {
        let mut command = KernelCommand::new(&self.interpreter);
        command.args = self.args.clone();

        if let Some(bin_dir) = self.interpreter.parent() {
            if let Some(venv) = bin_dir.parent() {
                command = command.env("VIRTUAL_ENV", venv.to_string_lossy());
            }
            let path = match std::env::var_os("PATH") {
                Some(existing) => {
                    let mut dirs = vec![bin_dir.to_path_buf()];
                    dirs.extend(std::env::split_paths(&existing));
                    std::env::join_paths(dirs)
                        .map(|p| p.to_string_lossy().into_owned())
                        .unwrap_or_else(|_| bin_dir.to_string_lossy().into_owned())
                }
                None => bin_dir.to_string_lossy().into_owned(),
            };
            command = command.env("PATH", path);
        }
        command
    }
}

/// A started kernel and the queues connected to it.
pub struct LaunchedKernel {
    pub manager: Arc<dyn KernelManager>,
    pub queues: Arc<QueueManager>,
}

/// Chooses and starts the kernel backend for a session.
pub trait KernelLauncher: Send + Sync {
    fn launch(&self, launch: KernelLaunchInfo) -> BoxFuture<'_, Result<LaunchedKernel, KernelError>>;
}

/// Run mode gets a thread kernel. Edit mode gets a child process: the
/// external interpreter if one is configured, otherwise the kernel command.
/// With neither, an edit-mode launch fails with
/// [`KernelError::NoKernelCommand`].
pub struct DefaultKernelLauncher {
    factory: Arc<dyn RuntimeFactory>,
    process_command: Option<KernelCommand>,
    external: Option<ExternalInterpreter>,
    options: ProcessOptions,
}

impl DefaultKernelLauncher {
    pub fn new(factory: Arc<dyn RuntimeFactory>) -> Self {
        Self {
            factory,
            process_command: None,
            external: None,
            options: ProcessOptions::default(),
        }
    }

    /// Command that hosts a kernel over stdio (see [`stdio::serve`]).
    pub fn with_process_command(mut self, command: KernelCommand) -> Self {
        self.process_command = Some(command);
        self
    }

    pub fn with_external_interpreter(mut self, external: ExternalInterpreter) -> Self {
        self.external = Some(external);
        self
    }

    /// Take grace and handshake timeouts from the runtime config.
    pub fn with_config(mut self, config: &RuntimeConfig) -> Self {
        self.options = ProcessOptions {
            grace_period: config.kernel_grace_period(),
            handshake_timeout: config.handshake_timeout(),
        };
        self
    }

    pub fn with_timeouts(mut self, grace_period: Duration, handshake_timeout: Duration) -> Self {
        self.options = ProcessOptions {
            grace_period,
            handshake_timeout,
        };
        self
    }

    fn process_command_for(&self, mode: SessionMode) -> Option<KernelCommand> {
        match mode {
            SessionMode::Run => None,
            SessionMode::Edit => self
                .external
                .as_ref()
                .map(ExternalInterpreter::command)
                .or_else(|| self.process_command.clone()),
        }
    }

    fn launch_thread(&self, launch: KernelLaunchInfo) -> Result<LaunchedKernel, KernelError> {
        let queues = Arc::new(QueueManager::new());
        let manager = ThreadKernelManager::new(self.factory.clone(), launch, queues.clone());
        manager.start_kernel()?;
        Ok(LaunchedKernel {
            manager: Arc::new(manager),
            queues,
        })
    }
}

impl KernelLauncher for DefaultKernelLauncher {
    fn launch(&self, launch: KernelLaunchInfo) -> BoxFuture<'_, Result<LaunchedKernel, KernelError>> {
        Box::pin(async move {
            if launch.mode == SessionMode::Run {
                info!("[kernel-launcher] Starting thread kernel for {}", launch.file_key);
                return self.launch_thread(launch);
            }
            let Some(command) = self.process_command_for(launch.mode) else {
                error!(
                    "[kernel-launcher] No kernel command configured for {}",
                    launch.file_key
                );
                return Err(KernelError::NoKernelCommand(launch.mode));
            };

            info!(
                "[kernel-launcher] Starting process kernel {:?} for {}",
                command.program, launch.file_key
            );
            let queues = Arc::new(QueueManager::new());
            let manager =
                SubprocessKernelManager::new(command, launch, queues.clone(), self.options.clone());
            manager.start_kernel().await?;
            Ok(LaunchedKernel {
                manager: Arc::new(manager),
                queues,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn launch_info(mode: SessionMode) -> KernelLaunchInfo {
        KernelLaunchInfo {
            mode,
            file_key: "nb.py".into(),
            filename: Some("nb.py".into()),
            cell_configs: BTreeMap::new(),
            query_params: BTreeMap::new(),
            user_config: Value::Null,
        }
    }

    #[test]
    fn test_launch_info_roundtrip() {
        let info = launch_info(SessionMode::Edit);
        let json = serde_json::to_string(&info).unwrap();
        let parsed: KernelLaunchInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, info);
    }

    #[test]
    fn test_external_interpreter_activates_venv() {
        let external = ExternalInterpreter {
            interpreter: PathBuf::from("/work/.venv/bin/python"),
            args: vec!["-m".into(), "kernel_host".into()],
        };
        let command = external.command();
        assert_eq!(command.program, Path::new("/work/.venv/bin/python"));
        assert_eq!(command.args, vec!["-m", "kernel_host"]);

        let env: BTreeMap<_, _> = command.env.into_iter().collect();
        assert_eq!(env["VIRTUAL_ENV"], "/work/.venv");
        assert!(env["PATH"].starts_with("/work/.venv/bin"));
    }

    struct Idle;

    impl runtime::KernelRuntime for Idle {
        fn handle_command(
            &mut self,
            _command: crate::commands::Command,
            _ctx: &mut runtime::KernelContext,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct IdleFactory;

    impl RuntimeFactory for IdleFactory {
        fn create(&self, _launch: &KernelLaunchInfo) -> anyhow::Result<Box<dyn runtime::KernelRuntime>> {
            Ok(Box::new(Idle))
        }
    }

    #[tokio::test]
    async fn test_edit_mode_requires_a_process() {
        let launcher = DefaultKernelLauncher::new(Arc::new(IdleFactory));
        let result = launcher.launch(launch_info(SessionMode::Edit)).await;
        assert!(matches!(
            result,
            Err(KernelError::NoKernelCommand(SessionMode::Edit))
        ));

        let launched = launcher.launch(launch_info(SessionMode::Run)).await.unwrap();
        assert!(launched.manager.pid().is_none());
        assert_eq!(launched.manager.kernel_state(), KernelState::Running);
        launched.manager.close_kernel();
    }

    #[test]
    fn test_kernel_command_builder() {
        let command = KernelCommand::new("/bin/kernel").arg("--stdio").env("A", "1");
        assert_eq!(command.args, vec!["--stdio"]);
        assert_eq!(command.env, vec![("A".to_string(), "1".to_string())]);
        assert!(command.cwd.is_none());
    }

    #[test]
    fn test_handshake_error_includes_stderr() {
        let err = KernelError::Handshake {
            reason: "kernel exited before printing the ready token".into(),
            stderr: "ModuleNotFoundError: No module named 'kernel_host'".into(),
        };
        let text = err.to_string();
        assert!(text.contains("ready token"));
        assert!(text.contains("ModuleNotFoundError"));
    }
}
