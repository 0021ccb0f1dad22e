//! Process-backed kernels for edit mode and external interpreters.
//!
//! The child is spawned in its own process group with piped stdio. It must
//! print the ready token on stdout before anything else happens; after that
//! both directions carry length-prefixed JSON frames. stderr is collected
//! so a failed start can report why.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, Command as ProcessCommand};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::commands::Command;
use crate::connection::{
    recv_json_frame, send_json_frame, wait_for_ready_token, KernelInbound, KernelOutbound,
};
use crate::notifications::Notification;
use crate::queues::{KernelQueues, QueueManager};
use crate::{lock, KernelState};

use super::{KernelCommand, KernelError, KernelLaunchInfo, KernelManager};

/// Bytes of kernel stderr kept for diagnostics.
const MAX_STDERR_BYTES: usize = 64 * 1024;

/// Timeouts for a process kernel.
#[derive(Debug, Clone)]
pub struct ProcessOptions {
    pub grace_period: Duration,
    pub handshake_timeout: Duration,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(2),
            handshake_timeout: Duration::from_secs(30),
        }
    }
}

pub struct SubprocessKernelManager {
    command: KernelCommand,
    launch: KernelLaunchInfo,
    queues: Arc<QueueManager>,
    options: ProcessOptions,
    child: Mutex<Option<Child>>,
    pid: Mutex<Option<u32>>,
    stderr: Arc<Mutex<String>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    closed: AtomicBool,
}

impl SubprocessKernelManager {
    pub fn new(
        command: KernelCommand,
        launch: KernelLaunchInfo,
        queues: Arc<QueueManager>,
        options: ProcessOptions,
    ) -> Self {
        Self {
            command,
            launch,
            queues,
            options,
            child: Mutex::new(None),
            pid: Mutex::new(None),
            stderr: Arc::new(Mutex::new(String::new())),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Spawn the child, wait for its ready token and wire the queues to its
    /// stdio. A missing token is fatal and carries the captured stderr.
    pub async fn start_kernel(&self) -> Result<(), KernelError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(KernelError::AlreadyStarted);
        }

        let mut cmd = ProcessCommand::new(&self.command.program);
        cmd.args(&self.command.args)
            .envs(self.command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &self.command.cwd {
            cmd.current_dir(cwd);
        }

        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.kill_on_drop(true).spawn().map_err(KernelError::Spawn)?;
        let pid = child.id();
        info!(
            "[kernel-process] Spawned {:?} (pid {:?}) for {}",
            self.command.program, pid, self.launch.file_key
        );

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(KernelError::Io(std::io::Error::other(
                "kernel process is missing a piped stdio handle",
            )));
        };

        let stderr_task = tokio::spawn(collect_stderr(stderr, self.stderr.clone(), pid));
        let mut stdout = BufReader::new(stdout);

        let handshake =
            tokio::time::timeout(self.options.handshake_timeout, wait_for_ready_token(&mut stdout))
                .await;
        let reason = match handshake {
            Ok(Ok(skipped)) => {
                if !skipped.is_empty() {
                    debug!(
                        "[kernel-process] Kernel printed {} line(s) before the ready token",
                        skipped.len()
                    );
                }
                None
            }
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!(
                "no ready token within {:?}",
                self.options.handshake_timeout
            )),
        };

        if let Some(reason) = reason {
            let _ = child.start_kill();
            let _ = tokio::time::timeout(Duration::from_secs(1), child.wait()).await;
            let _ = tokio::time::timeout(Duration::from_secs(1), stderr_task).await;
            let stderr = lock(&self.stderr).clone();
            error!("[kernel-process] Kernel handshake failed: {}", reason);
            return Err(KernelError::Handshake { reason, stderr });
        }

        let kernel_queues = self
            .queues
            .take_kernel_queues()
            .ok_or(KernelError::QueuesTaken)?;
        let stream = kernel_queues.stream.clone();

        let writer = tokio::spawn(forward_queues(kernel_queues, self.launch.clone(), stdin));
        let reader = tokio::spawn(forward_notifications(stdout, stream));

        *lock(&self.pid) = pid;
        *lock(&self.child) = Some(child);
        lock(&self.tasks).extend([stderr_task, writer, reader]);
        info!("[kernel-process] Kernel ready (pid {:?})", pid);
        Ok(())
    }

    /// Stderr captured so far.
    pub fn stderr_output(&self) -> String {
        lock(&self.stderr).clone()
    }
}

impl KernelManager for SubprocessKernelManager {
    fn kernel_state(&self) -> KernelState {
        if !self.started.load(Ordering::SeqCst) || lock(&self.pid).is_none() {
            return KernelState::NotStarted;
        }
        if self.is_alive() {
            KernelState::Running
        } else {
            KernelState::Stopped
        }
    }

    fn is_alive(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        match lock(&self.child).as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    fn pid(&self) -> Option<u32> {
        *lock(&self.pid)
    }

    fn interrupt_kernel(&self) {
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            let Some(pid) = self.pid() else {
                return;
            };
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
                warn!("[kernel-process] Failed to interrupt kernel {}: {}", pid, e);
            }
        }

        #[cfg(not(unix))]
        {
            if !self.queues.put_interrupt() {
                debug!("[kernel-process] Interrupt dropped: queues closed");
            }
        }
    }

    fn close_kernel(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.queues.put_control(Command::StopKernel);
        self.queues.close();

        let Some(mut child) = lock(&self.child).take() else {
            return;
        };
        let grace = self.options.grace_period;
        #[cfg(unix)]
        let pgid = self.pid().map(|pid| pid as i32);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    match tokio::time::timeout(grace, child.wait()).await {
                        Ok(status) => debug!("[kernel-process] Kernel exited: {:?}", status),
                        Err(_) => {
                            warn!("[kernel-process] Kernel still running after {:?}, killing", grace);
                            let _ = child.kill().await;
                        }
                    }
                    #[cfg(unix)]
                    if let Some(pgid) = pgid {
                        kill_process_group(pgid);
                    }
                });
            }
            Err(_) => {
                let _ = child.start_kill();
                #[cfg(unix)]
                if let Some(pgid) = pgid {
                    kill_process_group(pgid);
                }
            }
        }
        info!("[kernel-process] Closed kernel for {}", self.launch.file_key);
    }
}

impl Drop for SubprocessKernelManager {
    fn drop(&mut self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        self.queues.close();

        #[cfg(unix)]
        if let Some(pid) = self.pid() {
            kill_process_group(pid as i32);
        }
        debug!("[kernel-process] Kernel manager dropped - process cleaned up");
    }
}

#[cfg(unix)]
fn kill_process_group(pgid: i32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Err(e) = killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        if e != nix::errno::Errno::ESRCH {
            error!("[kernel-process] Failed to kill process group {}: {}", pgid, e);
        }
    }
}

async fn collect_stderr<R: AsyncRead + Unpin>(
    stderr: R,
    buffer: Arc<Mutex<String>>,
    pid: Option<u32>,
) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("[kernel:{:?}] {}", pid, line);
        let mut buffer = lock(&buffer);
        if buffer.len() + line.len() < MAX_STDERR_BYTES {
            buffer.push_str(&line);
            buffer.push('\n');
        }
    }
}

/// Write the configure frame, then every queued item as a frame, until all
/// session-side queues close. Batched updates are sent once, as `UiUpdate`.
pub async fn forward_queues<W: AsyncWrite + Unpin>(
    queues: KernelQueues,
    launch: KernelLaunchInfo,
    mut writer: W,
) {
    let KernelQueues {
        mut control,
        mut ui_updates,
        mut completion,
        mut input,
        mut interrupt,
        stream,
    } = queues;
    drop(stream);

    if let Err(e) = send_json_frame(&mut writer, &KernelInbound::Configure { launch }).await {
        error!("[kernel-process] Failed to send configure frame: {}", e);
        return;
    }

    loop {
        // Batched updates travel once, as a `UiUpdate` frame taken from the
        // control queue. The child re-creates the batching copy ahead of the
        // control copy, so the local copies here are only drained.
        let frame = tokio::select! {
            biased;
            Some(command) = control.recv() => {
                if command.is_batched_update() {
                    KernelInbound::UiUpdate { command }
                } else {
                    KernelInbound::Control { command }
                }
            }
            Some(_) = ui_updates.recv() => continue,
            Some(command) = completion.recv() => KernelInbound::Completion { command },
            Some(text) = input.recv() => KernelInbound::Input { text },
            Some(_) = interrupt.recv() => KernelInbound::Interrupt,
            else => break,
        };
        if let Err(e) = send_json_frame(&mut writer, &frame).await {
            warn!("[kernel-process] Kernel connection closed: {}", e);
            break;
        }
    }
    debug!("[kernel-process] Queue forwarder exited");
}

/// Read notification frames until EOF. Malformed frames are logged and
/// skipped.
pub async fn forward_notifications<R: AsyncRead + Unpin>(
    mut reader: R,
    stream: mpsc::UnboundedSender<Notification>,
) {
    loop {
        match recv_json_frame::<_, KernelOutbound>(&mut reader).await {
            Ok(Some(KernelOutbound::Notification { notification })) => {
                if stream.send(notification).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) if e.downcast_ref::<std::io::Error>().is_some() => {
                warn!("[kernel-process] Kernel output stream failed: {}", e);
                break;
            }
            Err(e) => warn!("[kernel-process] Skipping malformed kernel frame: {}", e),
        }
    }
    debug!("[kernel-process] Notification reader exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{recv_json_frame, send_frame};
    use crate::SessionMode;
    use std::collections::BTreeMap;

    fn launch_info() -> KernelLaunchInfo {
        KernelLaunchInfo {
            mode: SessionMode::Edit,
            file_key: "nb.py".into(),
            filename: Some("nb.py".into()),
            cell_configs: BTreeMap::new(),
            query_params: BTreeMap::new(),
            user_config: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn test_forward_queues_sends_configure_then_frames() {
        let queues = QueueManager::new();
        let kernel = queues.take_kernel_queues().unwrap();
        let (client, mut server) = tokio::io::duplex(64 * 1024);

        let task = tokio::spawn(forward_queues(kernel, launch_info(), client));
        queues.put_control(Command::ExecuteStaleCells);
        queues.put_input("answer".into());
        queues.close();
        task.await.unwrap();

        let first: KernelInbound = recv_json_frame(&mut server).await.unwrap().unwrap();
        assert!(matches!(first, KernelInbound::Configure { .. }));
        let second: KernelInbound = recv_json_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(
            second,
            KernelInbound::Control {
                command: Command::ExecuteStaleCells
            }
        );
        let third: KernelInbound = recv_json_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(third, KernelInbound::Input { text: "answer".into() });
    }

    #[tokio::test]
    async fn test_batched_update_crosses_as_one_frame() {
        let queues = QueueManager::new();
        let kernel = queues.take_kernel_queues().unwrap();
        let (client, mut server) = tokio::io::duplex(64 * 1024);

        let task = tokio::spawn(forward_queues(kernel, launch_info(), client));
        let update =
            Command::update_ui_element(vec!["slider".into()], vec![serde_json::json!(1)]).unwrap();
        queues.put_control(update.clone());
        queues.put_control(Command::ExecuteStaleCells);
        queues.close();
        task.await.unwrap();

        let mut frames = Vec::new();
        while let Some(frame) = recv_json_frame::<_, KernelInbound>(&mut server).await.unwrap() {
            frames.push(frame);
        }
        assert!(matches!(frames[0], KernelInbound::Configure { .. }));
        assert_eq!(
            frames[1..],
            [
                KernelInbound::UiUpdate { command: update },
                KernelInbound::Control {
                    command: Command::ExecuteStaleCells
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_forward_notifications_skips_malformed() {
        let (mut kernel_side, session_side) = tokio::io::duplex(64 * 1024);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(forward_notifications(session_side, tx));

        send_frame(&mut kernel_side, b"garbage").await.unwrap();
        send_json_frame(
            &mut kernel_side,
            &KernelOutbound::Notification {
                notification: Notification::Interrupted,
            },
        )
        .await
        .unwrap();
        drop(kernel_side);

        task.await.unwrap();
        assert_eq!(rx.recv().await, Some(Notification::Interrupted));
        assert_eq!(rx.recv().await, None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_handshake_failure_reports_stderr() {
        let queues = Arc::new(QueueManager::new());
        let command = KernelCommand::new("sh")
            .arg("-c")
            .arg("echo 'kernel module not found' >&2; exit 1");
        let manager = SubprocessKernelManager::new(
            command,
            launch_info(),
            queues.clone(),
            ProcessOptions::default(),
        );

        match manager.start_kernel().await {
            Err(KernelError::Handshake { stderr, .. }) => {
                assert!(stderr.contains("kernel module not found"), "stderr: {}", stderr)
            }
            Err(other) => panic!("unexpected error: {}", other),
            Ok(()) => panic!("handshake should fail"),
        }
        assert_eq!(manager.kernel_state(), KernelState::NotStarted);
        assert!(queues.take_kernel_queues().is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_handshake_timeout() {
        let manager = SubprocessKernelManager::new(
            KernelCommand::new("sleep").arg("30"),
            launch_info(),
            Arc::new(QueueManager::new()),
            ProcessOptions {
                grace_period: Duration::from_millis(100),
                handshake_timeout: Duration::from_millis(200),
            },
        );
        let err = manager.start_kernel().await.unwrap_err();
        assert!(err.to_string().contains("no ready token"), "{}", err);
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let manager = SubprocessKernelManager::new(
            KernelCommand::new("/nonexistent/kernel-binary"),
            launch_info(),
            Arc::new(QueueManager::new()),
            ProcessOptions::default(),
        );
        assert!(matches!(
            manager.start_kernel().await,
            Err(KernelError::Spawn(_))
        ));
        assert!(!manager.is_alive());
        assert!(manager.pid().is_none());
    }
}
