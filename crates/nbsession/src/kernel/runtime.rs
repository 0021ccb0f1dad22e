//! The kernel-side command loop.
//!
//! [`run_kernel_loop`] drives a [`KernelRuntime`] (the execution engine,
//! which lives outside this crate) over the kernel ends of a queue set. It
//! runs on a dedicated OS thread: either a thread kernel inside the session
//! process or the main kernel thread of a child process. All queue reads in
//! here block.

use log::{debug, error, info, warn};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::batching::UpdateBatcher;
use crate::commands::Command;
use crate::notifications::{CellNotification, CellOutput, Notification};
use crate::queues::KernelQueues;
use crate::CellId;

use super::KernelLaunchInfo;

/// Result of a completion request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub prefix_length: usize,
    pub options: Vec<Value>,
}

/// Answers code-completion requests on the completion worker thread.
pub trait CompletionProvider: Send {
    fn complete(&mut self, document: &str, cell_id: &CellId) -> anyhow::Result<Completion>;
}

/// The execution engine behind a kernel.
///
/// Errors returned from `handle_command` are logged; user-code failures
/// should instead be reported as cell output through the context.
pub trait KernelRuntime: Send {
    fn handle_command(&mut self, command: Command, ctx: &mut KernelContext) -> anyhow::Result<()>;

    /// Provider for the completion worker. `None` answers every request with
    /// an empty result.
    fn completion_provider(&self) -> Option<Box<dyn CompletionProvider>> {
        None
    }
}

/// Creates a runtime for each kernel.
pub trait RuntimeFactory: Send + Sync {
    fn create(&self, launch: &KernelLaunchInfo) -> anyhow::Result<Box<dyn KernelRuntime>>;
}

/// Per-kernel output sink and input source handed to the runtime.
///
/// Console writes are attributed to the cell set with
/// [`set_current_cell`](Self::set_current_cell), so concurrent thread
/// kernels in one process never share an output stream.
pub struct KernelContext {
    stream: mpsc::UnboundedSender<Notification>,
    input: mpsc::Receiver<String>,
    interrupt: mpsc::UnboundedReceiver<bool>,
    current_cell: Option<CellId>,
    launch: KernelLaunchInfo,
}

impl KernelContext {
    pub fn new(
        stream: mpsc::UnboundedSender<Notification>,
        input: mpsc::Receiver<String>,
        interrupt: mpsc::UnboundedReceiver<bool>,
        launch: KernelLaunchInfo,
    ) -> Self {
        Self {
            stream,
            input,
            interrupt,
            current_cell: None,
            launch,
        }
    }

    pub fn launch(&self) -> &KernelLaunchInfo {
        &self.launch
    }

    /// Send a notification to the session. Returns `false` once the session
    /// side has gone away.
    pub fn emit(&self, notification: Notification) -> bool {
        self.stream.send(notification).is_ok()
    }

    pub fn set_current_cell(&mut self, cell_id: Option<CellId>) {
        self.current_cell = cell_id;
    }

    pub fn current_cell(&self) -> Option<&CellId> {
        self.current_cell.as_ref()
    }

    /// Append a console chunk to the current cell.
    pub fn write_console(&self, output: CellOutput) {
        let Some(cell_id) = self.current_cell.clone() else {
            debug!("[kernel] Console output with no running cell: {:?}", output.data);
            return;
        };
        self.emit(Notification::CellOp(
            CellNotification::new(cell_id).with_console(vec![output]),
        ));
    }

    pub fn write_stdout(&self, text: &str) {
        self.write_console(CellOutput::stdout(text));
    }

    pub fn write_stderr(&self, text: &str) {
        self.write_console(CellOutput::stderr(text));
    }

    /// Prompt for stdin and block until the user answers. Returns `None` if
    /// the input queue closed first.
    pub fn read_input(&mut self, prompt: &str) -> Option<String> {
        self.write_console(CellOutput::stdin_prompt(prompt));
        self.input.blocking_recv()
    }

    /// True if an interrupt arrived since the last check.
    pub fn check_interrupt(&mut self) -> bool {
        let mut interrupted = false;
        while let Ok(flag) = self.interrupt.try_recv() {
            interrupted |= flag;
        }
        interrupted
    }
}

/// Run `runtime` until a stop command arrives or the control queue closes.
///
/// Batched updates are merged before reaching the runtime. Completion
/// requests are answered on a separate worker thread so they never wait
/// behind a long-running cell.
pub fn run_kernel_loop(
    mut runtime: Box<dyn KernelRuntime>,
    queues: KernelQueues,
    launch: KernelLaunchInfo,
) {
    let KernelQueues {
        mut control,
        mut ui_updates,
        completion,
        input,
        interrupt,
        stream,
    } = queues;

    spawn_completion_worker(runtime.completion_provider(), completion, stream.clone());

    let mut ctx = KernelContext::new(stream, input, interrupt, launch);
    let mut batcher = UpdateBatcher::new();
    info!("[kernel] Command loop started for {}", ctx.launch().file_key);

    while let Some(command) = control.blocking_recv() {
        let commands = match command {
            Command::StopKernel => {
                info!("[kernel] Stop requested");
                break;
            }
            command if command.is_batched_update() => {
                if batcher.absorb_mirror() {
                    continue;
                }
                batcher.process_request(command, &mut ui_updates)
            }
            command => vec![command],
        };

        for command in commands {
            // Interrupts that arrived while idle do not apply to new work.
            ctx.check_interrupt();
            let kind = command.kind();
            if let Err(e) = runtime.handle_command(command, &mut ctx) {
                error!("[kernel] Failed to handle {} command: {:#}", kind, e);
            }
        }
    }

    info!("[kernel] Command loop exited");
}

fn spawn_completion_worker(
    mut provider: Option<Box<dyn CompletionProvider>>,
    mut completion: mpsc::UnboundedReceiver<Command>,
    stream: mpsc::UnboundedSender<Notification>,
) {
    let result = std::thread::Builder::new()
        .name("nbsession-completion".into())
        .spawn(move || {
            while let Some(command) = completion.blocking_recv() {
                let (id, document, cell_id) = match command {
                    Command::CodeCompletion {
                        id,
                        document,
                        cell_id,
                    } => (id, document, cell_id),
                    other => {
                        warn!("[kernel] Ignoring {} on the completion queue", other.kind());
                        continue;
                    }
                };

                let result = match provider.as_mut() {
                    Some(provider) => provider.complete(&document, &cell_id).unwrap_or_else(|e| {
                        warn!("[kernel] Completion failed: {:#}", e);
                        Completion::default()
                    }),
                    None => Completion::default(),
                };

                let notification = Notification::CompletionResult {
                    completion_id: id,
                    prefix_length: result.prefix_length,
                    options: result.options,
                };
                if stream.send(notification).is_err() {
                    break;
                }
            }
        });

    if let Err(e) = result {
        error!("[kernel] Failed to start completion worker: {}", e);
    }
}
