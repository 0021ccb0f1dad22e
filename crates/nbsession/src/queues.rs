//! Per-kernel queue set.
//!
//! The session side holds the senders; the kernel side takes the receivers
//! once, when the kernel starts. Closing the manager drops every sender, so
//! a kernel blocked on any queue wakes up with a closed channel instead of
//! hanging forever.
//!
//! | queue       | direction        | bound | carries                         |
//! |-------------|------------------|-------|---------------------------------|
//! | control     | session → kernel | none  | every command but completions   |
//! | ui_updates  | session → kernel | none  | UI-element/widget-model updates |
//! | completion  | session → kernel | none  | code-completion requests        |
//! | input       | session → kernel | 1     | stdin answers                   |
//! | interrupt   | session → kernel | none  | interrupt flags (Windows)       |
//! | stream      | kernel → session | none  | notifications                   |

use std::sync::Mutex;

use log::{debug, warn};
use tokio::sync::mpsc;

use crate::commands::Command;
use crate::connection::KernelInbound;
use crate::lock;
use crate::notifications::Notification;

/// Kernel-side ends of the queue set.
pub struct KernelQueues {
    pub control: mpsc::UnboundedReceiver<Command>,
    pub ui_updates: mpsc::UnboundedReceiver<Command>,
    pub completion: mpsc::UnboundedReceiver<Command>,
    pub input: mpsc::Receiver<String>,
    pub interrupt: mpsc::UnboundedReceiver<bool>,
    /// Output sink for notifications.
    pub stream: mpsc::UnboundedSender<Notification>,
}

struct Senders {
    control: mpsc::UnboundedSender<Command>,
    ui_updates: mpsc::UnboundedSender<Command>,
    completion: mpsc::UnboundedSender<Command>,
    input: mpsc::Sender<String>,
    interrupt: mpsc::UnboundedSender<bool>,
}

/// Owner of the queues connecting one session to one kernel.
pub struct QueueManager {
    senders: Mutex<Option<Senders>>,
    kernel_side: Mutex<Option<KernelQueues>>,
    stream_rx: Mutex<Option<mpsc::UnboundedReceiver<Notification>>>,
}

impl QueueManager {
    pub fn new() -> Self {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (ui_tx, ui_rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let (input_tx, input_rx) = mpsc::channel(1);
        let (interrupt_tx, interrupt_rx) = mpsc::unbounded_channel();
        let (stream_tx, stream_rx) = mpsc::unbounded_channel();

        Self {
            senders: Mutex::new(Some(Senders {
                control: control_tx,
                ui_updates: ui_tx,
                completion: completion_tx,
                input: input_tx,
                interrupt: interrupt_tx,
            })),
            kernel_side: Mutex::new(Some(KernelQueues {
                control: control_rx,
                ui_updates: ui_rx,
                completion: completion_rx,
                input: input_rx,
                interrupt: interrupt_rx,
                stream: stream_tx,
            })),
            stream_rx: Mutex::new(Some(stream_rx)),
        }
    }

    /// Take the kernel-side receivers. Returns `None` after the first call.
    pub fn take_kernel_queues(&self) -> Option<KernelQueues> {
        lock(&self.kernel_side).take()
    }

    /// Take the receiving end of the output stream. Returns `None` after the
    /// first call.
    pub fn take_stream_receiver(&self) -> Option<mpsc::UnboundedReceiver<Notification>> {
        lock(&self.stream_rx).take()
    }

    /// Route a command to the right queue(s).
    ///
    /// Completions go to the completion queue only. UI-element and
    /// widget-model updates go to both the control queue and the batching
    /// queue. Everything else goes to the control queue. Returns `false` if
    /// the queues are closed.
    pub fn put_control(&self, command: Command) -> bool {
        let guard = lock(&self.senders);
        let Some(senders) = guard.as_ref() else {
            debug!("[queues] Dropping {} command: queues closed", command.kind());
            return false;
        };

        let result = match command {
            Command::CodeCompletion { .. } => senders.completion.send(command),
            command if command.is_batched_update() => senders
                .ui_updates
                .send(command.clone())
                .and_then(|_| senders.control.send(command)),
            command => senders.control.send(command),
        };
        if let Err(e) = result {
            debug!("[queues] Kernel is gone, dropping {} command", e.0.kind());
            return false;
        }
        true
    }

    /// Deliver a stdin answer.
    ///
    /// The input queue holds a single value. If the kernel has not read the
    /// previous answer yet, the new one is dropped with a warning.
    pub fn put_input(&self, text: String) -> bool {
        let guard = lock(&self.senders);
        let Some(senders) = guard.as_ref() else {
            return false;
        };
        match senders.input.try_send(text) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("[queues] Input queue full, dropping stdin answer");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("[queues] Input queue closed");
                false
            }
        }
    }

    /// Push an interrupt flag for the kernel to poll.
    pub fn put_interrupt(&self) -> bool {
        lock(&self.senders)
            .as_ref()
            .map(|senders| senders.interrupt.send(true).is_ok())
            .unwrap_or(false)
    }

    /// Place a frame received over a kernel connection on its queue. Used
    /// inside a kernel child process. A `UiUpdate` goes through
    /// [`put_control`](Self::put_control) so its batching copy is queued
    /// before its control copy.
    pub fn forward(&self, frame: KernelInbound) -> bool {
        let guard = lock(&self.senders);
        let Some(senders) = guard.as_ref() else {
            return false;
        };
        match frame {
            KernelInbound::Control { command } => senders.control.send(command).is_ok(),
            KernelInbound::UiUpdate { command } => {
                drop(guard);
                self.put_control(command)
            }
            KernelInbound::Completion { command } => senders.completion.send(command).is_ok(),
            KernelInbound::Input { text } => {
                drop(guard);
                self.put_input(text)
            }
            KernelInbound::Interrupt => senders.interrupt.send(true).is_ok(),
            KernelInbound::Configure { .. } => {
                warn!("[queues] Ignoring unexpected configure frame");
                false
            }
        }
    }

    /// Drop every sender. Kernel-side receivers see their channels close
    /// once drained. Idempotent.
    pub fn close(&self) {
        if lock(&self.senders).take().is_some() {
            debug!("[queues] Closed kernel queues");
        }
        // Receivers nobody took would otherwise keep the stream sender alive.
        lock(&self.kernel_side).take();
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.senders).is_none()
    }
}

impl Default for QueueManager {
    fn default() -> Self {
        Self::new()
    }
}
