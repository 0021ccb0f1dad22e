//! Thread-backed kernels for run mode.
//!
//! Many read-only app sessions can share one process this way. The price is
//! that a thread cannot be interrupted, and a closed kernel thread is never
//! joined: a cell stuck in a loop keeps its thread until the process exits.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::{debug, info};

use crate::commands::Command;
use crate::queues::QueueManager;
use crate::{lock, KernelState};

use super::runtime::{run_kernel_loop, RuntimeFactory};
use super::{KernelError, KernelLaunchInfo, KernelManager};

pub struct ThreadKernelManager {
    factory: Arc<dyn RuntimeFactory>,
    launch: KernelLaunchInfo,
    queues: Arc<QueueManager>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadKernelManager {
    pub fn new(
        factory: Arc<dyn RuntimeFactory>,
        launch: KernelLaunchInfo,
        queues: Arc<QueueManager>,
    ) -> Self {
        Self {
            factory,
            launch,
            queues,
            handle: Mutex::new(None),
        }
    }

    /// Create the runtime and start the kernel loop on a named thread.
    pub fn start_kernel(&self) -> Result<(), KernelError> {
        let mut handle = lock(&self.handle);
        if handle.is_some() {
            return Err(KernelError::AlreadyStarted);
        }

        let runtime = self
            .factory
            .create(&self.launch)
            .map_err(KernelError::Runtime)?;
        let kernel_queues = self
            .queues
            .take_kernel_queues()
            .ok_or(KernelError::QueuesTaken)?;
        let launch = self.launch.clone();

        let thread = std::thread::Builder::new()
            .name(format!("nbsession-kernel-{}", self.launch.file_key))
            .spawn(move || run_kernel_loop(runtime, kernel_queues, launch))
            .map_err(KernelError::Thread)?;

        info!("[kernel-thread] Started kernel thread for {}", self.launch.file_key);
        *handle = Some(thread);
        Ok(())
    }
}

impl KernelManager for ThreadKernelManager {
    fn kernel_state(&self) -> KernelState {
        match lock(&self.handle).as_ref() {
            None => KernelState::NotStarted,
            Some(thread) if !thread.is_finished() => KernelState::Running,
            Some(_) => KernelState::Stopped,
        }
    }

    fn is_alive(&self) -> bool {
        self.kernel_state() == KernelState::Running
    }

    fn pid(&self) -> Option<u32> {
        None
    }

    fn interrupt_kernel(&self) {
        debug!("[kernel-thread] Interrupt is not supported for thread kernels");
    }

    fn close_kernel(&self) {
        if self.queues.is_closed() {
            return;
        }
        self.queues.put_control(Command::StopKernel);
        self.queues.close();
        info!("[kernel-thread] Closed kernel for {}", self.launch.file_key);
    }
}
