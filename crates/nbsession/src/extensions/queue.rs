//! Forwards received commands and stdin to the kernel's queues.

use std::sync::Arc;

use log::warn;

use crate::commands::Command;
use crate::events::{SessionEventBus, SessionEventListener};
use crate::session::{Session, SessionHandle};

use super::{SessionExtension, Subscription};

#[derive(Default)]
pub struct QueueExtension {
    subscription: Subscription,
}

impl QueueExtension {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionExtension for QueueExtension {
    fn name(&self) -> &'static str {
        "queue"
    }

    fn on_attach(self: Arc<Self>, _session: SessionHandle, bus: Arc<SessionEventBus>) -> anyhow::Result<()> {
        self.subscription.subscribe(bus, self.clone());
        Ok(())
    }

    fn on_detach(&self) -> anyhow::Result<()> {
        self.subscription.unsubscribe();
        Ok(())
    }
}

impl SessionEventListener for QueueExtension {
    fn on_received_command(
        &self,
        session: &Session,
        command: &Command,
        _from_consumer_id: Option<&str>,
    ) -> anyhow::Result<()> {
        if !session.queues().put_control(command.clone()) {
            warn!("[queue] Kernel queues closed, dropped {}", command.kind());
        }
        Ok(())
    }

    fn on_received_stdin(&self, session: &Session, text: &str) -> anyhow::Result<()> {
        session.queues().put_input(text.to_string());
        Ok(())
    }
}
