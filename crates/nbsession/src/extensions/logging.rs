//! Debug logging of session traffic.

use std::path::Path;
use std::sync::Arc;

use log::{debug, info};

use crate::commands::Command;
use crate::events::{SessionEventBus, SessionEventListener};
use crate::notifications::Notification;
use crate::session::{Session, SessionHandle};

use super::{SessionExtension, Subscription};

#[derive(Default)]
pub struct LoggingExtension {
    subscription: Subscription,
}

impl LoggingExtension {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionExtension for LoggingExtension {
    fn name(&self) -> &'static str {
        "logging"
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

impl SessionEventListener for LoggingExtension {
    fn on_session_created(&self, session: &Session) -> anyhow::Result<()> {
        info!("[session-log] Created {} ({})", session.session_id(), session.file_key());
        Ok(())
    }

    fn on_session_resumed(&self, session: &Session, old_id: &str) -> anyhow::Result<()> {
        info!("[session-log] Resumed {} as {}", old_id, session.session_id());
        Ok(())
    }

    fn on_notebook_renamed(&self, session: &Session, old_path: Option<&Path>) -> anyhow::Result<()> {
        info!(
            "[session-log] Renamed {:?} -> {:?}",
            old_path,
            session.notebook_path()
        );
        Ok(())
    }

    fn on_received_command(
        &self,
        session: &Session,
        command: &Command,
        from_consumer_id: Option<&str>,
    ) -> anyhow::Result<()> {
        debug!(
            "[session-log] {} <- {} from {}",
            session.session_id(),
            command.kind(),
            from_consumer_id.unwrap_or("server")
        );
        Ok(())
    }

    fn on_notification_sent(&self, session: &Session, notification: &Notification) -> anyhow::Result<()> {
        debug!("[session-log] {} -> {}", session.session_id(), notification.op());
        Ok(())
    }

    fn on_received_stdin(&self, session: &Session, text: &str) -> anyhow::Result<()> {
        debug!("[session-log] {} stdin ({} bytes)", session.session_id(), text.len());
        Ok(())
    }

    fn on_consumer_attached(&self, session: &Session, consumer_id: &str, main: bool) -> anyhow::Result<()> {
        debug!(
            "[session-log] {} consumer {} attached (main: {})",
            session.session_id(),
            consumer_id,
            main
        );
        Ok(())
    }

    fn on_consumer_detached(&self, session: &Session, consumer_id: &str) -> anyhow::Result<()> {
        debug!("[session-log] {} consumer {} detached", session.session_id(), consumer_id);
        Ok(())
    }
}
