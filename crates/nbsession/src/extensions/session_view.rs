//! Feeds the session view from the event bus.

use std::sync::Arc;

use log::debug;

use crate::commands::Command;
use crate::events::{SessionEventBus, SessionEventListener};
use crate::notifications::Notification;
use crate::session::{Session, SessionHandle};

use super::{SessionExtension, Subscription};

#[derive(Default)]
pub struct SessionViewExtension {
    subscription: Subscription,
}

impl SessionViewExtension {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionExtension for SessionViewExtension {
    fn name(&self) -> &'static str {
        "session-view"
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

impl SessionEventListener for SessionViewExtension {
    fn on_notification_sent(&self, session: &Session, notification: &Notification) -> anyhow::Result<()> {
        session.update_view(|view| view.add_notification(notification));
        Ok(())
    }

    fn on_received_command(
        &self,
        session: &Session,
        command: &Command,
        _from_consumer_id: Option<&str>,
    ) -> anyhow::Result<()> {
        session.update_view(|view| view.add_control_request(command));
        Ok(())
    }

    fn on_received_stdin(&self, session: &Session, text: &str) -> anyhow::Result<()> {
        if !session.update_view(|view| view.add_stdin(text)) {
            debug!("[session-view] stdin received with no pending prompt");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::{CellNotification, CellOutput, CellStatus};
    use crate::session::test_support::{params, FakeLauncher};
    use crate::SessionMode;
    use serde_json::json;

    #[tokio::test]
    async fn test_view_follows_bus_until_detached() {
        let launcher = FakeLauncher::new();
        let mut params = params(launcher, SessionMode::Edit);
        let extension = Arc::new(SessionViewExtension::new());
        params.extensions = vec![extension.clone()];
        let session = Session::start(params).await.unwrap();

        session.notify(
            Notification::CellOp(
                CellNotification::new("c1")
                    .with_status(CellStatus::Running)
                    .with_console(vec![CellOutput::stdin_prompt("? ")]),
            ),
            None,
        );
        session.put_control_request(
            Command::execute_cells(vec!["c1".into()], vec!["x = input()".into()]).unwrap(),
            None,
        );
        session.put_input("yes");

        let view = session.view_snapshot();
        assert_eq!(view.last_executed_code()["c1"], "x = input()");
        let console = view.cell_notification("c1").unwrap().console.clone().unwrap();
        assert_eq!(console[0].data, json!({"prompt": "? ", "response": "yes"}));

        extension.on_detach().unwrap();
        extension.on_detach().unwrap();
        session.notify(Notification::UpdateCellIds { cell_ids: vec![] }, None);
        assert!(session.view_snapshot().notifications().iter().all(|n| n.op() != "update_cell_ids"));
    }
}
