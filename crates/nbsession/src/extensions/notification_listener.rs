//! Distributes kernel output to the session.
//!
//! One task per session is the sole reader of the kernel's output stream,
//! so consumers see notifications in the order the kernel emitted them.

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context};
use log::{debug, info};
use tokio::task::JoinHandle;

use crate::events::SessionEventBus;
use crate::lock;
use crate::session::SessionHandle;

use super::SessionExtension;

#[derive(Default)]
pub struct NotificationListenerExtension {
    task: Mutex<Option<JoinHandle<()>>>,
}

impl NotificationListenerExtension {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionExtension for NotificationListenerExtension {
    fn name(&self) -> &'static str {
        "notification-listener"
    }

    fn on_attach(self: Arc<Self>, session: SessionHandle, _bus: Arc<SessionEventBus>) -> anyhow::Result<()> {
        let runtime = tokio::runtime::Handle::try_current().context("no tokio runtime")?;
        let mut stream = session
            .get()
            .ok_or_else(|| anyhow!("session dropped before attach"))?
            .queues()
            .take_stream_receiver()
            .context("kernel output stream already taken")?;

        let task = runtime.spawn(async move {
            while let Some(notification) = stream.recv().await {
                let Some(session) = session.get() else {
                    break;
                };
                if session.is_closed() {
                    break;
                }
                session.notify(notification, None);
            }
            debug!("[notification-listener] Kernel output stream ended");
        });
        if let Some(previous) = lock(&self.task).replace(task) {
            previous.abort();
        }
        Ok(())
    }

    fn on_detach(&self) -> anyhow::Result<()> {
        if let Some(task) = lock(&self.task).take() {
            task.abort();
            info!("[notification-listener] Stopped distributing kernel output");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::ReplayCaptureConsumer;
    use crate::notifications::Notification;
    use crate::session::test_support::{params, FakeLauncher};
    use crate::session::Session;
    use crate::SessionMode;
    use std::time::Duration;

    #[tokio::test]
    async fn test_kernel_output_reaches_consumers_in_order() {
        let launcher = FakeLauncher::new();
        let kernel_queues = launcher.queues.take_kernel_queues().unwrap();
        let mut params = params(launcher, SessionMode::Run);
        params.extensions = vec![Arc::new(NotificationListenerExtension::new())];
        let session = Session::start(params).await.unwrap();

        let capture = ReplayCaptureConsumer::new("main");
        session.connect_consumer(capture.clone(), true).unwrap();

        kernel_queues.stream.send(Notification::Interrupted).unwrap();
        kernel_queues.stream.send(Notification::CompletedRun).unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while capture.ops().len() < 3 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(capture.ops(), vec!["kernel_ready", "interrupted", "completed_run"]);
        session.close();
    }

    #[tokio::test]
    async fn test_second_attach_fails_when_stream_taken() {
        let launcher = FakeLauncher::new();
        let params = params(launcher, SessionMode::Run);
        let session = Session::start(params).await.unwrap();

        let first = Arc::new(NotificationListenerExtension::new());
        first.clone().on_attach(session.handle(), session.bus()).unwrap();
        let second = Arc::new(NotificationListenerExtension::new());
        assert!(second.on_attach(session.handle(), session.bus()).is_err());

        first.on_detach().unwrap();
        first.on_detach().unwrap();
    }
}
