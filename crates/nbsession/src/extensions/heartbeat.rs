//! Kernel liveness monitor.
//!
//! Polls the kernel on the configured heartbeat interval. The first time the
//! kernel is seen dead, the session gets a single alert and is closed. There
//! is no automatic restart.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context};
use log::{error, info};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::events::SessionEventBus;
use crate::lock;
use crate::notifications::Notification;
use crate::session::SessionHandle;

use super::SessionExtension;

#[derive(Default)]
pub struct HeartbeatExtension {
    task: Mutex<Option<JoinHandle<()>>>,
    fired: Arc<AtomicBool>,
}

impl HeartbeatExtension {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether kernel death has been reported.
    pub fn fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

impl SessionExtension for HeartbeatExtension {
    fn name(&self) -> &'static str {
        "heartbeat"
    }

    fn on_attach(self: Arc<Self>, session: SessionHandle, _bus: Arc<SessionEventBus>) -> anyhow::Result<()> {
        let runtime = tokio::runtime::Handle::try_current().context("no tokio runtime")?;
        let period = session
            .get()
            .ok_or_else(|| anyhow!("session dropped before attach"))?
            .config()
            .runtime_config()
            .heartbeat_interval();
        let fired = self.fired.clone();

        let task = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(session) = session.get() else {
                    break;
                };
                if session.is_closed() {
                    break;
                }
                if session.is_kernel_alive() {
                    continue;
                }
                if fired.swap(true, Ordering::SeqCst) {
                    break;
                }
                error!(
                    "[heartbeat] Kernel for {} is dead, closing session {}",
                    session.file_key(),
                    session.session_id()
                );
                session.notify(
                    Notification::Alert {
                        title: "Kernel died".into(),
                        description: "The kernel stopped unexpectedly. Restart the notebook to continue."
                            .into(),
                        variant: Some("danger".into()),
                    },
                    None,
                );
                session.close();
                break;
            }
        });
        if let Some(previous) = lock(&self.task).replace(task) {
            previous.abort();
        }
        info!("[heartbeat] Monitoring kernel every {:?}", period);
        Ok(())
    }

    fn on_detach(&self) -> anyhow::Result<()> {
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RuntimeConfig, StaticConfig};
    use crate::consumer::ReplayCaptureConsumer;
    use crate::events::SessionEventListener;
    use crate::session::test_support::{params, FakeLauncher};
    use crate::session::Session;
    use crate::SessionMode;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Default)]
    struct CloseCounter(AtomicUsize);

    impl SessionEventListener for CloseCounter {
        fn on_session_closed(&self, _session: &Session) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_dead_kernel_closes_once_with_one_alert() {
        let launcher = FakeLauncher::new();
        let mut params = params(launcher.clone(), SessionMode::Edit);
        params.config = Arc::new(StaticConfig(RuntimeConfig {
            heartbeat_interval_ms: 50,
            ..RuntimeConfig::default()
        }));
        let heartbeat = Arc::new(HeartbeatExtension::new());
        let closes = Arc::new(CloseCounter::default());
        params.extensions = vec![heartbeat.clone()];
        params.listeners = vec![closes.clone()];
        let session = Session::start(params).await.unwrap();

        let capture = ReplayCaptureConsumer::new("main");
        session.connect_consumer(capture.clone(), true).unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(!session.is_closed());

        launcher.kernel.alive.store(false, Ordering::SeqCst);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !session.is_closed() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(session.is_closed());
        assert!(heartbeat.fired());
        assert_eq!(closes.0.load(Ordering::SeqCst), 1);
        let alerts = capture.ops().iter().filter(|op| **op == "alert").count();
        assert_eq!(alerts, 1);
    }
}
