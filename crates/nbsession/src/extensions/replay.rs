//! Replays session state to the room.
//!
//! After a cache restore the whole view is broadcast. After a resume, the
//! next main consumer is told it reconnected to a running kernel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::debug;

use crate::events::{SessionEventBus, SessionEventListener};
use crate::notifications::Notification;
use crate::session::{Session, SessionHandle};

use super::{SessionExtension, Subscription};

#[derive(Default)]
pub struct ReplayExtension {
    subscription: Subscription,
    resumed: AtomicBool,
}

impl ReplayExtension {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionExtension for ReplayExtension {
    fn name(&self) -> &'static str {
        "replay"
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

impl SessionEventListener for ReplayExtension {
    fn on_view_replaced(&self, session: &Session) -> anyhow::Result<()> {
        debug!("[replay] Broadcasting restored view for {}", session.session_id());
        session.broadcast_view();
        Ok(())
    }

    fn on_session_resumed(&self, _session: &Session, _old_id: &str) -> anyhow::Result<()> {
        self.resumed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn on_consumer_attached(&self, session: &Session, consumer_id: &str, main: bool) -> anyhow::Result<()> {
        if main && self.resumed.swap(false, Ordering::SeqCst) {
            debug!("[replay] Consumer {} resumed session {}", consumer_id, session.session_id());
            session.send_to(consumer_id, &Notification::Reconnected);
        }
        Ok(())
    }
}
