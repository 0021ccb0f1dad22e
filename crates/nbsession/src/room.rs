//! Broadcast group of one session.

use std::sync::Arc;

use log::{debug, error, warn};

use crate::consumer::SessionConsumer;
use crate::error::SessionError;
use crate::notifications::SerializedNotification;
use crate::{ConnectionState, ConsumerId};

/// One optional main consumer plus any number of secondary consumers.
/// Iteration follows insertion order.
#[derive(Default)]
pub struct Room {
    main_consumer: Option<ConsumerId>,
    consumers: Vec<(ConsumerId, Arc<dyn SessionConsumer>)>,
}

impl Room {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check whether `consumer_id` could be added. Fails for a second main
    /// consumer or a duplicate id.
    pub fn check_can_add(&self, consumer_id: &str, main: bool) -> Result<(), SessionError> {
        if main {
            if let Some(existing) = &self.main_consumer {
                error!(
                    "[room] Refusing main consumer {}: {} is already main",
                    consumer_id, existing
                );
                return Err(SessionError::MainConsumerExists(existing.clone()));
            }
        }
        if self.contains(consumer_id) {
            return Err(SessionError::DuplicateConsumer(consumer_id.to_string()));
        }
        Ok(())
    }

    pub fn add_consumer(
        &mut self,
        consumer: Arc<dyn SessionConsumer>,
        main: bool,
    ) -> Result<(), SessionError> {
        let consumer_id = consumer.consumer_id();
        self.check_can_add(&consumer_id, main)?;
        if main {
            self.main_consumer = Some(consumer_id.clone());
        }
        debug!("[room] Added consumer {} (main: {})", consumer_id, main);
        self.consumers.push((consumer_id, consumer));
        Ok(())
    }

    /// Remove a consumer and call its `on_detach`. Clears the main slot if
    /// it was the main consumer.
    pub fn remove_consumer(&mut self, consumer_id: &str) -> Option<Arc<dyn SessionConsumer>> {
        let index = self.consumers.iter().position(|(id, _)| id == consumer_id)?;
        let (_, consumer) = self.consumers.remove(index);
        if self.main_consumer.as_deref() == Some(consumer_id) {
            self.main_consumer = None;
        }
        if let Err(e) = consumer.on_detach() {
            warn!("[room] Consumer {} failed to detach: {:#}", consumer_id, e);
        }
        debug!("[room] Removed consumer {}", consumer_id);
        Some(consumer)
    }

    /// Deliver to every OPEN consumer except `except`. Returns the number
    /// of consumers reached.
    pub fn broadcast(&self, notification: &SerializedNotification, except: Option<&str>) -> usize {
        let mut delivered = 0;
        for (id, consumer) in &self.consumers {
            if except == Some(id.as_str()) {
                continue;
            }
            if consumer.connection_state() != ConnectionState::Open {
                continue;
            }
            consumer.notify(notification);
            delivered += 1;
        }
        delivered
    }

    /// Deliver to a single consumer, regardless of exclusion rules.
    pub fn send_to(&self, consumer_id: &str, notification: &SerializedNotification) -> bool {
        match self.get(consumer_id) {
            Some(consumer) if consumer.connection_state() == ConnectionState::Open => {
                consumer.notify(notification);
                true
            }
            _ => false,
        }
    }

    /// Drop every consumer without calling `on_detach`.
    pub fn close(&mut self) {
        self.main_consumer = None;
        self.consumers.clear();
    }

    pub fn get(&self, consumer_id: &str) -> Option<Arc<dyn SessionConsumer>> {
        self.consumers
            .iter()
            .find(|(id, _)| id == consumer_id)
            .map(|(_, consumer)| consumer.clone())
    }

    pub fn contains(&self, consumer_id: &str) -> bool {
        self.consumers.iter().any(|(id, _)| id == consumer_id)
    }

    pub fn main_consumer(&self) -> Option<Arc<dyn SessionConsumer>> {
        self.main_consumer.as_deref().and_then(|id| self.get(id))
    }

    pub fn main_consumer_id(&self) -> Option<&str> {
        self.main_consumer.as_deref()
    }

    pub fn consumer_ids(&self) -> Vec<ConsumerId> {
        self.consumers.iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }
}
