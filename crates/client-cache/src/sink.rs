//! Account change delivery.
//!
//! Entities emit an [`AccountChangeEvent`] after every committed refresh.
//! The sink is handed to each entity when it is constructed, so a
//! subscription lives exactly as long as its entity.

use crate::{AccountChange, CacheKey};
use parking_lot::Mutex;

/// Accounts added to or removed from one client cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountChangeEvent {
    pub key: CacheKey,
    pub change: AccountChange,
}

/// Receives account changes from every entity of a manager.
pub trait AccountChangeSink: Send + Sync {
    fn emit(&self, event: AccountChangeEvent);
}

/// Discards every event.
#[derive(Debug, Default)]
pub struct NullSink;

impl AccountChangeSink for NullSink {
    fn emit(&self, _event: AccountChangeEvent) {}
}

impl<F> AccountChangeSink for F
where
    F: Fn(AccountChangeEvent) + Send + Sync,
{
    fn emit(&self, event: AccountChangeEvent) {
        self(event)
    }
}

/// Records every event for tests and simulations.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<AccountChangeEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all recorded events.
    pub fn events(&self) -> Vec<AccountChangeEvent> {
        self.events.lock().clone()
    }

    /// Recorded events for one client cache.
    pub fn events_for(&self, key: &CacheKey) -> Vec<AccountChange> {
        self.events
            .lock()
            .iter()
            .filter(|event| &event.key == key)
            .map(|event| event.change.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AccountChangeSink for RecordingSink {
    fn emit(&self, event: AccountChangeEvent) {
        self.events.lock().push(event);
    }
}
