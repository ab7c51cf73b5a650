//! Persistence adapter between one token client and the shared store.

use crate::{CacheError, CacheKey, CachePersistence, CacheResult};
use async_coordination::KeyedSequencer;
use async_trait::async_trait;
use parking_lot::Mutex;
use secret_store::SharedSecretStore;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Raised by the adapter after it re-reads its key on a store notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistenceEvent {
    /// The stored value differs from what this adapter last wrote or reported.
    ChangedExternally,
    /// The stored value is what this adapter last wrote or reported.
    OwnWriteObserved,
}

/// What the adapter believes the store holds for its key.
#[derive(Debug, Clone, PartialEq, Eq)]
enum KnownValue {
    Unknown,
    Known(Option<String>),
}

/// Serializes one entity's loads and saves and detects foreign writes.
///
/// Every store access goes through the shared sequencer under the entity's
/// storage key, so a save never interleaves with a load of the same blob.
pub struct CachePersistenceAdapter {
    key: CacheKey,
    storage_key: String,
    store: Arc<dyn SharedSecretStore>,
    sequencer: KeyedSequencer<String>,
    /// Last value loaded from or written to the store. Drives write suppression.
    last_known: Mutex<KnownValue>,
    /// Last value written or reported through an event.
    last_notified: Mutex<KnownValue>,
    events: broadcast::Sender<PersistenceEvent>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl CachePersistenceAdapter {
    /// Create the adapter and start watching the store for its key.
    pub fn new(
        key: CacheKey,
        store: Arc<dyn SharedSecretStore>,
        sequencer: KeyedSequencer<String>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(16);
        let changes = store.subscribe();
        let adapter = Arc::new(Self {
            storage_key: key.storage_key(),
            key,
            store,
            sequencer,
            last_known: Mutex::new(KnownValue::Unknown),
            last_notified: Mutex::new(KnownValue::Unknown),
            events,
            listener: Mutex::new(None),
        });

        let handle = tokio::spawn(watch_store(Arc::downgrade(&adapter), changes));
        *adapter.listener.lock() = Some(handle);
        adapter
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn storage_key(&self) -> &str {
        &self.storage_key
    }

    /// Subscribe to change notifications for this adapter's key.
    pub fn subscribe(&self) -> broadcast::Receiver<PersistenceEvent> {
        self.events.subscribe()
    }

    /// Read the blob from the store.
    pub async fn load(&self) -> CacheResult<Option<String>> {
        self.sequencer
            .run(self.storage_key.clone(), || async {
                match self.store.get(&self.storage_key).await {
                    Ok(value) => {
                        debug!(
                            key = %self.key,
                            present = value.is_some(),
                            "Loaded client cache"
                        );
                        *self.last_known.lock() = KnownValue::Known(value.clone());
                        Ok(value)
                    }
                    Err(e) => {
                        *self.last_known.lock() = KnownValue::Unknown;
                        Err(CacheError::from(e))
                    }
                }
            })
            .await
    }

    /// Write `blob` unless it equals the last known value. `None` deletes the key.
    pub async fn save_if_changed(&self, blob: Option<String>) -> CacheResult<()> {
        self.sequencer
            .run(self.storage_key.clone(), || async {
                let target = KnownValue::Known(blob.clone());
                let unchanged = *self.last_known.lock() == target;
                if unchanged {
                    debug!(key = %self.key, "Client cache unchanged, skipping write");
                    return Ok(());
                }

                // Record before writing so the resulting notification reads as our own.
                *self.last_known.lock() = target.clone();
                *self.last_notified.lock() = target;

                let result = match &blob {
                    Some(value) => self.store.store(&self.storage_key, value).await,
                    None => self.store.delete(&self.storage_key).await.map(|_| ()),
                };

                match result {
                    Ok(()) => {
                        debug!(key = %self.key, deleted = blob.is_none(), "Saved client cache");
                        Ok(())
                    }
                    Err(e) => {
                        // The write may or may not have landed.
                        *self.last_known.lock() = KnownValue::Unknown;
                        *self.last_notified.lock() = KnownValue::Unknown;
                        warn!(key = %self.key, error = %e, "Failed to save client cache");
                        Err(CacheError::from(e))
                    }
                }
            })
            .await
    }

    /// Stop watching the store.
    pub fn stop(&self) {
        if let Some(handle) = self.listener.lock().take() {
            handle.abort();
        }
    }

    /// Re-read the key and report whether the value moved under us.
    async fn check_for_change(&self) {
        let current = self
            .sequencer
            .run(self.storage_key.clone(), || async {
                self.store.get(&self.storage_key).await
            })
            .await;

        let current = match current {
            Ok(value) => KnownValue::Known(value),
            Err(e) => {
                warn!(key = %self.key, error = %e, "Failed to re-read client cache after change");
                return;
            }
        };

        *self.last_known.lock() = current.clone();
        let event = {
            let mut notified = self.last_notified.lock();
            if *notified == current {
                PersistenceEvent::OwnWriteObserved
            } else {
                *notified = current;
                PersistenceEvent::ChangedExternally
            }
        };

        debug!(key = %self.key, ?event, "Client cache change observed");
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }
}

impl Drop for CachePersistenceAdapter {
    fn drop(&mut self) {
        self.stop();
    }
}

#[async_trait]
impl CachePersistence for CachePersistenceAdapter {
    async fn load(&self) -> CacheResult<Option<String>> {
        CachePersistenceAdapter::load(self).await
    }

    async fn save_if_changed(&self, blob: Option<String>) -> CacheResult<()> {
        CachePersistenceAdapter::save_if_changed(self, blob).await
    }
}

async fn watch_store(
    adapter: Weak<CachePersistenceAdapter>,
    mut changes: broadcast::Receiver<secret_store::SecretChangeEvent>,
) {
    loop {
        let relevant = match changes.recv().await {
            Ok(event) => adapter
                .upgrade()
                .map(|adapter| event.key == adapter.storage_key),
            // Missed events might include ours; check anyway.
            Err(RecvError::Lagged(skipped)) => {
                debug!(skipped, "Store change stream lagged");
                Some(true)
            }
            Err(RecvError::Closed) => break,
        };

        match relevant {
            None => break,
            Some(false) => continue,
            Some(true) => {}
        }

        let Some(adapter) = adapter.upgrade() else {
            break;
        };
        adapter.check_for_change().await;
    }
}
