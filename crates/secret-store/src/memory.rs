//! In-memory store and memento.
//!
//! Cloning a [`MemoryStore`] yields another handle onto the same data and the
//! same change stream, which is how tests model several processes attached
//! to one encrypted store.

use crate::{Memento, SecretChangeEvent, SharedSecretStore, StorageError, StorageResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

/// Capacity of the change stream before slow subscribers start lagging.
const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// One mutation applied to a [`MemoryStore`], in application order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreMutation {
    Stored { key: String, value: String },
    Deleted { key: String },
}

struct MemoryStoreInner {
    data: Mutex<HashMap<String, String>>,
    history: Mutex<Vec<StoreMutation>>,
    changes: broadcast::Sender<SecretChangeEvent>,
    writes: AtomicUsize,
    deletes: AtomicUsize,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    write_delays: Mutex<VecDeque<Duration>>,
}

/// In-memory [`SharedSecretStore`] with write accounting and failure injection.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<MemoryStoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(MemoryStoreInner {
                data: Mutex::new(HashMap::new()),
                history: Mutex::new(Vec::new()),
                changes,
                writes: AtomicUsize::new(0),
                deletes: AtomicUsize::new(0),
                fail_reads: AtomicBool::new(false),
                fail_writes: AtomicBool::new(false),
                write_delays: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Number of successful `store` calls.
    pub fn write_count(&self) -> usize {
        self.inner.writes.load(Ordering::SeqCst)
    }

    /// Number of successful `delete` calls that removed a value.
    pub fn delete_count(&self) -> usize {
        self.inner.deletes.load(Ordering::SeqCst)
    }

    /// Mutations in the order they took effect.
    pub fn history(&self) -> Vec<StoreMutation> {
        self.inner.history.lock().clone()
    }

    /// Snapshot of every key currently stored.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.data.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Make every read fail with [`StorageError::Injected`].
    pub fn set_fail_reads(&self, fail: bool) {
        self.inner.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make every store and delete fail with [`StorageError::Injected`].
    pub fn set_fail_writes(&self, fail: bool) {
        self.inner.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Delay the next mutation by `delay` before it takes effect.
    /// Delays queue up and are consumed one per mutation.
    pub fn delay_next_write(&self, delay: Duration) {
        self.inner.write_delays.lock().push_back(delay);
    }

    async fn before_write(&self, key: &str) -> StorageResult<()> {
        let delay = self.inner.write_delays.lock().pop_front();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.inner.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Injected(format!("write to {key}")));
        }
        Ok(())
    }

    fn notify(&self, key: &str) {
        // No subscribers is not an error.
        let _ = self.inner.changes.send(SecretChangeEvent {
            key: key.to_string(),
        });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedSecretStore for MemoryStore {
    async fn get(&self, key: &str) -> StorageResult<Option<String>> {
        if self.inner.fail_reads.load(Ordering::SeqCst) {
            return Err(StorageError::Injected(format!("read of {key}")));
        }
        Ok(self.inner.data.lock().get(key).cloned())
    }

    async fn store(&self, key: &str, value: &str) -> StorageResult<()> {
        self.before_write(key).await?;
        {
            let mut data = self.inner.data.lock();
            data.insert(key.to_string(), value.to_string());
            self.inner.history.lock().push(StoreMutation::Stored {
                key: key.to_string(),
                value: value.to_string(),
            });
        }
        self.inner.writes.fetch_add(1, Ordering::SeqCst);
        debug!(key = %key, len = value.len(), "Stored secret");
        self.notify(key);
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<bool> {
        self.before_write(key).await?;
        let existed = {
            let mut data = self.inner.data.lock();
            let existed = data.remove(key).is_some();
            if existed {
                self.inner.history.lock().push(StoreMutation::Deleted {
                    key: key.to_string(),
                });
            }
            existed
        };
        if existed {
            self.inner.deletes.fetch_add(1, Ordering::SeqCst);
            debug!(key = %key, "Deleted secret");
            self.notify(key);
        }
        Ok(existed)
    }

    fn subscribe(&self) -> broadcast::Receiver<SecretChangeEvent> {
        self.inner.changes.subscribe()
    }
}

/// In-memory [`Memento`]. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryMemento {
    data: Arc<Mutex<HashMap<String, serde_json::Value>>>,
}

impl MemoryMemento {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Memento for MemoryMemento {
    async fn get(&self, key: &str) -> StorageResult<Option<serde_json::Value>> {
        Ok(self.data.lock().get(key).cloned())
    }

    async fn update(&self, key: &str, value: serde_json::Value) -> StorageResult<()> {
        self.data.lock().insert(key.to_string(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store() {
        let storage = MemoryStore::new();

        storage.store("test_key", "test_value").await.unwrap();
        assert_eq!(
            storage.get("test_key").await.unwrap(),
            Some("test_value".to_string())
        );

        assert!(storage.has("test_key").await.unwrap());
        assert!(!storage.has("nonexistent").await.unwrap());

        assert!(storage.delete("test_key").await.unwrap());
        assert!(!storage.delete("test_key").await.unwrap());
        assert_eq!(storage.get("test_key").await.unwrap(), None);

        assert_eq!(storage.write_count(), 1);
        assert_eq!(storage.delete_count(), 1);
    }

    #[tokio::test]
    async fn test_clones_share_data_and_changes() {
        let process_a = MemoryStore::new();
        let process_b = process_a.clone();
        let mut changes_b = process_b.subscribe();

        process_a.store("pca:x", "blob").await.unwrap();

        assert_eq!(process_b.get("pca:x").await.unwrap(), Some("blob".to_string()));
        let event = changes_b.recv().await.unwrap();
        assert_eq!(event.key, "pca:x");
    }

    #[tokio::test]
    async fn test_delete_of_missing_key_is_silent() {
        let storage = MemoryStore::new();
        let mut changes = storage.subscribe();

        assert!(!storage.delete("missing").await.unwrap());
        assert!(matches!(
            changes.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
        assert!(storage.history().is_empty());
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let storage = MemoryStore::new();
        storage.store("k", "v").await.unwrap();

        storage.set_fail_reads(true);
        assert!(matches!(storage.get("k").await, Err(StorageError::Injected(_))));
        storage.set_fail_reads(false);

        storage.set_fail_writes(true);
        assert!(matches!(storage.store("k", "w").await, Err(StorageError::Injected(_))));
        assert!(matches!(storage.delete("k").await, Err(StorageError::Injected(_))));
        storage.set_fail_writes(false);

        assert_eq!(storage.get("k").await.unwrap(), Some("v".to_string()));
        assert_eq!(storage.write_count(), 1);
    }

    #[tokio::test]
    async fn test_history_records_mutation_order() {
        let storage = MemoryStore::new();
        storage.store("a", "1").await.unwrap();
        storage.store("a", "2").await.unwrap();
        storage.delete("a").await.unwrap();

        assert_eq!(
            storage.history(),
            vec![
                StoreMutation::Stored { key: "a".into(), value: "1".into() },
                StoreMutation::Stored { key: "a".into(), value: "2".into() },
                StoreMutation::Deleted { key: "a".into() },
            ]
        );
        assert!(storage.keys().is_empty());
    }

    #[tokio::test]
    async fn test_memento_roundtrip_and_sharing() {
        let memento = MemoryMemento::new();
        let other = memento.clone();

        assert!(memento.get("missing").await.unwrap().is_none());
        memento
            .update("lastRemoval:c:a", serde_json::json!("2024-01-01T00:00:00Z"))
            .await
            .unwrap();

        assert_eq!(
            other.get("lastRemoval:c:a").await.unwrap(),
            Some(serde_json::json!("2024-01-01T00:00:00Z"))
        );
    }
}
