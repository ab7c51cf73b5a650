//! Storage trait definitions.

use crate::StorageResult;
use async_trait::async_trait;
use tokio::sync::broadcast;

/// A mutation observed on a shared secret store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretChangeEvent {
    /// The key that was stored or deleted.
    pub key: String,
}

/// Key-value secret store shared by several processes.
///
/// Every mutation, including the subscriber's own, is reported on the
/// change stream returned by [`SharedSecretStore::subscribe`].
#[async_trait]
pub trait SharedSecretStore: Send + Sync {
    /// Retrieve a value
    async fn get(&self, key: &str) -> StorageResult<Option<String>>;

    /// Store a value securely
    async fn store(&self, key: &str, value: &str) -> StorageResult<()>;

    /// Delete a value. Returns whether a value was present.
    async fn delete(&self, key: &str) -> StorageResult<bool>;

    /// Check if a key exists
    async fn has(&self, key: &str) -> StorageResult<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Subscribe to the change stream.
    fn subscribe(&self) -> broadcast::Receiver<SecretChangeEvent>;
}

/// Small durable state, not secret, shared across processes.
#[async_trait]
pub trait Memento: Send + Sync {
    /// Read a value.
    async fn get(&self, key: &str) -> StorageResult<Option<serde_json::Value>>;

    /// Write a value.
    async fn update(&self, key: &str, value: serde_json::Value) -> StorageResult<()>;
}
