//! Registry of live client caches shared with other processes.

use crate::{
    AccountChangeSink, CacheError, CacheKey, CacheResult, CachedClientEntity, EntityOptions,
    TokenClientFactory,
};
use async_coordination::KeyedSequencer;
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use secret_store::{Memento, SharedSecretStore, StoreKeys};
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Creates, indexes and durably tracks [`CachedClientEntity`]s.
///
/// The registry is persisted under [`StoreKeys::KNOWN_CLIENTS`] so that a
/// restarted process restores every client cache, and the store's change
/// stream is watched so caches created or deleted by other processes show up
/// here too.
pub struct CachedClientEntityManager {
    store: Arc<dyn SharedSecretStore>,
    memento: Arc<dyn Memento>,
    factory: Arc<dyn TokenClientFactory>,
    sink: Arc<dyn AccountChangeSink>,
    options: EntityOptions,
    sequencer: KeyedSequencer<String>,
    entities: RwLock<HashMap<String, Arc<CachedClientEntity>>>,
    initialized: AtomicBool,
    /// Cache changes seen while `initialize` runs, replayed once it is done.
    /// `None` outside of initialization.
    early_changes: Mutex<Option<Vec<CacheKey>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl CachedClientEntityManager {
    /// Create the manager and start watching the store.
    ///
    /// Nothing is loaded until [`initialize`](Self::initialize) runs. Store
    /// changes seen before it starts are ignored; changes seen while it runs
    /// are applied once it completes.
    pub fn new(
        store: Arc<dyn SharedSecretStore>,
        memento: Arc<dyn Memento>,
        factory: Arc<dyn TokenClientFactory>,
        sink: Arc<dyn AccountChangeSink>,
        options: EntityOptions,
    ) -> Arc<Self> {
        let changes = store.subscribe();
        let manager = Arc::new(Self {
            store,
            memento,
            factory,
            sink,
            options,
            sequencer: KeyedSequencer::new(),
            entities: RwLock::new(HashMap::new()),
            initialized: AtomicBool::new(false),
            early_changes: Mutex::new(None),
            listener: Mutex::new(None),
        });

        let handle = tokio::spawn(watch_store(Arc::downgrade(&manager), changes));
        *manager.listener.lock() = Some(handle);
        manager
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Restore every known client cache.
    ///
    /// A key that fails to load is logged and left out; it does not fail
    /// the manager.
    pub async fn initialize(&self) -> CacheResult<()> {
        if self.is_initialized() {
            return Ok(());
        }

        // The record read below may predate caches created while we load.
        self.early_changes.lock().get_or_insert_with(Vec::new);
        let keys = match self.read_known_keys().await {
            Ok(keys) => keys,
            Err(e) => {
                *self.early_changes.lock() = None;
                return Err(e);
            }
        };

        let results = join_all(
            keys.iter()
                .map(|key| self.in_create_slot(key, self.get_or_create_now(key.clone()))),
        )
        .await;

        for (key, result) in keys.iter().zip(results) {
            if let Err(e) = result {
                warn!(key = %key, error = %e, "Failed to restore client cache, skipping");
            }
        }

        let early = {
            let mut early = self.early_changes.lock();
            self.initialized.store(true, Ordering::SeqCst);
            early.take().unwrap_or_default()
        };
        self.replay_changes(early).await;

        let registered: Vec<String> = self.entities.read().keys().cloned().collect();
        self.update_known_keys(registered, Vec::new()).await?;

        info!(count = self.entities.read().len(), "Client cache manager initialized");
        Ok(())
    }

    /// Return the entity for `(client_id, authority)`, creating and
    /// initializing it on first use.
    pub async fn get_or_create(
        &self,
        client_id: &str,
        authority: &str,
    ) -> CacheResult<Arc<CachedClientEntity>> {
        self.ensure_initialized()?;
        let key = CacheKey::new(client_id, authority);

        // Check if entity already exists
        if let Some(entity) = self.lookup(&key) {
            if entity.is_initialized() {
                return Ok(entity);
            }
        }

        self.in_create_slot(&key, self.get_or_create_now(key.clone()))
            .await
    }

    /// Existing entity for `(client_id, authority)`, without creating one.
    pub fn get(
        &self,
        client_id: &str,
        authority: &str,
    ) -> CacheResult<Option<Arc<CachedClientEntity>>> {
        self.ensure_initialized()?;
        Ok(self.lookup(&CacheKey::new(client_id, authority)))
    }

    /// Snapshot of every registered entity, ordered by canonical key.
    pub fn get_all(&self) -> CacheResult<Vec<Arc<CachedClientEntity>>> {
        self.ensure_initialized()?;
        let entities = self.entities.read();
        let mut keys: Vec<&String> = entities.keys().collect();
        keys.sort();
        Ok(keys
            .into_iter()
            .filter_map(|key| entities.get(key).cloned())
            .collect())
    }

    /// Stop watching the store and stop every entity.
    pub fn shutdown(&self) {
        if let Some(handle) = self.listener.lock().take() {
            handle.abort();
        }
        for entity in self.entities.read().values() {
            entity.stop();
        }
        debug!("Client cache manager shut down");
    }

    fn ensure_initialized(&self) -> CacheResult<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(CacheError::NotInitialized(
                "client cache manager".to_string(),
            ))
        }
    }

    fn lookup(&self, key: &CacheKey) -> Option<Arc<CachedClientEntity>> {
        self.entities.read().get(&key.canonical()).cloned()
    }

    /// Run `task` on the per-key construction slot.
    fn in_create_slot<'a, T: 'a>(
        &self,
        key: &CacheKey,
        task: impl Future<Output = T> + 'a,
    ) -> impl Future<Output = T> + 'a {
        self.sequencer
            .run(format!("create:{}", key.canonical()), move || task)
    }

    /// Body of `get_or_create`; must run on the key's construction slot.
    async fn get_or_create_now(&self, key: CacheKey) -> CacheResult<Arc<CachedClientEntity>> {
        if let Some(existing) = self.lookup(&key) {
            existing.initialize().await?;
            return Ok(existing);
        }

        let entity = CachedClientEntity::new(
            key.clone(),
            self.store.clone(),
            self.memento.clone(),
            self.factory.clone(),
            self.sink.clone(),
            self.sequencer.clone(),
            self.options.clone(),
        );
        self.entities
            .write()
            .insert(key.canonical(), entity.clone());
        info!(key = %key, "Registered client cache");

        let ready = async {
            if self.is_initialized() {
                self.update_known_keys(vec![key.canonical()], Vec::new()).await?;
            }
            entity.initialize().await
        };

        if let Err(e) = ready.await {
            warn!(key = %key, error = %e, "Client cache failed to initialize, evicting");
            self.remove_registered(&key, &entity);
            entity.retire().await;
            if self.is_initialized() {
                self.forget_if_absent(&key).await;
            }
            return Err(e);
        }

        Ok(entity)
    }

    /// Body of the deletion path; must run on the key's construction slot.
    async fn evict_now(&self, key: &CacheKey) -> CacheResult<()> {
        let removed = self.entities.write().remove(&key.canonical());
        if let Some(entity) = removed {
            info!(key = %key, "Client cache deleted from store, evicting");
            entity.retire().await;
        }
        self.update_known_keys(Vec::new(), vec![key.canonical()]).await
    }

    /// Drop `key` from the known-keys record if its blob no longer exists.
    async fn forget_if_absent(&self, key: &CacheKey) {
        match self.store.has(&key.storage_key()).await {
            Ok(false) => {
                if let Err(e) = self
                    .update_known_keys(Vec::new(), vec![key.canonical()])
                    .await
                {
                    warn!(key = %key, error = %e, "Failed to update known client caches");
                }
            }
            Ok(true) => {}
            Err(e) => warn!(key = %key, error = %e, "Failed to check client cache"),
        }
    }

    /// Apply changes queued during initialization, once per key.
    async fn replay_changes(&self, changes: Vec<CacheKey>) {
        let mut seen = BTreeSet::new();
        for key in changes {
            if !seen.insert(key.canonical()) {
                continue;
            }
            debug!(key = %key, "Applying store change seen during initialization");
            if let Err(e) = self
                .in_create_slot(&key, self.reconcile_now(key.clone()))
                .await
            {
                warn!(key = %key, error = %e, "Failed to apply store change");
            }
        }
    }

    /// Apply a change of `key`'s blob seen on the store.
    async fn reconcile_now(&self, key: CacheKey) -> CacheResult<()> {
        let present = self.store.has(&key.storage_key()).await?;
        if present {
            self.get_or_create_now(key).await.map(|_| ())
        } else {
            self.evict_now(&key).await
        }
    }

    fn on_store_change(self: &Arc<Self>, storage_key: &str) {
        if !CacheKey::is_storage_key(storage_key) {
            return;
        }

        let key = match CacheKey::from_storage_key(storage_key) {
            Ok(key) => key,
            Err(e) => {
                warn!(key = %storage_key, error = %e, "Ignoring change to unreadable cache key");
                return;
            }
        };

        {
            // `initialize` flips the flag under this lock, so nothing slips between.
            let mut early = self.early_changes.lock();
            if !self.is_initialized() {
                match early.as_mut() {
                    Some(queued) => {
                        debug!(key = %key, "Deferring store change until initialized");
                        queued.push(key);
                    }
                    None => debug!(key = %key, "Ignoring store change before initialization"),
                }
                return;
            }
        }

        // Enter the slot now so changes to one key apply in arrival order.
        let manager = self.clone();
        let slot_key = key.clone();
        let reconcile = self.sequencer.run(
            format!("create:{}", slot_key.canonical()),
            move || async move { manager.reconcile_now(key).await },
        );
        tokio::spawn(async move {
            if let Err(e) = reconcile.await {
                warn!(key = %slot_key, error = %e, "Failed to apply store change");
            }
        });
    }

    fn remove_registered(&self, key: &CacheKey, entity: &Arc<CachedClientEntity>) {
        let mut entities = self.entities.write();
        let canonical = key.canonical();
        if entities
            .get(&canonical)
            .is_some_and(|current| Arc::ptr_eq(current, entity))
        {
            entities.remove(&canonical);
        }
    }

    /// Read the known-keys record. A corrupt record is deleted; corrupt
    /// entries are skipped.
    async fn read_known_keys(&self) -> CacheResult<Vec<CacheKey>> {
        let Some(raw) = self.store.get(StoreKeys::KNOWN_CLIENTS).await? else {
            return Ok(Vec::new());
        };

        match parse_known_keys(&raw) {
            Ok(record) => Ok(record.keys),
            Err(e) => {
                warn!(error = %e, "Known client caches record is corrupt, discarding it");
                self.store.delete(StoreKeys::KNOWN_CLIENTS).await?;
                Ok(Vec::new())
            }
        }
    }

    /// Add `added` to and drop `removed` from the known-keys record.
    ///
    /// Other processes write the same record, so the stored set is re-read
    /// and merged inside the record's slot rather than replaced.
    async fn update_known_keys(
        &self,
        added: Vec<String>,
        removed: Vec<String>,
    ) -> CacheResult<()> {
        self.sequencer
            .run(StoreKeys::KNOWN_CLIENTS.to_string(), || {
                self.merge_known_keys(&added, &removed)
            })
            .await
    }

    async fn merge_known_keys(&self, added: &[String], removed: &[String]) -> CacheResult<()> {
        let current = self.store.get(StoreKeys::KNOWN_CLIENTS).await?;
        let (stored, clean) = match current.as_deref() {
            None => (BTreeSet::new(), true),
            Some(raw) => match parse_known_keys(raw) {
                Ok(record) => (
                    record.keys.iter().map(CacheKey::canonical).collect(),
                    record.clean,
                ),
                Err(_) => (BTreeSet::new(), false),
            },
        };

        let mut merged = stored.clone();
        merged.extend(added.iter().cloned());
        for key in removed {
            merged.remove(key);
        }
        if clean && merged == stored {
            return Ok(());
        }

        let payload = serde_json::to_string(&merged)?;
        self.store.store(StoreKeys::KNOWN_CLIENTS, &payload).await?;
        debug!(
            count = merged.len(),
            added = added.len(),
            removed = removed.len(),
            "Stored known client caches"
        );
        Ok(())
    }
}

/// Parsed known-keys record.
struct KnownKeysRecord {
    /// Valid keys in record order, without duplicates.
    keys: Vec<CacheKey>,
    /// False when entries were skipped or not in canonical form.
    clean: bool,
}

/// Parse the known-keys record. Fails only when the record is not a JSON
/// array; unreadable entries are logged and skipped.
fn parse_known_keys(raw: &str) -> Result<KnownKeysRecord, serde_json::Error> {
    let entries: Vec<serde_json::Value> = serde_json::from_str(raw)?;

    let mut seen = BTreeSet::new();
    let mut keys = Vec::new();
    let mut clean = true;
    for entry in entries {
        let parsed = entry
            .as_str()
            .ok_or_else(|| CacheError::CorruptState(format!("{entry} is not a string")))
            .and_then(|text| CacheKey::parse_canonical(text).map(|key| (text, key)));
        match parsed {
            Ok((text, key)) => {
                let canonical = key.canonical();
                if canonical != text {
                    clean = false;
                }
                if seen.insert(canonical) {
                    keys.push(key);
                } else {
                    clean = false;
                }
            }
            Err(e) => {
                clean = false;
                warn!(error = %e, "Skipping corrupt known client cache entry");
            }
        }
    }
    Ok(KnownKeysRecord { keys, clean })
}

impl Drop for CachedClientEntityManager {
    fn drop(&mut self) {
        if let Some(handle) = self.listener.lock().take() {
            handle.abort();
        }
    }
}

async fn watch_store(
    manager: Weak<CachedClientEntityManager>,
    mut changes: broadcast::Receiver<secret_store::SecretChangeEvent>,
) {
    loop {
        let event = match changes.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Store change stream lagged, some caches may be stale");
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        let Some(manager) = manager.upgrade() else {
            break;
        };
        manager.on_store_change(&event.key);
    }
}
