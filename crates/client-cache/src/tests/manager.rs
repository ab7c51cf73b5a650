//! Registry behavior, known-keys record handling and failure isolation.

use super::{account, eventually, ids, known_keys, Process, AUTHORITY};
use crate::{
    Account, AuthenticationResult, CacheError, CacheKey, CachePersistence,
    CachedClientEntityManager, ClientError, EntityOptions, InMemoryTokenClientFactory,
    InteractiveRequest, RecordingSink, SilentRequest, TokenCacheDocument, TokenClient,
    TokenClientFactory,
};
use async_trait::async_trait;
use secret_store::{MemoryMemento, MemoryStore, SharedSecretStore, StorageError, StoreKeys};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Token clients whose account reads wait until the gate opens.
struct GatedFactory {
    inner: InMemoryTokenClientFactory,
    gate: Arc<Semaphore>,
    entered: Arc<AtomicBool>,
}

impl GatedFactory {
    fn new() -> Self {
        Self {
            inner: InMemoryTokenClientFactory::new(),
            gate: Arc::new(Semaphore::new(0)),
            entered: Arc::new(AtomicBool::new(false)),
        }
    }

    fn open(&self) {
        self.gate.add_permits(Semaphore::MAX_PERMITS);
    }

    fn entered(&self) -> bool {
        self.entered.load(Ordering::SeqCst)
    }
}

impl TokenClientFactory for GatedFactory {
    fn create(
        &self,
        key: &CacheKey,
        persistence: Arc<dyn CachePersistence>,
    ) -> Arc<dyn TokenClient> {
        Arc::new(GatedClient {
            inner: self.inner.create(key, persistence),
            gate: self.gate.clone(),
            entered: self.entered.clone(),
        })
    }
}

struct GatedClient {
    inner: Arc<dyn TokenClient>,
    gate: Arc<Semaphore>,
    entered: Arc<AtomicBool>,
}

#[async_trait]
impl TokenClient for GatedClient {
    async fn get_all_accounts(&self) -> Result<Vec<Account>, ClientError> {
        self.entered.store(true, Ordering::SeqCst);
        drop(self.gate.acquire().await.unwrap());
        self.inner.get_all_accounts().await
    }

    async fn acquire_token_silent(
        &self,
        request: SilentRequest,
    ) -> Result<AuthenticationResult, ClientError> {
        self.inner.acquire_token_silent(request).await
    }

    async fn acquire_token_interactive(
        &self,
        request: InteractiveRequest,
    ) -> Result<AuthenticationResult, ClientError> {
        self.inner.acquire_token_interactive(request).await
    }

    async fn remove_account(&self, account: &Account) -> Result<(), ClientError> {
        self.inner.remove_account(account).await
    }
}

#[tokio::test]
async fn calls_before_initialize_fail_fast() {
    let store = MemoryStore::new();
    let process = Process::attach(&store);

    assert!(matches!(
        process.manager.get_or_create("c1", AUTHORITY).await,
        Err(CacheError::NotInitialized(_))
    ));
    assert!(matches!(
        process.manager.get_all(),
        Err(CacheError::NotInitialized(_))
    ));
    assert!(matches!(
        process.manager.get("c1", AUTHORITY),
        Err(CacheError::NotInitialized(_))
    ));
}

#[tokio::test]
async fn concurrent_get_or_create_shares_one_entity() {
    let store = MemoryStore::new();
    let process = Process::started(&store).await;

    let (first, second) = tokio::join!(
        process.manager.get_or_create("x", "y"),
        process.manager.get_or_create("x", "y")
    );
    let (first, second) = (first.unwrap(), second.unwrap());

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(process.factory.created(), 1);
    assert_eq!(process.manager.get_all().unwrap().len(), 1);
    assert_eq!(known_keys(&store).await, vec![CacheKey::new("x", "y").canonical()]);
}

#[tokio::test]
async fn corrupt_known_keys_record_is_discarded() {
    let store = MemoryStore::new();
    store
        .store(StoreKeys::KNOWN_CLIENTS, "{definitely not an array")
        .await
        .unwrap();

    let process = Process::started(&store).await;

    assert!(process.manager.get_all().unwrap().is_empty());
    assert_eq!(store.get(StoreKeys::KNOWN_CLIENTS).await.unwrap(), None);
}

#[tokio::test]
async fn corrupt_known_key_entries_are_skipped() {
    let store = MemoryStore::new();
    let good = CacheKey::new("c1", AUTHORITY);
    let record = serde_json::json!(["garbage", 5, good.canonical(), good.canonical()]);
    store
        .store(StoreKeys::KNOWN_CLIENTS, &record.to_string())
        .await
        .unwrap();

    let process = Process::started(&store).await;

    let all = process.manager.get_all().unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].key(), &good);
    // The record is rewritten without the bad entries.
    assert_eq!(known_keys(&store).await, vec![good.canonical()]);
}

#[tokio::test]
async fn one_bad_cache_does_not_block_the_rest() {
    let store = MemoryStore::new();
    let good = CacheKey::new("good", AUTHORITY);
    let bad = CacheKey::new("bad", AUTHORITY);

    let blob = TokenCacheDocument::from_accounts(&[account("A")])
        .to_blob()
        .unwrap();
    store.store(&good.storage_key(), &blob).await.unwrap();
    store.store(&bad.storage_key(), "{corrupt").await.unwrap();
    let record = serde_json::json!([good.canonical(), bad.canonical()]);
    store
        .store(StoreKeys::KNOWN_CLIENTS, &record.to_string())
        .await
        .unwrap();

    let process = Process::started(&store).await;

    let all = process.manager.get_all().unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].key(), &good);
    assert_eq!(ids(&all[0].accounts().unwrap()), vec!["A"]);
    // The bad blob is still there for other processes, so its key stays listed.
    assert_eq!(
        known_keys(&store).await,
        vec![bad.canonical(), good.canonical()]
    );
}

#[tokio::test]
async fn unreadable_store_fails_initialize() {
    let store = MemoryStore::new();
    let process = Process::attach(&store);

    store.set_fail_reads(true);
    assert!(matches!(
        process.manager.initialize().await,
        Err(CacheError::StoreIo(StorageError::Injected(_)))
    ));
    assert!(!process.manager.is_initialized());

    store.set_fail_reads(false);
    process.manager.initialize().await.unwrap();
    assert!(process.manager.is_initialized());
}

#[tokio::test]
async fn failed_creation_is_evicted() {
    let store = MemoryStore::new();
    let process = Process::started(&store).await;

    store.set_fail_reads(true);
    let Err(err) = process.manager.get_or_create("c1", AUTHORITY).await else {
        panic!("creation should fail while the store is unreadable");
    };
    assert!(matches!(err, CacheError::StoreIo(_)));
    store.set_fail_reads(false);

    assert!(process.manager.get("c1", AUTHORITY).unwrap().is_none());
    assert!(known_keys(&store).await.is_empty());

    // A later attempt starts from scratch.
    let entity = process.manager.get_or_create("c1", AUTHORITY).await.unwrap();
    assert!(entity.is_initialized());
    assert_eq!(process.factory.created(), 2);
}

#[tokio::test]
async fn changes_before_initialize_are_ignored() {
    let store = MemoryStore::new();
    let process = Process::attach(&store);

    let key = CacheKey::new("c2", "a");
    let blob = TokenCacheDocument::from_accounts(&[account("A")])
        .to_blob()
        .unwrap();
    store.store(&key.storage_key(), &blob).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(process.factory.created(), 0);
    process.manager.initialize().await.unwrap();
    // Not listed in the known-keys record, so not restored either.
    assert!(process.manager.get_all().unwrap().is_empty());
}

#[tokio::test]
async fn foreign_deletion_of_unknown_key_is_harmless() {
    let store = MemoryStore::new();
    let process = Process::started(&store).await;
    let entity = process.manager.get_or_create("c1", AUTHORITY).await.unwrap();

    let other = CacheKey::new("c9", "a");
    store.store(&other.storage_key(), "x").await.unwrap();
    store.delete(&other.storage_key()).await.unwrap();

    eventually("foreign cache to come and go", || {
        process.manager.get("c9", "a").unwrap().is_none()
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(process.manager.get("c9", "a").unwrap().is_none());
    assert!(Arc::ptr_eq(
        &process.manager.get("c1", AUTHORITY).unwrap().unwrap(),
        &entity
    ));
}

#[tokio::test]
async fn shutdown_stops_reconciliation() {
    let store = MemoryStore::new();
    let process = Process::started(&store).await;
    process.manager.shutdown();

    let key = CacheKey::new("c2", "a");
    let blob = TokenCacheDocument::from_accounts(&[account("A")])
        .to_blob()
        .unwrap();
    store.store(&key.storage_key(), &blob).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(process.manager.get_all().unwrap().is_empty());
}

#[tokio::test]
async fn known_keys_keep_other_processes_entries() {
    let store = MemoryStore::new();
    let first = Process::started(&store).await;
    let second = Process::started(&store).await;

    first.manager.get_or_create("c1", AUTHORITY).await.unwrap();
    second.manager.get_or_create("c2", AUTHORITY).await.unwrap();

    let c1 = CacheKey::new("c1", AUTHORITY).canonical();
    let c2 = CacheKey::new("c2", AUTHORITY).canonical();
    assert_eq!(known_keys(&store).await, vec![c1.clone(), c2.clone()]);

    // A third process restores both.
    let restarted = Process::started(&store).await;
    let restored: Vec<String> = restarted
        .manager
        .get_all()
        .unwrap()
        .iter()
        .map(|entity| entity.key().canonical())
        .collect();
    assert_eq!(restored, vec![c1, c2]);
}

#[tokio::test]
async fn eviction_only_removes_the_evicted_key() {
    let store = MemoryStore::new();
    let first = Process::started(&store).await;
    let second = Process::started(&store).await;

    let entity = first.manager.get_or_create("c1", AUTHORITY).await.unwrap();
    first.sign_in(&entity, account("A")).await;
    second.manager.get_or_create("c2", AUTHORITY).await.unwrap();
    eventually("second process to see c1", || {
        second.manager.get("c1", AUTHORITY).unwrap().is_some()
    })
    .await;

    entity.remove_account(&account("A")).await.unwrap();
    eventually("both processes to evict c1", || {
        first.manager.get("c1", AUTHORITY).unwrap().is_none()
            && second.manager.get("c1", AUTHORITY).unwrap().is_none()
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(
        known_keys(&store).await,
        vec![CacheKey::new("c2", AUTHORITY).canonical()]
    );
}

#[tokio::test]
async fn caches_created_during_initialize_are_picked_up() {
    let store = MemoryStore::new();
    let first = Process::started(&store).await;
    first.manager.get_or_create("c0", AUTHORITY).await.unwrap();

    // The second process stalls while restoring c0.
    let factory = Arc::new(GatedFactory::new());
    let sink = Arc::new(RecordingSink::new());
    let second = CachedClientEntityManager::new(
        Arc::new(store.clone()),
        Arc::new(MemoryMemento::new()),
        factory.clone(),
        sink.clone(),
        EntityOptions::default(),
    );
    let initializing = {
        let second = second.clone();
        tokio::spawn(async move { second.initialize().await })
    };
    eventually("second process to start restoring", || factory.entered()).await;

    // Meanwhile the first process signs in under a new key.
    let entity = first.manager.get_or_create("c1", AUTHORITY).await.unwrap();
    first.sign_in(&entity, account("A")).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    factory.open();
    initializing.await.unwrap().unwrap();

    eventually("second process to materialize c1", || {
        second
            .get("c1", AUTHORITY)
            .unwrap()
            .and_then(|entity| entity.accounts().ok())
            .is_some_and(|accounts| accounts.len() == 1)
    })
    .await;
    assert_eq!(
        known_keys(&store).await,
        vec![
            CacheKey::new("c0", AUTHORITY).canonical(),
            CacheKey::new("c1", AUTHORITY).canonical(),
        ]
    );
    let added: Vec<Account> = sink
        .events_for(&CacheKey::new("c1", AUTHORITY))
        .into_iter()
        .flat_map(|change| change.added)
        .collect();
    assert_eq!(ids(&added), vec!["A"]);
}
