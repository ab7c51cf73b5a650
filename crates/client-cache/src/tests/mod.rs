//! Multi-process scenario tests.
//!
//! Every [`Process`] is a manager with its own token clients and memento,
//! attached to a clone of one shared [`MemoryStore`].
//!
//! - `scenarios.rs` - lifecycle scenarios across processes
//! - `entity.rs`    - refresh, diffing, forced reset, interactive sign-in
//! - `manager.rs`   - registry, known-keys record, failure isolation

mod manager;

use crate::{
    Account, AccountChange, CacheKey, CachedClientEntity, CachedClientEntityManager,
    EntityOptions, InMemoryTokenClientFactory, InteractiveOptions, RecordingSink,
};
use secret_store::{MemoryMemento, MemoryStore, SharedSecretStore, StoreKeys};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub(crate) const AUTHORITY: &str = "https://login/org";

/// One process attached to the shared store.
pub(crate) struct Process {
    pub store: MemoryStore,
    pub memento: MemoryMemento,
    pub factory: Arc<InMemoryTokenClientFactory>,
    pub sink: Arc<RecordingSink>,
    pub manager: Arc<CachedClientEntityManager>,
}

impl Process {
    pub fn attach(store: &MemoryStore) -> Self {
        Self::attach_with(store, EntityOptions::default())
    }

    pub fn attach_with(store: &MemoryStore, options: EntityOptions) -> Self {
        let memento = MemoryMemento::new();
        let factory = Arc::new(InMemoryTokenClientFactory::new());
        let sink = Arc::new(RecordingSink::new());
        let manager = CachedClientEntityManager::new(
            Arc::new(store.clone()),
            Arc::new(memento.clone()),
            factory.clone(),
            sink.clone(),
            options,
        );
        Self {
            store: store.clone(),
            memento,
            factory,
            sink,
            manager,
        }
    }

    pub async fn started(store: &MemoryStore) -> Self {
        let process = Self::attach(store);
        process.manager.initialize().await.unwrap();
        process
    }

    /// Sign `account` in through the entity's interactive flow.
    pub async fn sign_in(&self, entity: &CachedClientEntity, account: Account) {
        self.factory.script().push_account(account);
        entity
            .acquire_token_interactive(&["user.read".to_string()], &InteractiveOptions::default())
            .await
            .unwrap();
    }

    /// Non-empty changes recorded for `key`.
    pub fn changes_for(&self, key: &CacheKey) -> Vec<AccountChange> {
        self.sink
            .events_for(key)
            .into_iter()
            .filter(|change| !change.is_empty())
            .collect()
    }
}

/// Poll `condition` until it holds or a generous deadline passes.
pub(crate) async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while !condition() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Canonical keys listed in the known-clients record.
pub(crate) async fn known_keys(store: &MemoryStore) -> Vec<String> {
    match store.get(StoreKeys::KNOWN_CLIENTS).await.unwrap() {
        Some(raw) => serde_json::from_str(&raw).unwrap(),
        None => Vec::new(),
    }
}

pub(crate) fn ids(accounts: &[Account]) -> Vec<&str> {
    let mut ids: Vec<&str> = accounts.iter().map(|a| a.home_account_id.as_str()).collect();
    ids.sort();
    ids
}

pub(crate) fn account(id: &str) -> Account {
    Account::new(id, format!("{}@example.com", id.to_lowercase()))
}

/// Basic workflow across two processes.
#[tokio::test]
async fn basic_workflow() {
    let store = MemoryStore::new();
    let first = Process::started(&store).await;
    let second = Process::started(&store).await;

    // Sign in through the first process
    let entity = first.manager.get_or_create("c1", AUTHORITY).await.unwrap();
    first.sign_in(&entity, account("A")).await;
    assert_eq!(ids(&entity.accounts().unwrap()), vec!["A"]);

    // The second process picks the cache up
    eventually("second process to see the account", || {
        second
            .manager
            .get("c1", AUTHORITY)
            .unwrap()
            .and_then(|entity| entity.accounts().ok())
            .is_some_and(|accounts| accounts.len() == 1)
    })
    .await;

    assert_eq!(
        second.changes_for(entity.key()),
        vec![AccountChange {
            added: vec![account("A")],
            deleted: vec![],
        }]
    );
}
