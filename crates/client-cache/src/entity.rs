//! One live token client and its account snapshot.

use crate::{
    Account, AccountChange, AccountChangeEvent, AccountChangeSink, AuthenticationResult,
    CacheError, CacheKey, CachePersistence, CachePersistenceAdapter, CacheResult,
    InteractiveRequest, PersistenceEvent, RedirectMode, SilentRequest, TokenClient,
    TokenClientFactory,
};
use async_coordination::{
    race_cancellation_and_timeout, race_timeout, CancellationToken, KeyedSequencer, RaceError,
};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use secret_store::{Memento, SharedSecretStore};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Per-entity behavior switches.
#[derive(Debug, Clone)]
pub struct EntityOptions {
    /// Emit an event after refreshes that changed nothing.
    pub emit_empty_diffs: bool,
}

impl Default for EntityOptions {
    fn default() -> Self {
        Self {
            emit_empty_diffs: true,
        }
    }
}

/// Lifecycle of a [`CachedClientEntity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    Uninitialized,
    Ready,
    /// A reload is in flight; readers still see the previous snapshot.
    Refreshing,
    /// Evicted from its manager; refreshes do nothing.
    Retired,
}

/// Options for an interactive sign-in.
#[derive(Debug, Clone)]
pub struct InteractiveOptions {
    pub redirect: RedirectMode,
    pub timeout: Duration,
    pub cancellation: Option<CancellationToken>,
    pub login_hint: Option<String>,
}

impl Default for InteractiveOptions {
    fn default() -> Self {
        Self {
            redirect: RedirectMode::Loopback,
            timeout: Duration::from_secs(300),
            cancellation: None,
            login_hint: None,
        }
    }
}

struct ClientSlot {
    client: Arc<dyn TokenClient>,
    created_at: DateTime<Utc>,
}

/// Owns one token client, its persistence adapter and the last account list.
pub struct CachedClientEntity {
    key: CacheKey,
    adapter: Arc<CachePersistenceAdapter>,
    factory: Arc<dyn TokenClientFactory>,
    memento: Arc<dyn Memento>,
    sink: Arc<dyn AccountChangeSink>,
    sequencer: KeyedSequencer<String>,
    options: EntityOptions,
    client: RwLock<ClientSlot>,
    accounts: RwLock<Vec<Account>>,
    state: Mutex<EntityState>,
    initialized: OnceCell<()>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl CachedClientEntity {
    /// Build the entity and start reacting to changes of its blob.
    ///
    /// The entity is not usable until [`initialize`](Self::initialize) completes.
    pub fn new(
        key: CacheKey,
        store: Arc<dyn SharedSecretStore>,
        memento: Arc<dyn Memento>,
        factory: Arc<dyn TokenClientFactory>,
        sink: Arc<dyn AccountChangeSink>,
        sequencer: KeyedSequencer<String>,
        options: EntityOptions,
    ) -> Arc<Self> {
        let adapter = CachePersistenceAdapter::new(key.clone(), store, sequencer.clone());
        let client = factory.create(&key, adapter.clone() as Arc<dyn CachePersistence>);
        let events = adapter.subscribe();

        let entity = Arc::new(Self {
            key,
            adapter,
            factory,
            memento,
            sink,
            sequencer,
            options,
            client: RwLock::new(ClientSlot {
                client,
                created_at: Utc::now(),
            }),
            accounts: RwLock::new(Vec::new()),
            state: Mutex::new(EntityState::Uninitialized),
            initialized: OnceCell::new(),
            listener: Mutex::new(None),
        });

        let handle = tokio::spawn(refresh_on_change(Arc::downgrade(&entity), events));
        *entity.listener.lock() = Some(handle);
        entity
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn state(&self) -> EntityState {
        *self.state.lock()
    }

    /// When the current token client was built.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.client.read().created_at
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.initialized()
    }

    /// The current token client.
    pub fn client(&self) -> Arc<dyn TokenClient> {
        self.client.read().client.clone()
    }

    /// Last committed account snapshot.
    pub fn accounts(&self) -> CacheResult<Vec<Account>> {
        if !self.is_initialized() {
            return Err(CacheError::NotInitialized(format!("client cache {}", self.key)));
        }
        Ok(self.accounts.read().clone())
    }

    /// Run the first refresh. Concurrent and repeated calls share one run.
    pub async fn initialize(&self) -> CacheResult<()> {
        self.initialized
            .get_or_try_init(|| async {
                self.refresh().await?;
                info!(key = %self.key, "Client cache initialized");
                Ok::<(), CacheError>(())
            })
            .await?;
        Ok(())
    }

    /// Reload accounts from the token client and emit the difference.
    pub async fn refresh(&self) -> CacheResult<AccountChange> {
        self.sequencer
            .run(self.refresh_slot(), || self.refresh_now())
            .await
    }

    async fn refresh_now(&self) -> CacheResult<AccountChange> {
        let previous = {
            let mut state = self.state.lock();
            if *state == EntityState::Retired {
                debug!(key = %self.key, "Skipping refresh of retired client cache");
                return Ok(AccountChange::default());
            }
            std::mem::replace(&mut *state, EntityState::Refreshing)
        };

        let accounts = match self.load_accounts().await {
            Ok(accounts) => accounts,
            Err(e) => {
                *self.state.lock() = previous;
                return Err(e);
            }
        };

        let change = {
            let mut snapshot = self.accounts.write();
            let change = AccountChange::between(&snapshot, &accounts);
            *snapshot = accounts;
            change
        };
        *self.state.lock() = EntityState::Ready;

        debug!(
            key = %self.key,
            added = change.added.len(),
            deleted = change.deleted.len(),
            "Refreshed client cache"
        );
        self.publish(&change);
        Ok(change)
    }

    async fn load_accounts(&self) -> CacheResult<Vec<Account>> {
        self.apply_forced_reset().await?;
        let client = self.client();
        Ok(client.get_all_accounts().await?)
    }

    /// Rebuild the token client if an account was removed after it was built.
    ///
    /// A stale in-memory client could otherwise write a removed account back.
    async fn apply_forced_reset(&self) -> CacheResult<()> {
        let Some(removed_at) = self.last_removal().await? else {
            return Ok(());
        };
        if removed_at <= self.created_at() {
            return Ok(());
        }

        let client = self
            .factory
            .create(&self.key, self.adapter.clone() as Arc<dyn CachePersistence>);
        *self.client.write() = ClientSlot {
            client,
            created_at: Utc::now(),
        };
        info!(key = %self.key, %removed_at, "Rebuilt token client after account removal");
        Ok(())
    }

    async fn last_removal(&self) -> CacheResult<Option<DateTime<Utc>>> {
        let value = self.memento.get(&self.key.removal_key()).await?;
        let Some(value) = value else {
            return Ok(None);
        };

        match value.as_str().map(DateTime::parse_from_rfc3339) {
            Some(Ok(timestamp)) => Ok(Some(timestamp.with_timezone(&Utc))),
            _ => {
                warn!(key = %self.key, %value, "Ignoring unreadable removal timestamp");
                Ok(None)
            }
        }
    }

    fn publish(&self, change: &AccountChange) {
        if change.is_empty() && !self.options.emit_empty_diffs {
            return;
        }
        self.sink.emit(AccountChangeEvent {
            key: self.key.clone(),
            change: change.clone(),
        });
    }

    /// Remove `account` from the token cache.
    ///
    /// Emits nothing directly; the store notification for the rewritten
    /// blob drives the refresh that reports the deletion.
    pub async fn remove_account(&self, account: &Account) -> CacheResult<()> {
        self.memento
            .update(
                &self.key.removal_key(),
                serde_json::Value::String(Utc::now().to_rfc3339()),
            )
            .await?;

        let client = self.client();
        client.remove_account(account).await?;
        info!(key = %self.key, account = %account.username, "Removed account");
        Ok(())
    }

    pub async fn acquire_token_silent(
        &self,
        account: &Account,
        scopes: &[String],
    ) -> CacheResult<AuthenticationResult> {
        let client = self.client();
        let request = SilentRequest {
            account: account.clone(),
            scopes: scopes.to_vec(),
            force_refresh: false,
        };
        Ok(client.acquire_token_silent(request).await?)
    }

    /// Interactive sign-in, raced against the options' deadline and token.
    ///
    /// A loopback failure is retried once through the URI handler. The
    /// abandoned attempt keeps running in the background.
    pub async fn acquire_token_interactive(
        &self,
        scopes: &[String],
        options: &InteractiveOptions,
    ) -> CacheResult<AuthenticationResult> {
        let result = match self.race_sign_in(scopes, options.redirect, options).await {
            Err(RaceError::Failed(err)) if options.redirect == RedirectMode::Loopback => {
                warn!(key = %self.key, error = %err, "Loopback sign-in failed, retrying with URI handler");
                self.race_sign_in(scopes, RedirectMode::UriHandler, options)
                    .await
            }
            other => other,
        };

        let auth = result?;
        self.refresh().await?;
        Ok(auth)
    }

    async fn race_sign_in(
        &self,
        scopes: &[String],
        redirect: RedirectMode,
        options: &InteractiveOptions,
    ) -> Result<AuthenticationResult, RaceError<crate::ClientError>> {
        let client = self.client();
        let request = InteractiveRequest {
            scopes: scopes.to_vec(),
            redirect,
            login_hint: options.login_hint.clone(),
        };
        let sign_in = async move { client.acquire_token_interactive(request).await };

        match &options.cancellation {
            Some(token) => race_cancellation_and_timeout(sign_in, token, options.timeout).await,
            None => race_timeout(sign_in, options.timeout).await,
        }
    }

    /// Take the entity out of service after its blob was deleted.
    ///
    /// Accounts still in the snapshot are reported as deleted.
    pub async fn retire(&self) {
        self.sequencer
            .run(self.refresh_slot(), || async {
                let previous = std::mem::replace(&mut *self.state.lock(), EntityState::Retired);
                if previous == EntityState::Retired {
                    return;
                }
                let remaining = std::mem::take(&mut *self.accounts.write());
                if !remaining.is_empty() {
                    self.publish(&AccountChange {
                        added: Vec::new(),
                        deleted: remaining,
                    });
                }
                info!(key = %self.key, "Retired client cache");
            })
            .await;
        self.stop();
    }

    /// Stop reacting to store changes.
    pub fn stop(&self) {
        if let Some(handle) = self.listener.lock().take() {
            handle.abort();
        }
        self.adapter.stop();
    }

    fn refresh_slot(&self) -> String {
        format!("refresh:{}", self.key.canonical())
    }
}

impl Drop for CachedClientEntity {
    fn drop(&mut self) {
        if let Some(handle) = self.listener.lock().take() {
            handle.abort();
        }
    }
}

async fn refresh_on_change(
    entity: Weak<CachedClientEntity>,
    mut events: broadcast::Receiver<PersistenceEvent>,
) {
    loop {
        match events.recv().await {
            Ok(event) => debug!(?event, "Persistence event"),
            Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => break,
        }

        let Some(entity) = entity.upgrade() else {
            break;
        };
        if let Err(e) = entity.refresh().await {
            warn!(key = %entity.key, error = %e, "Refresh after cache change failed");
        }
    }
}
