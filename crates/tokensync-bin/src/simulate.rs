//! Several processes sharing one in-memory secret store.
//!
//! Every simulated process gets its own manager, token-client factory and
//! memento, exactly as separate OS processes would, and only the store is
//! shared between them.

use std::sync::Arc;
use std::time::Duration;

use client_cache::{
    authority_for, Account, AccountChangeEvent, AccountChangeSink, CacheKey,
    CachedClientEntityManager, EntityOptions, InMemoryTokenClientFactory, InteractiveOptions,
};
use secret_store::{MemoryMemento, MemoryStore};
use tokensync_config_and_utils::Config;
use tracing::{info, warn};

type SimResult<T> = Result<T, Box<dyn std::error::Error>>;

const CONVERGENCE_TIMEOUT: Duration = Duration::from_secs(5);
const SIGN_IN_SCOPES: [&str; 1] = ["user.read"];

/// Logs every account change a process observes.
struct LoggingSink {
    process: usize,
}

impl AccountChangeSink for LoggingSink {
    fn emit(&self, event: AccountChangeEvent) {
        if event.change.is_empty() {
            return;
        }
        let added: Vec<&str> = event.change.added.iter().map(|a| a.username.as_str()).collect();
        let deleted: Vec<&str> = event
            .change
            .deleted
            .iter()
            .map(|a| a.username.as_str())
            .collect();
        info!(
            process = self.process,
            key = %event.key,
            ?added,
            ?deleted,
            "Accounts changed"
        );
    }
}

struct SimProcess {
    id: usize,
    factory: Arc<InMemoryTokenClientFactory>,
    manager: Arc<CachedClientEntityManager>,
}

impl SimProcess {
    async fn start(id: usize, store: &MemoryStore, options: EntityOptions) -> SimResult<Self> {
        let factory = Arc::new(InMemoryTokenClientFactory::new());
        let manager = CachedClientEntityManager::new(
            Arc::new(store.clone()),
            Arc::new(MemoryMemento::new()),
            factory.clone(),
            Arc::new(LoggingSink { process: id }),
            options,
        );
        manager.initialize().await?;
        info!(process = id, "Process attached to store");
        Ok(Self {
            id,
            factory,
            manager,
        })
    }

    /// Usernames this process currently sees for `key`, if it knows the key.
    fn usernames(&self, key: &CacheKey) -> Option<Vec<String>> {
        let entity = self
            .manager
            .get(&key.client_id, &key.authority)
            .ok()
            .flatten()?;
        let mut names: Vec<String> = entity
            .accounts()
            .ok()?
            .into_iter()
            .map(|account| account.username)
            .collect();
        names.sort();
        Some(names)
    }
}

/// Run the simulation: sign in through the first process, wait for the rest
/// to converge, then sign everyone out and wait for every process to evict.
pub async fn run(config: &Config, processes: usize, usernames: &[String]) -> SimResult<()> {
    let processes = processes.max(1);
    let store = MemoryStore::new();
    let options = EntityOptions {
        emit_empty_diffs: config.emit_empty_diffs,
    };

    let mut sims = Vec::with_capacity(processes);
    for id in 0..processes {
        sims.push(SimProcess::start(id, &store, options.clone()).await?);
    }

    let authority = authority_for(&config.authority_host()?, &config.default_tenant)?;
    let key = CacheKey::new(config.default_client_id.clone(), authority.to_string());
    let scopes: Vec<String> = SIGN_IN_SCOPES.iter().map(|s| s.to_string()).collect();
    let interactive = InteractiveOptions {
        timeout: config.interactive_timeout(),
        ..InteractiveOptions::default()
    };

    let leader = &sims[0];
    let entity = leader
        .manager
        .get_or_create(&key.client_id, &key.authority)
        .await?;

    let mut expected: Vec<String> = Vec::new();
    for username in usernames {
        let account = Account::new(format!("{username}-home"), username.clone());
        leader.factory.script().push_account(account);
        let result = entity.acquire_token_interactive(&scopes, &interactive).await?;
        info!(process = leader.id, account = %result.account.username, "Signed in");
        expected.push(result.account.username);
    }
    expected.sort();

    wait_for("every process to see the accounts", || {
        sims.iter()
            .all(|sim| sim.usernames(&key).as_ref() == Some(&expected))
    })
    .await?;

    if let Some(first) = entity.accounts()?.first() {
        let token = entity.acquire_token_silent(first, &scopes).await?;
        info!(account = %token.account.username, expires_on = %token.expires_on, "Silent token acquired");
    }

    for account in entity.accounts()? {
        entity.remove_account(&account).await?;
    }

    wait_for("every process to evict the cache", || {
        sims.iter().all(|sim| sim.usernames(&key).is_none())
    })
    .await?;

    for sim in &sims {
        sim.manager.shutdown();
    }

    println!("processes:    {processes}");
    println!("store writes: {}", store.write_count());
    println!("store erases: {}", store.delete_count());
    println!("keys left:    {:?}", store.keys());
    Ok(())
}

async fn wait_for(what: &str, condition: impl Fn() -> bool) -> SimResult<()> {
    let poll = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    if tokio::time::timeout(CONVERGENCE_TIMEOUT, poll).await.is_err() {
        warn!(what, "Processes did not converge");
        return Err(format!("timed out waiting for {what}").into());
    }
    Ok(())
}
