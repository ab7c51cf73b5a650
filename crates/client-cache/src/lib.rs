//! Cross-process token cache synchronization.
//!
//! Several processes share one secret store. Each logical token client
//! (client ID + authority) keeps its serialized cache under its own key, and
//! every process must notice when another one changed it.
//!
//! - [`CachePersistenceAdapter`]: loads and saves one blob, skips writes that
//!   change nothing and tells its own writes apart from foreign ones
//! - [`CachedClientEntity`]: one token client plus its account snapshot;
//!   turns blob changes into [`AccountChange`] events
//! - [`CachedClientEntityManager`]: registry of entities, persisted under
//!   the known-clients key and reconciled with other processes' writes
//!
//! # Example
//!
//! ```ignore
//! let manager = CachedClientEntityManager::new(store, memento, factory, sink, EntityOptions::default());
//! manager.initialize().await?;
//! let entity = manager.get_or_create("client", "https://login.microsoftonline.com/organizations").await?;
//! for account in entity.accounts()? {
//!     println!("{}", account.username);
//! }
//! ```

mod client;
mod entity;
mod error;
mod manager;
mod memory_client;
mod persistence;
pub mod scopes;
mod sink;
mod types;

#[cfg(test)]
mod tests;

pub use client::{
    AuthenticationResult, CachePersistence, InteractiveRequest, RedirectMode, SilentRequest,
    TokenClient, TokenClientFactory,
};
pub use entity::{CachedClientEntity, EntityOptions, EntityState, InteractiveOptions};
pub use error::{CacheError, CacheResult, ClientError};
pub use manager::CachedClientEntityManager;
pub use memory_client::{
    CachedAccount, InMemoryTokenClient, InMemoryTokenClientFactory, SignInScript,
    TokenCacheDocument,
};
pub use persistence::{CachePersistenceAdapter, PersistenceEvent};
pub use scopes::{authority_for, ScopeRequest};
pub use sink::{AccountChangeEvent, AccountChangeSink, NullSink, RecordingSink};
pub use types::{Account, AccountChange, CacheKey};
