//! Token client capability.
//!
//! The OAuth protocol lives behind [`TokenClient`]. A client keeps its token
//! cache in memory and calls the [`CachePersistence`] hooks it was built with
//! before reading and after changing that cache.

use crate::{Account, CacheKey, CacheResult, ClientError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Load/save hooks handed to a token client.
#[async_trait]
pub trait CachePersistence: Send + Sync {
    /// Current serialized cache, if any.
    async fn load(&self) -> CacheResult<Option<String>>;

    /// Persist `blob`. `None` means nothing is left worth keeping.
    async fn save_if_changed(&self, blob: Option<String>) -> CacheResult<()>;
}

/// How the interactive flow receives its redirect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RedirectMode {
    /// A local loopback listener.
    Loopback,
    /// The host's URI handler.
    UriHandler,
}

#[derive(Debug, Clone)]
pub struct SilentRequest {
    pub account: Account,
    pub scopes: Vec<String>,
    pub force_refresh: bool,
}

#[derive(Debug, Clone)]
pub struct InteractiveRequest {
    pub scopes: Vec<String>,
    pub redirect: RedirectMode,
    pub login_hint: Option<String>,
}

/// Tokens issued for one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationResult {
    pub account: Account,
    pub access_token: String,
    pub id_token: Option<String>,
    pub scopes: Vec<String>,
    pub expires_on: DateTime<Utc>,
}

#[async_trait]
pub trait TokenClient: Send + Sync {
    async fn get_all_accounts(&self) -> Result<Vec<Account>, ClientError>;

    async fn acquire_token_silent(
        &self,
        request: SilentRequest,
    ) -> Result<AuthenticationResult, ClientError>;

    async fn acquire_token_interactive(
        &self,
        request: InteractiveRequest,
    ) -> Result<AuthenticationResult, ClientError>;

    async fn remove_account(&self, account: &Account) -> Result<(), ClientError>;
}

/// Builds token clients bound to one cache key and its persistence hooks.
pub trait TokenClientFactory: Send + Sync {
    fn create(&self, key: &CacheKey, persistence: Arc<dyn CachePersistence>) -> Arc<dyn TokenClient>;
}
