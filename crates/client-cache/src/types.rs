//! Cache keys, accounts and account diffs.

use crate::{CacheError, CacheResult};
use secret_store::StoreKeys;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Identifies one logical token client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheKey {
    pub client_id: String,
    pub authority: String,
}

impl CacheKey {
    pub fn new(client_id: impl Into<String>, authority: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            authority: authority.into(),
        }
    }

    /// Stable string form: `{"clientId":"…","authority":"…"}`.
    ///
    /// Field order is fixed so every process derives the same storage key.
    pub fn canonical(&self) -> String {
        format!(
            "{{\"clientId\":{},\"authority\":{}}}",
            serde_json::Value::String(self.client_id.clone()),
            serde_json::Value::String(self.authority.clone())
        )
    }

    /// Parse a canonical string back into a key.
    pub fn parse_canonical(canonical: &str) -> CacheResult<Self> {
        serde_json::from_str(canonical)
            .map_err(|e| CacheError::CorruptState(format!("invalid cache key {canonical:?}: {e}")))
    }

    /// Shared-store key holding this client's serialized cache.
    pub fn storage_key(&self) -> String {
        format!("{}{}", StoreKeys::CACHE_PREFIX, self.canonical())
    }

    /// Whether `key` names a client cache blob.
    pub fn is_storage_key(key: &str) -> bool {
        key.starts_with(StoreKeys::CACHE_PREFIX)
    }

    /// Decode a shared-store key produced by [`CacheKey::storage_key`].
    pub fn from_storage_key(key: &str) -> CacheResult<Self> {
        let canonical = key.strip_prefix(StoreKeys::CACHE_PREFIX).ok_or_else(|| {
            CacheError::CorruptState(format!("{key:?} is not a client cache key"))
        })?;
        Self::parse_canonical(canonical)
    }

    /// Memento key recording the last explicit account removal.
    pub fn removal_key(&self) -> String {
        format!(
            "{}{}:{}",
            StoreKeys::LAST_REMOVAL_PREFIX,
            self.client_id,
            self.authority
        )
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.client_id, self.authority)
    }
}

/// A signed-in account as reported by a token client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    /// Stable identity; diffs compare accounts by this field only.
    pub home_account_id: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
}

impl Account {
    pub fn new(home_account_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            home_account_id: home_account_id.into(),
            username: username.into(),
            name: None,
            tenant_id: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }
}

/// Accounts that appeared and disappeared between two snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountChange {
    pub added: Vec<Account>,
    pub deleted: Vec<Account>,
}

impl AccountChange {
    /// Identity-based set difference of two snapshots.
    pub fn between(old: &[Account], new: &[Account]) -> Self {
        let old_ids: HashSet<&str> = old.iter().map(|a| a.home_account_id.as_str()).collect();
        let new_ids: HashSet<&str> = new.iter().map(|a| a.home_account_id.as_str()).collect();

        Self {
            added: new
                .iter()
                .filter(|a| !old_ids.contains(a.home_account_id.as_str()))
                .cloned()
                .collect(),
            deleted: old
                .iter()
                .filter(|a| !new_ids.contains(a.home_account_id.as_str()))
                .cloned()
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.deleted.is_empty()
    }
}
