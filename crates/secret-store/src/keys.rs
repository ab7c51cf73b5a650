//! Storage key constants.

/// Storage keys shared by every process attached to the store.
pub struct StoreKeys;

impl StoreKeys {
    /// Known client caches (JSON array of canonical cache keys)
    pub const KNOWN_CLIENTS: &'static str = "publicClientApplications";

    /// Prefix of per-client serialized token caches
    pub const CACHE_PREFIX: &'static str = "pca:";

    /// Prefix of per-client explicit removal timestamps (memento)
    pub const LAST_REMOVAL_PREFIX: &'static str = "lastRemoval:";
}
