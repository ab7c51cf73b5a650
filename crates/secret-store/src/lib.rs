//! Shared secret storage capabilities.
//!
//! This crate defines what the token cache layer needs from its host:
//! - [`SharedSecretStore`]: an encrypted key-value store shared by several
//!   processes, with a change stream reporting every mutation
//! - [`Memento`]: small durable state used for bookkeeping timestamps
//!
//! Real backends (OS keychains, editor secret storage) live with the host.
//! [`MemoryStore`] and [`MemoryMemento`] are in-process implementations for
//! tests and simulations.

mod keys;
mod memory;
mod traits;

pub use keys::StoreKeys;
pub use memory::{MemoryMemento, MemoryStore, StoreMutation};
pub use traits::{Memento, SecretChangeEvent, SharedSecretStore};

use thiserror::Error;

/// Error type for storage operations.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Failure injected by a test store
    #[error("Injected failure: {0}")]
    Injected(String),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
