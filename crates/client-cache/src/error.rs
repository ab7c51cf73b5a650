//! Error types for the client cache layer.

use async_coordination::RaceError;
use secret_store::StorageError;
use thiserror::Error;

/// Errors reported by a [`TokenClient`](crate::TokenClient).
#[derive(Error, Debug)]
pub enum ClientError {
    /// Silent acquisition needs the user to sign in again
    #[error("User interaction required")]
    InteractionRequired,

    /// Interactive sign-in failed
    #[error("Interactive sign-in failed: {0}")]
    Interactive(String),

    /// The account is not in the client's cache
    #[error("Account not found: {0}")]
    AccountNotFound(String),

    /// The cache persistence hooks failed
    #[error("Cache persistence failed: {0}")]
    Persistence(#[source] Box<CacheError>),

    /// The token cache document or a token response was malformed
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl From<CacheError> for ClientError {
    fn from(err: CacheError) -> Self {
        ClientError::Persistence(Box::new(err))
    }
}

/// Error type for cache synchronization operations.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Used before asynchronous initialization completed
    #[error("Not initialized: {0}")]
    NotInitialized(String),

    /// A persisted record could not be parsed
    #[error("Corrupt state: {0}")]
    CorruptState(String),

    /// The shared store failed
    #[error("Store I/O error: {0}")]
    StoreIo(#[from] StorageError),

    /// The token client failed
    #[error("Token client error: {0}")]
    Client(ClientError),

    /// The caller cancelled the operation
    #[error("Operation cancelled")]
    Cancelled,

    /// The operation's deadline passed
    #[error("Operation timed out")]
    TimedOut,

    /// JSON encoding failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<ClientError> for CacheError {
    fn from(err: ClientError) -> Self {
        match err {
            // Surface the store failure behind the client, not the client wrapper.
            ClientError::Persistence(inner) => *inner,
            other => CacheError::Client(other),
        }
    }
}

impl From<RaceError<ClientError>> for CacheError {
    fn from(err: RaceError<ClientError>) -> Self {
        match err {
            RaceError::Cancelled => CacheError::Cancelled,
            RaceError::TimedOut => CacheError::TimedOut,
            RaceError::Panicked(message) => {
                CacheError::Client(ClientError::Interactive(format!("panicked: {message}")))
            }
            RaceError::Failed(err) => err.into(),
        }
    }
}

/// Result type for cache synchronization operations.
pub type CacheResult<T> = Result<T, CacheError>;
