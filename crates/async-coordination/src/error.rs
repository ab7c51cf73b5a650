//! Error types for coordination primitives.

use thiserror::Error;

/// Errors produced by the coordination primitives themselves.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AsyncError {
    /// Cancellation was requested
    #[error("Operation cancelled")]
    Cancelled,

    /// The deadline passed first
    #[error("Operation timed out")]
    TimedOut,

    /// The limiter no longer accepts work
    #[error("Limiter has been disposed")]
    Disposed,

    /// The task was dropped from the backlog before it started
    #[error("Task discarded before it started")]
    Discarded,

    /// A promise was rejected with a caller-supplied reason
    #[error("Rejected: {0}")]
    Rejected(String),
}

/// Result type alias using AsyncError.
pub type AsyncResult<T> = Result<T, AsyncError>;

/// Outcome of racing an operation against cancellation and/or a deadline.
#[derive(Error, Debug)]
pub enum RaceError<E> {
    /// Cancellation was requested before the operation finished
    #[error("Operation cancelled")]
    Cancelled,

    /// The deadline passed before the operation finished
    #[error("Operation timed out")]
    TimedOut,

    /// The operation panicked
    #[error("Operation panicked: {0}")]
    Panicked(String),

    /// The operation finished with its own error
    #[error("{0}")]
    Failed(E),
}

impl<E> RaceError<E> {
    /// True when the observer gave up (cancellation or deadline), as opposed
    /// to the operation failing by itself.
    pub fn is_abandoned(&self) -> bool {
        matches!(self, RaceError::Cancelled | RaceError::TimedOut)
    }
}
