//! Externally settled one-shot values.

use crate::{AsyncError, AsyncResult};
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone)]
enum Outcome<T> {
    Resolved(T),
    Rejected(AsyncError),
}

/// A value that some other party settles exactly once.
///
/// The first of [`resolve`](Self::resolve), [`reject`](Self::reject) or
/// [`cancel`](Self::cancel) wins; later calls return `false` and change
/// nothing. Any number of waiters may observe the outcome, before or after
/// it is settled.
#[derive(Debug)]
pub struct SettlablePromise<T> {
    state: Arc<watch::Sender<Option<Outcome<T>>>>,
}

impl<T> Clone for SettlablePromise<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T: Clone + Send + Sync> SettlablePromise<T> {
    pub fn new() -> Self {
        let (state, _) = watch::channel(None);
        Self {
            state: Arc::new(state),
        }
    }

    pub fn resolve(&self, value: T) -> bool {
        self.settle(Outcome::Resolved(value))
    }

    pub fn reject(&self, error: AsyncError) -> bool {
        self.settle(Outcome::Rejected(error))
    }

    /// Reject with [`AsyncError::Cancelled`].
    pub fn cancel(&self) -> bool {
        self.reject(AsyncError::Cancelled)
    }

    fn settle(&self, outcome: Outcome<T>) -> bool {
        let mut pending = Some(outcome);
        self.state.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = pending.take();
            true
        })
    }

    pub fn is_settled(&self) -> bool {
        self.state.borrow().is_some()
    }

    pub fn is_resolved(&self) -> bool {
        matches!(*self.state.borrow(), Some(Outcome::Resolved(_)))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(*self.state.borrow(), Some(Outcome::Rejected(_)))
    }

    /// The resolved value, if any.
    pub fn value(&self) -> Option<T> {
        match &*self.state.borrow() {
            Some(Outcome::Resolved(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// Wait for the promise to settle.
    pub async fn wait(&self) -> AsyncResult<T> {
        let mut receiver = self.state.subscribe();
        let settled = receiver.wait_for(Option::is_some).await;
        match settled.as_deref() {
            Ok(Some(Outcome::Resolved(value))) => Ok(value.clone()),
            Ok(Some(Outcome::Rejected(error))) => Err(error.clone()),
            // The sender is owned by `self`; it cannot close while we wait.
            Ok(None) | Err(_) => Err(AsyncError::Cancelled),
        }
    }
}

impl<T: Clone + Send + Sync> Default for SettlablePromise<T> {
    fn default() -> Self {
        Self::new()
    }
}
