//! Stop waiting on an operation without aborting it.
//!
//! The operation is spawned onto the runtime. When cancellation or the
//! deadline wins, the caller gets its error right away and the operation
//! keeps running detached; its eventual result is dropped.

use crate::RaceError;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Await `operation`, giving up with [`RaceError::TimedOut`] after `timeout`.
pub async fn race_timeout<T, E, Fut>(operation: Fut, timeout: Duration) -> Result<T, RaceError<E>>
where
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    race(operation, None, Some(timeout)).await
}

/// Await `operation`, giving up with [`RaceError::Cancelled`] once `token`
/// is cancelled. An already-cancelled token fails immediately.
pub async fn race_cancellation<T, E, Fut>(
    operation: Fut,
    token: &CancellationToken,
) -> Result<T, RaceError<E>>
where
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    race(operation, Some(token), None).await
}

/// Both of the above. Cancellation is checked before the deadline.
pub async fn race_cancellation_and_timeout<T, E, Fut>(
    operation: Fut,
    token: &CancellationToken,
    timeout: Duration,
) -> Result<T, RaceError<E>>
where
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    race(operation, Some(token), Some(timeout)).await
}

async fn race<T, E, Fut>(
    operation: Fut,
    token: Option<&CancellationToken>,
    timeout: Option<Duration>,
) -> Result<T, RaceError<E>>
where
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    if token.is_some_and(CancellationToken::is_cancelled) {
        return Err(RaceError::Cancelled);
    }

    let mut handle = tokio::spawn(operation);

    let cancelled = async {
        match token {
            Some(token) => token.cancelled().await,
            None => std::future::pending().await,
        }
    };
    let deadline = async {
        match timeout {
            Some(timeout) => tokio::time::sleep(timeout).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        biased;
        _ = cancelled => {
            debug!("Stopped waiting on operation: cancelled");
            Err(RaceError::Cancelled)
        }
        joined = &mut handle => match joined {
            Ok(result) => result.map_err(RaceError::Failed),
            Err(err) => Err(join_failure(err)),
        },
        _ = deadline => {
            debug!(?timeout, "Stopped waiting on operation: timed out");
            Err(RaceError::TimedOut)
        }
    }
}

fn join_failure<E>(err: JoinError) -> RaceError<E> {
    if err.is_cancelled() {
        return RaceError::Cancelled;
    }
    let panic = err.into_panic();
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    RaceError::Panicked(message)
}
