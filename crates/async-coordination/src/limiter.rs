//! Bounded-parallelism task limiter.

use crate::{AsyncError, AsyncResult};
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{oneshot, watch};
use tracing::warn;

type TaskFactory<T> = Box<dyn FnOnce() -> BoxFuture<'static, T> + Send>;

struct Pending<T> {
    factory: TaskFactory<T>,
    reply: oneshot::Sender<T>,
}

struct LimiterState<T> {
    running: usize,
    backlog: VecDeque<Pending<T>>,
    disposed: bool,
}

struct LimiterInner<T> {
    max_parallelism: usize,
    state: Mutex<LimiterState<T>>,
    /// Outstanding (running + queued) task count.
    size: watch::Sender<usize>,
}

/// Runs queued task factories with at most N in flight.
///
/// Tasks start eagerly on the current tokio runtime in FIFO order; the
/// [`LimitedTask`] handle only observes the result. Dropping the handle does
/// not cancel the task.
pub struct Limiter<T> {
    inner: Arc<LimiterInner<T>>,
}

impl<T> Clone for Limiter<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> Limiter<T> {
    /// Create a limiter running at most `max_parallelism` tasks (minimum 1).
    pub fn new(max_parallelism: usize) -> Self {
        let (size, _) = watch::channel(0);
        Self {
            inner: Arc::new(LimiterInner {
                max_parallelism: max_parallelism.max(1),
                state: Mutex::new(LimiterState {
                    running: 0,
                    backlog: VecDeque::new(),
                    disposed: false,
                }),
                size,
            }),
        }
    }

    /// A degree-1 limiter: strictly one task at a time.
    pub fn sequential() -> Self {
        Self::new(1)
    }

    /// Number of tasks running or waiting to run.
    pub fn size(&self) -> usize {
        *self.inner.size.borrow()
    }

    /// Queue a task factory. Fails once the limiter is disposed.
    pub fn queue<F, Fut>(&self, factory: F) -> AsyncResult<LimitedTask<T>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (reply, receiver) = oneshot::channel();
        {
            let mut state = self.inner.state.lock();
            if state.disposed {
                return Err(AsyncError::Disposed);
            }
            state.backlog.push_back(Pending {
                factory: Box::new(move || Box::pin(factory())),
                reply,
            });
            self.inner.publish_size(&state);
        }
        LimiterInner::consume(&self.inner);
        Ok(LimitedTask { receiver })
    }

    /// Resolves once no task is running or queued.
    pub async fn when_idle(&self) {
        let mut size = self.inner.size.subscribe();
        // The sender lives in `self.inner`, so this cannot observe a closed channel.
        let _ = size.wait_for(|outstanding| *outstanding == 0).await;
    }

    /// Drop every task that has not started yet. Running tasks are unaffected.
    pub fn clear(&self) -> AsyncResult<()> {
        let mut state = self.inner.state.lock();
        if state.disposed {
            return Err(AsyncError::Disposed);
        }
        state.backlog.clear();
        self.inner.publish_size(&state);
        Ok(())
    }

    /// Stop accepting work and drop the backlog. Running tasks still count
    /// towards [`size`](Self::size) until they finish.
    pub fn dispose(&self) {
        let mut state = self.inner.state.lock();
        state.disposed = true;
        state.backlog.clear();
        self.inner.publish_size(&state);
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.state.lock().disposed
    }
}

impl<T: Send + 'static> LimiterInner<T> {
    fn publish_size(&self, state: &LimiterState<T>) {
        self.size.send_replace(state.running + state.backlog.len());
    }

    fn consume(inner: &Arc<Self>) {
        loop {
            let next = {
                let mut state = inner.state.lock();
                if state.disposed || state.running >= inner.max_parallelism {
                    return;
                }
                match state.backlog.pop_front() {
                    Some(next) => {
                        state.running += 1;
                        next
                    }
                    None => return,
                }
            };

            let runtime = match tokio::runtime::Handle::try_current() {
                Ok(runtime) => runtime,
                Err(_) => {
                    warn!("Limiter task dropped: no tokio runtime available");
                    inner.release_slot();
                    return;
                }
            };

            let slot = RunningSlot {
                inner: inner.clone(),
            };
            runtime.spawn(async move {
                let _slot = slot;
                let output = (next.factory)().await;
                // The caller may have dropped its handle.
                let _ = next.reply.send(output);
            });
        }
    }

    fn release_slot(&self) {
        let mut state = self.state.lock();
        state.running = state.running.saturating_sub(1);
        self.publish_size(&state);
    }
}

/// Frees a running slot when the task finishes, panics or is aborted.
struct RunningSlot<T: Send + 'static> {
    inner: Arc<LimiterInner<T>>,
}

impl<T: Send + 'static> Drop for RunningSlot<T> {
    fn drop(&mut self) {
        self.inner.release_slot();
        LimiterInner::consume(&self.inner);
    }
}

/// Handle to a task queued on a [`Limiter`].
///
/// Resolves to the task's output, or [`AsyncError::Discarded`] when the task
/// was cleared from the backlog (or panicked) before producing one.
pub struct LimitedTask<T> {
    receiver: oneshot::Receiver<T>,
}

impl<T> Future for LimitedTask<T> {
    type Output = AsyncResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().receiver)
            .poll(cx)
            .map(|result| result.map_err(|_| AsyncError::Discarded))
    }
}
