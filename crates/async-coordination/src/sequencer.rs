//! Per-key task sequencing.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

/// Tail of one key's chain: the completion signal of the last submitted task.
struct Link {
    id: u64,
    done: oneshot::Receiver<()>,
}

struct SequencerInner<K> {
    chains: Mutex<HashMap<K, Link>>,
    next_id: AtomicU64,
}

/// Runs tasks one at a time per key, in submission order.
///
/// Submission happens when [`KeyedSequencer::run`] is called, not when the
/// returned future is first polled. Each task waits for its predecessor to
/// finish, fail, panic or be dropped; the predecessor's outcome never leaks
/// into the successor. Tasks under different keys do not wait on each other.
/// A key's bookkeeping entry is removed once its last task completes.
///
/// Clones share the same chains.
pub struct KeyedSequencer<K> {
    inner: Arc<SequencerInner<K>>,
}

impl<K> Clone for KeyedSequencer<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K> KeyedSequencer<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SequencerInner {
                chains: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Queue `task` behind every task previously submitted under `key`.
    ///
    /// The returned future must be driven to completion or dropped; a future
    /// that is kept alive but never polled holds up the rest of its chain.
    pub fn run<T, F, Fut>(&self, key: K, task: F) -> impl Future<Output = T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        let previous = self
            .inner
            .chains
            .lock()
            .insert(
                key.clone(),
                Link {
                    id,
                    done: done_rx,
                },
            )
            .map(|link| link.done);

        let release = ChainRelease {
            inner: self.inner.clone(),
            key,
            id,
            done: Some(done_tx),
        };

        async move {
            let _release = release;
            if let Some(previous) = previous {
                // A dropped sender counts as completion.
                let _ = previous.await;
            }
            task().await
        }
    }

    /// Number of keys that currently have queued or running tasks.
    pub fn pending_keys(&self) -> usize {
        self.inner.chains.lock().len()
    }

    /// Whether `key` has queued or running tasks.
    pub fn is_busy(&self, key: &K) -> bool {
        self.inner.chains.lock().contains_key(key)
    }
}

impl<K> Default for KeyedSequencer<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Releases a task's place in its chain when the task finishes or is dropped.
struct ChainRelease<K: Eq + Hash> {
    inner: Arc<SequencerInner<K>>,
    key: K,
    id: u64,
    done: Option<oneshot::Sender<()>>,
}

impl<K: Eq + Hash> Drop for ChainRelease<K> {
    fn drop(&mut self) {
        {
            let mut chains = self.inner.chains.lock();
            if chains.get(&self.key).map(|link| link.id) == Some(self.id) {
                chains.remove(&self.key);
            }
        }
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
    }
}
