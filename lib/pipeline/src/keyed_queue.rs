use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::oneshot;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum KeyedQueueError {
    /// The job was discarded by [`KeyedQueue::clear`] before it ran.
    #[error("queued job was dropped before running")]
    Dropped,
    #[error("queued job panicked")]
    Panicked,
}

#[derive(Default)]
struct KeyState {
    jobs: VecDeque<BoxFuture<'static, ()>>,
    // Set while the front job is being driven by `run_key`.
    running: bool,
}

/// Runs async jobs one at a time per key, in submission order.
///
/// Jobs under different keys run concurrently. A key only occupies memory while it has
/// queued or running work.
pub struct KeyedQueue<K> {
    keys: Arc<Mutex<HashMap<K, KeyState>>>,
}

impl<K> Clone for KeyedQueue<K> {
    fn clone(&self) -> Self {
        Self {
            keys: self.keys.clone(),
        }
    }
}

impl<K> Default for KeyedQueue<K> {
    fn default() -> Self {
        Self {
            keys: Arc::default(),
        }
    }
}

impl<K> std::fmt::Debug for KeyedQueue<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedQueue")
            .field("active_keys", &self.keys.lock().len())
            .finish()
    }
}

impl<K> KeyedQueue<K>
where
    K: Hash + Eq + Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues `job` under `key`.
    ///
    /// The job is registered before this returns, so submission order is the call order even
    /// if the returned futures are awaited in a different order (or not at all). The returned
    /// future resolves with the job's output once it ran.
    pub fn queue<F, R>(
        &self,
        key: K,
        job: F,
    ) -> impl Future<Output = Result<R, KeyedQueueError>> + Send + 'static
    where
        F: Future<Output = R> + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let wrapped = async move {
            let _ = tx.send(job.await);
        }
        .boxed();

        let start_worker = {
            let mut keys = self.keys.lock();
            match keys.get_mut(&key) {
                Some(state) => {
                    state.jobs.push_back(wrapped);
                    false
                }
                None => {
                    let mut state = KeyState::default();
                    state.jobs.push_back(wrapped);
                    keys.insert(key.clone(), state);
                    true
                }
            }
        };
        if start_worker {
            tokio::spawn(run_key(self.keys.clone(), key));
        }

        async move {
            match rx.await {
                Ok(output) => Ok(output),
                // The sender is dropped without sending if the job was cleared or panicked;
                // `run_key` logs the latter.
                Err(_) => Err(KeyedQueueError::Dropped),
            }
        }
    }

    /// Like [`queue`](Self::queue), but reports a panicking job as [`KeyedQueueError::Panicked`].
    pub fn queue_catching<F, R>(
        &self,
        key: K,
        job: F,
    ) -> impl Future<Output = Result<R, KeyedQueueError>> + Send + 'static
    where
        F: Future<Output = R> + Send + 'static,
        R: Send + 'static,
    {
        let job = AssertUnwindSafe(job).catch_unwind();
        let res = self.queue(key, job);
        async move { res.await?.map_err(|_| KeyedQueueError::Panicked) }
    }

    /// Number of jobs under `key` waiting for their turn.
    pub fn pending(&self, key: &K) -> usize {
        self.keys
            .lock()
            .get(key)
            .map_or(0, |state| state.jobs.len() - usize::from(state.running))
    }

    /// Number of keys with queued or running work.
    pub fn active_keys(&self) -> usize {
        self.keys.lock().len()
    }

    /// Drops every job that has not started yet. Running jobs finish normally.
    pub fn clear(&self) {
        let mut dropped = 0;
        for state in self.keys.lock().values_mut() {
            let keep = usize::from(state.running);
            dropped += state.jobs.drain(keep..).count();
        }
        if dropped > 0 {
            tracing::debug!(dropped, "cleared queued jobs");
        }
    }
}

/// Drains the jobs of one key. The head of the queue stays in place while it runs.
async fn run_key<K: Hash + Eq>(keys: Arc<Mutex<HashMap<K, KeyState>>>, key: K) {
    loop {
        let job = {
            let mut keys = keys.lock();
            let Some(state) = keys.get_mut(&key) else {
                return;
            };
            match state.jobs.front_mut() {
                Some(job) => {
                    state.running = true;
                    std::mem::replace(job, futures::future::ready(()).boxed())
                }
                None => {
                    keys.remove(&key);
                    return;
                }
            }
        };

        if AssertUnwindSafe(job).catch_unwind().await.is_err() {
            tracing::error!("keyed queue job panicked");
        }

        let mut guard = keys.lock();
        if let Some(state) = guard.get_mut(&key) {
            state.jobs.pop_front();
            state.running = false;
            if state.jobs.is_empty() {
                guard.remove(&key);
                return;
            }
        }
    }
}
