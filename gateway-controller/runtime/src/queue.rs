//! A deduplicating work queue with per-key rate-limited retries.
//!
//! A key is held at most once while it waits to be processed, and a key that is being processed
//! is not handed to another worker: adding it again while it is in flight marks it dirty and it
//! is requeued once the worker calls [`WorkQueue::done`].

use crate::metrics::QueueMetrics;
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use parking_lot::Mutex;
use std::{collections::VecDeque, hash::Hash, sync::Arc};
use tokio::{sync::Notify, time::Duration};

/// Computes how long a key waits before it is retried.
pub trait RateLimiter<K>: Send + Sync + 'static {
    /// Records a failure and returns the delay before the next attempt.
    fn when(&self, key: &K) -> Duration;

    /// Clears the key's failure history.
    fn forget(&self, key: &K);

    fn num_requeues(&self, key: &K) -> usize;
}

/// Retries quickly a fixed number of times and slowly afterwards.
#[derive(Debug)]
pub struct FastSlow<K> {
    fast: Duration,
    slow: Duration,
    max_fast_attempts: usize,
    attempts: Mutex<HashMap<K, usize>>,
}

/// Doubles the delay on every failure, up to a limit.
#[derive(Debug)]
pub struct Exponential<K> {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<K, usize>>,
}

pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

struct Inner<K> {
    name: &'static str,
    state: Mutex<State<K>>,
    notify: Notify,
    limiter: Box<dyn RateLimiter<K>>,
    metrics: QueueMetrics,
}

struct State<K> {
    queue: VecDeque<K>,

    /// Keys that need processing: everything in `queue` plus in-flight keys that were re-added.
    /// Its size is reported as the queue's depth.
    dirty: HashSet<K>,
    processing: HashSet<K>,
    shutting_down: bool,
}

// === impl FastSlow ===

impl<K: Eq + Hash> FastSlow<K> {
    pub fn new(fast: Duration, slow: Duration, max_fast_attempts: usize) -> Self {
        Self {
            fast,
            slow,
            max_fast_attempts,
            attempts: Default::default(),
        }
    }
}

impl<K: Eq + Hash> Default for FastSlow<K> {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(5), 5)
    }
}

impl<K> RateLimiter<K> for FastSlow<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    fn when(&self, key: &K) -> Duration {
        let mut attempts = self.attempts.lock();
        let n = attempts.entry(key.clone()).or_default();
        *n += 1;
        if *n <= self.max_fast_attempts {
            self.fast
        } else {
            self.slow
        }
    }

    fn forget(&self, key: &K) {
        self.attempts.lock().remove(key);
    }

    fn num_requeues(&self, key: &K) -> usize {
        self.attempts.lock().get(key).copied().unwrap_or(0)
    }
}

// === impl Exponential ===

impl<K: Eq + Hash> Exponential<K> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Default::default(),
        }
    }
}

impl<K> RateLimiter<K> for Exponential<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    fn when(&self, key: &K) -> Duration {
        let mut failures = self.failures.lock();
        let n = failures.entry(key.clone()).or_default();
        let exp = u32::try_from(*n).unwrap_or(u32::MAX);
        *n += 1;
        2u32.checked_pow(exp)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }

    fn forget(&self, key: &K) {
        self.failures.lock().remove(key);
    }

    fn num_requeues(&self, key: &K) -> usize {
        self.failures.lock().get(key).copied().unwrap_or(0)
    }
}

// === impl WorkQueue ===

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new(
        name: &'static str,
        limiter: impl RateLimiter<K>,
        metrics: QueueMetrics,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                limiter: Box::new(limiter),
                metrics,
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    pub fn metrics(&self) -> &QueueMetrics {
        &self.inner.metrics
    }

    /// Enqueues a key unless it is already waiting. Keys added after shutdown are ignored.
    pub fn add(&self, key: K) {
        let mut state = self.inner.state.lock();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        self.inner.metrics.add();
        state.dirty.insert(key.clone());
        self.inner.metrics.set_depth(state.dirty.len());
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Waits for the next key. Returns `None` once the queue has been shut down.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    self.inner.metrics.set_depth(state.dirty.len());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Marks a key as processed, requeueing it if it was added while in flight.
    pub fn done(&self, key: &K) {
        let mut state = self.inner.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Re-adds a key once its retry delay has elapsed.
    pub fn add_rate_limited(&self, key: K) {
        let delay = self.inner.limiter.when(&key);
        self.inner.metrics.retry();
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    pub fn forget(&self, key: &K) {
        self.inner.limiter.forget(key);
    }

    pub fn num_requeues(&self, key: &K) -> usize {
        self.inner.limiter.num_requeues(key)
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discards all waiting keys and wakes every blocked worker.
    pub fn shut_down(&self) {
        let mut state = self.inner.state.lock();
        state.shutting_down = true;
        state.queue.clear();
        state.dirty.clear();
        self.inner.metrics.set_depth(0);
        drop(state);
        self.inner.notify.notify_waiters();
    }

    /// Stops accepting keys while still handing out the keys that were already added. Workers
    /// observe the shutdown once no keys remain.
    pub fn shut_down_with_drain(&self) {
        self.inner.state.lock().shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K> std::fmt::Debug for WorkQueue<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}
