//! An opinionated queue + worker model for processing watched cluster events
//! and synchronising resources.
//!
//! Keys are `namespace/name` strings. A key enqueued multiple times before a
//! worker picks it up is processed once; a key enqueued while it is being
//! processed is re-queued after the current pass finishes. Failed keys are
//! retried with per-key exponential backoff.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{bail, Result};
use kube::Resource;
use tokio::sync::{broadcast, Notify};

/// The base delay of the per-key rate limiter.
const BASE_DELAY: Duration = Duration::from_millis(5);
/// The cap on the per-key rate limiter delay.
const MAX_DELAY: Duration = Duration::from_secs(1000);

/// A rate limited queue of `namespace/name` keys, processed by a pool of workers.
#[derive(Clone)]
pub struct WorkerQueue {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    state: Mutex<State>,
    notify: Notify,
    workers: AtomicUsize,
    running: AtomicUsize,
}

#[derive(Default)]
struct State {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    failures: HashMap<String, u32>,
    shut_down: bool,
}

impl WorkerQueue {
    /// Create a new worker queue with the given name.
    pub fn new(name: &str) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.to_string(),
                state: Mutex::new(State::default()),
                notify: Notify::new(),
                workers: AtomicUsize::new(0),
                running: AtomicUsize::new(0),
            }),
        }
    }

    /// Derive the `namespace/name` key for the given object.
    ///
    /// Returns `None` for an object without a name; such objects are dropped
    /// without retry, as they can never be synchronised.
    pub fn key_for<K: Resource>(obj: &K) -> Option<String> {
        let meta = obj.meta();
        let name = meta.name.as_deref()?;
        match meta.namespace.as_deref() {
            Some(namespace) => Some(format!("{}/{}", namespace, name)),
            None => Some(name.to_string()),
        }
    }

    /// Split a `namespace/name` key into its parts.
    pub fn split_key(key: &str) -> Option<(&str, &str)> {
        let mut parts = key.splitn(2, '/');
        match (parts.next(), parts.next()) {
            (Some(namespace), Some(name)) if !namespace.is_empty() && !name.is_empty() => Some((namespace, name)),
            _ => None,
        }
    }

    /// Put the key of the given object in the queue, subject to rate limiting.
    pub fn enqueue<K: Resource>(&self, obj: &K) {
        match Self::key_for(obj) {
            Some(key) => self.enqueue_key(key),
            None => tracing::error!(queue = %self.inner.name, "could not create key for object, dropping"),
        }
    }

    /// Put the key of the given object in the queue without rate limiting.
    ///
    /// This should be used to continue partially completed work after giving
    /// other items in the queue a chance of running.
    pub fn enqueue_immediately<K: Resource>(&self, obj: &K) {
        match Self::key_for(obj) {
            Some(key) => self.enqueue_key_immediately(key),
            None => tracing::error!(queue = %self.inner.name, "could not create key for object, dropping"),
        }
    }

    /// Schedule a key with the rate limiter's current backoff for it.
    pub fn enqueue_key(&self, key: String) {
        let delay = self.next_backoff(&key);
        tracing::debug!(queue = %self.inner.name, %key, ?delay, "enqueuing key");
        self.add_after(key, delay);
    }

    /// Add a key to the queue immediately.
    pub fn enqueue_key_immediately(&self, key: String) {
        tracing::debug!(queue = %self.inner.name, %key, "enqueuing key immediately");
        self.add(key);
    }

    /// Run `workers` workers processing the queue via `handler` until the
    /// shutdown channel fires, then drain the workers.
    pub async fn run<F, Fut>(&self, workers: usize, handler: F, shutdown: broadcast::Sender<()>) -> Result<()>
    where
        F: Fn(String) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.inner.workers.store(workers, Ordering::SeqCst);
        tracing::info!(queue = %self.inner.name, workers, "starting workers");

        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let queue = self.clone();
            let handler = handler.clone();
            handles.push(tokio::spawn(async move {
                queue.inner.running.fetch_add(1, Ordering::SeqCst);
                while let Some(key) = queue.get().await {
                    match handler(key.clone()).await {
                        Ok(()) => queue.forget(&key),
                        Err(err) => {
                            // Not forgotten: the key is retried via the queue.
                            tracing::error!(queue = %queue.inner.name, %key, error = ?err, "error processing key, requeuing");
                            queue.enqueue_key(key.clone());
                        }
                    }
                    queue.done(&key);
                }
                queue.inner.running.fetch_sub(1, Ordering::SeqCst);
            }));
        }

        let mut shutdown_rx = shutdown.subscribe();
        let _ = shutdown_rx.recv().await;
        tracing::info!(queue = %self.inner.name, "shutting down workers");
        self.shut_down();
        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }

    /// Reports whether all worker tasks are running.
    pub fn healthy(&self) -> Result<()> {
        let want = self.inner.workers.load(Ordering::SeqCst);
        let got = self.inner.running.load(Ordering::SeqCst);
        if want != got {
            bail!("want {} worker task(s), got {}", want, got);
        }
        Ok(())
    }

    /// The number of currently running worker tasks.
    pub fn run_count(&self) -> usize {
        self.inner.running.load(Ordering::SeqCst)
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().expect("worker queue state lock poisoned")
    }

    /// The next backoff delay for the key, doubling on every rate-limited add.
    fn next_backoff(&self, key: &str) -> Duration {
        let mut state = self.state();
        let failures = state.failures.entry(key.to_string()).or_insert(0);
        let exp = (*failures).min(27);
        *failures += 1;
        Duration::from_millis((BASE_DELAY.as_millis() as u64) << exp).min(MAX_DELAY)
    }

    fn add_after(&self, key: String, delay: Duration) {
        let queue = self.clone();
        tokio::spawn(async move {
            if delay > Duration::ZERO {
                tokio::time::sleep(delay).await;
            }
            queue.add(key);
        });
    }

    fn add(&self, key: String) {
        {
            let mut state = self.state();
            if state.shut_down || state.dirty.contains(&key) {
                return;
            }
            state.dirty.insert(key.clone());
            if state.processing.contains(&key) {
                // Re-queued by done() once the in-flight pass finishes.
                return;
            }
            state.queue.push_back(key);
        }
        self.inner.notify.notify_one();
    }

    async fn get(&self) -> Option<String> {
        loop {
            let popped = {
                let mut state = self.state();
                match state.queue.pop_front() {
                    Some(key) => {
                        state.dirty.remove(&key);
                        state.processing.insert(key.clone());
                        Some((key, !state.queue.is_empty()))
                    }
                    None if state.shut_down => return None,
                    None => None,
                }
            };
            match popped {
                Some((key, more)) => {
                    if more {
                        // Pass the wakeup along so siblings drain the backlog.
                        self.inner.notify.notify_one();
                    }
                    return Some(key);
                }
                None => self.inner.notify.notified().await,
            }
        }
    }

    fn done(&self, key: &str) {
        let requeued = {
            let mut state = self.state();
            state.processing.remove(key);
            if state.dirty.contains(key) {
                state.queue.push_back(key.to_string());
                true
            } else {
                false
            }
        };
        if requeued {
            self.inner.notify.notify_one();
        }
    }

    fn forget(&self, key: &str) {
        self.state().failures.remove(key);
    }

    fn shut_down(&self) {
        self.state().shut_down = true;
        self.inner.notify.notify_waiters();
    }
}
