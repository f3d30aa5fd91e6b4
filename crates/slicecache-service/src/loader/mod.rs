//! Turns demanded and predicted frames into a bounded number of concurrent fetches.
//!
//! Every fetch in the engine goes through the [`BatchLoadCoordinator`]. It de-duplicates
//! requests against the [`CacheStore`] and against loads that are already pending, orders pending
//! loads by urgency, retries transient failures with backoff, and drops loads of studies that are
//! no longer looked at.

use std::cmp::Reverse;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures::channel::oneshot;
use futures::future::BoxFuture;
use rustc_hash::FxHashMap;
use sentry::{Hub, SentryFutureExt};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::caching::{CacheEntry, CacheStore, EntryOptions};
use crate::config::LoadConfig;
use crate::error::{FrameError, FrameResult};
use crate::types::{FetchedFrame, Frame, FrameKey, Origin, StudyId};

mod queue;
mod retry;
mod source;

use queue::LoadQueue;
pub use retry::RetryPolicy;
pub use source::{Decompressor, FrameSource, ZstdDecompressor};

/// Eviction protection of frames the user has looked at.
const DEMAND_PRIORITY_HINT: u32 = 8;
/// Eviction protection of the nearest prefetched frame, decreasing with prefetch rank.
const PREFETCH_PRIORITY_HINT: u32 = 4;

/// Resolves to the requested frame once it is loaded.
///
/// Dropping the handle does not cancel the load, the frame is still cached.
pub type FrameHandle = BoxFuture<'static, FrameResult>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    /// Waiting in the queue for a free slot.
    Queued,
    /// A fetch is in progress.
    Running,
    /// Waiting for the backoff delay before going back into the queue.
    BackingOff,
}

/// A load that has not completed yet.
///
/// There is at most one per [`FrameKey`], every further request for the key is attached to it.
#[derive(Debug)]
struct PendingLoad {
    origin: Origin,
    priority: u32,
    /// Number of fetch attempts started so far.
    attempt: u32,
    phase: Phase,
    /// The ticket of the current queue position, older positions are stale.
    ticket: u64,
    cancel: CancellationToken,
    waiters: Vec<oneshot::Sender<FrameResult>>,
}

impl PendingLoad {
    fn priority_hint(&self) -> u32 {
        match self.origin {
            Origin::Demand => DEMAND_PRIORITY_HINT,
            Origin::Prefetch => PREFETCH_PRIORITY_HINT.saturating_sub(self.priority),
        }
    }
}

fn urgency(origin: Origin, priority: u32) -> (bool, Reverse<u32>) {
    (origin == Origin::Demand, Reverse(priority))
}

#[derive(Debug, Default)]
struct LoaderState {
    queue: LoadQueue,
    loads: FxHashMap<FrameKey, PendingLoad>,
    /// Number of fetches in progress.
    running: usize,
    /// One token per study that has pending loads or is active.
    sessions: FxHashMap<StudyId, CancellationToken>,
}

impl LoaderState {
    fn session(&mut self, study: &StudyId) -> CancellationToken {
        self.sessions.entry(study.clone()).or_default().clone()
    }
}

#[derive(Debug, Default)]
struct LoaderCounters {
    fetches: AtomicU64,
    coalesced: AtomicU64,
    retries: AtomicU64,
    cancelled: AtomicU64,
    failed_prefetches: AtomicU64,
    failed_demands: AtomicU64,
}

/// A point-in-time view of the coordinator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LoaderStats {
    /// Fetches in progress.
    pub in_flight: usize,
    /// Loads waiting for a slot, including loads waiting for a retry.
    pub queued: usize,
    pub max_concurrent_loads: usize,
    /// Frame source invocations.
    pub fetches: u64,
    /// Requests that were attached to an already pending load.
    pub coalesced: u64,
    pub retries: u64,
    pub cancelled: u64,
    pub failed_prefetches: u64,
    pub failed_demands: u64,
}

enum Enqueued {
    Cached(Arc<CacheEntry>),
    Waiting(oneshot::Receiver<FrameResult>),
}

/// Schedules frame fetches against a [`FrameSource`] and stores the results in a [`CacheStore`].
pub struct BatchLoadCoordinator {
    runtime: Handle,
    source: Arc<dyn FrameSource>,
    decompressor: Arc<dyn Decompressor>,
    store: Arc<CacheStore>,
    timeout: Duration,
    retry: RetryPolicy,
    max_concurrent_loads: AtomicUsize,
    state: Mutex<LoaderState>,
    counters: LoaderCounters,
}

impl std::fmt::Debug for BatchLoadCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchLoadCoordinator")
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .field("max_concurrent_loads", &self.max_concurrent_loads)
            .finish()
    }
}

impl BatchLoadCoordinator {
    pub fn new(
        config: &LoadConfig,
        source: Arc<dyn FrameSource>,
        decompressor: Arc<dyn Decompressor>,
        store: Arc<CacheStore>,
        runtime: Handle,
    ) -> Arc<Self> {
        Arc::new(Self {
            runtime,
            source,
            decompressor,
            store,
            timeout: config.timeout,
            retry: RetryPolicy::from_config(&config.retry),
            max_concurrent_loads: AtomicUsize::new(
                config.max_concurrent_loads.unwrap_or(1).max(1),
            ),
            state: Mutex::default(),
            counters: LoaderCounters::default(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, LoaderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn max_concurrent_loads(&self) -> usize {
        self.max_concurrent_loads.load(Ordering::Relaxed)
    }

    /// Changes the number of concurrent fetches, which is at least 1.
    ///
    /// Running fetches are never interrupted, a lower limit takes effect as they complete.
    pub fn set_max_concurrent_loads(self: &Arc<Self>, limit: usize) {
        let limit = limit.max(1);
        let previous = self.max_concurrent_loads.swap(limit, Ordering::Relaxed);
        if previous != limit {
            tracing::debug!(previous, limit, "Changed concurrent load limit");
        }
        self.dispatch();
    }

    /// Requests a frame.
    ///
    /// A cached frame resolves right away. Otherwise the request is attached to the pending load
    /// of the same frame, or a new load is queued. Demand requests count as a cache access.
    pub fn request_frame(
        self: &Arc<Self>,
        key: FrameKey,
        origin: Origin,
        priority: u32,
    ) -> FrameHandle {
        match self.enqueue(key, origin, priority) {
            Enqueued::Cached(entry) => Box::pin(self.clone().serve_cached(entry, origin, priority)),
            Enqueued::Waiting(receiver) => Box::pin(wait(receiver)),
        }
    }

    /// Makes sure that a frame is loaded eventually, without waiting for it.
    ///
    /// Returns `false` if the frame is already cached. Failures are counted and logged.
    pub fn prefetch(self: &Arc<Self>, key: FrameKey, priority: u32) -> bool {
        !matches!(
            self.enqueue(key, Origin::Prefetch, priority),
            Enqueued::Cached(_)
        )
    }

    fn enqueue(self: &Arc<Self>, key: FrameKey, origin: Origin, priority: u32) -> Enqueued {
        let (sender, receiver) = oneshot::channel();

        let mut guard = self.lock();
        let state = &mut *guard;

        // Looking into the store while holding the lock means that a load cannot complete in
        // between the lookup and the check for pending loads.
        let cached = match origin {
            Origin::Demand => self.store.get(&key),
            Origin::Prefetch => self.store.peek(&key),
        };
        if let Some(entry) = cached {
            return Enqueued::Cached(entry);
        }

        if let Some(load) = state.loads.get_mut(&key) {
            self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
            metric!(counter("loader.coalesced") += 1, "origin" => origin.as_str());
            load.waiters.push(sender);

            if load.cancel.is_cancelled() {
                // a running load that outlived its session now serves the new one
                load.cancel = state
                    .sessions
                    .entry(key.study.clone())
                    .or_default()
                    .clone();
            }

            if urgency(origin, priority) > urgency(load.origin, load.priority) {
                if origin == Origin::Demand {
                    load.origin = Origin::Demand;
                    load.priority = priority;
                } else {
                    load.priority = load.priority.min(priority);
                }
                if load.phase == Phase::Queued {
                    load.ticket = state.queue.push(key.clone(), load.origin, load.priority);
                    tracing::debug!(
                        key = %key,
                        origin = origin.as_str(),
                        priority,
                        "Upgraded queued load"
                    );
                }
            }
            return Enqueued::Waiting(receiver);
        }

        let cancel = state.session(&key.study);
        let ticket = state.queue.push(key.clone(), origin, priority);
        tracing::trace!(key = %key, origin = origin.as_str(), priority, "Queued load");
        state.loads.insert(
            key,
            PendingLoad {
                origin,
                priority,
                attempt: 0,
                phase: Phase::Queued,
                ticket,
                cancel,
                waiters: vec![sender],
            },
        );
        drop(guard);

        self.dispatch();
        Enqueued::Waiting(receiver)
    }

    /// Starts queued loads while there are free slots.
    fn dispatch(self: &Arc<Self>) {
        let limit = self.max_concurrent_loads();
        let mut guard = self.lock();
        let state = &mut *guard;

        while state.running < limit {
            let Some(queued) = state.queue.pop() else {
                break;
            };
            let Some(load) = state.loads.get_mut(&queued.key) else {
                continue;
            };
            if load.phase != Phase::Queued || load.ticket != queued.ticket {
                continue;
            }

            load.phase = Phase::Running;
            load.attempt += 1;
            let attempt = load.attempt;
            state.running += 1;

            tracing::debug!(
                key = %queued.key,
                origin = load.origin.as_str(),
                priority = load.priority,
                attempt,
                "Dispatching load"
            );
            metric!(gauge("loader.in_flight") = state.running as u64);

            let task = self.clone().run_load(queued.key, attempt);
            self.runtime
                .spawn(task.bind_hub(Hub::new_from_top(Hub::current())));
        }
    }

    async fn run_load(self: Arc<Self>, key: FrameKey, attempt: u32) {
        self.counters.fetches.fetch_add(1, Ordering::Relaxed);

        let started = Instant::now();
        let fetch = self.source.fetch(&key.study, key.slice, key.quality);
        let result = match tokio::time::timeout(self.timeout, fetch).await {
            Ok(result) => result,
            Err(_) => Err(FrameError::Timeout(self.timeout)),
        };
        metric!(
            timer("loader.fetch") = started.elapsed(),
            "result" => match &result {
                Ok(_) => "ok",
                Err(err) => err.as_tag(),
            }
        );

        let outcome = match result {
            Ok(fetched) => self.store_fetched(&key, fetched).await,
            Err(err) => Err(err),
        };

        self.finish(key, attempt, outcome);
        self.dispatch();
    }

    /// Caches a fetched payload and produces the frame for the waiters.
    async fn store_fetched(&self, key: &FrameKey, fetched: FetchedFrame) -> FrameResult {
        let options = {
            let state = self.lock();
            let load = state.loads.get(key).ok_or(FrameError::InternalError)?;
            EntryOptions {
                priority_hint: load.priority_hint(),
                compressed: fetched.compressed,
                origin: load.origin,
            }
        };

        // only payloads that decode are made visible to other requests
        let payload = if fetched.compressed {
            self.decompressor.decompress(fetched.payload.clone()).await?
        } else {
            fetched.payload.clone()
        };

        self.store.put(key.clone(), fetched.payload, options)?;
        Ok(Frame::new(key.clone(), payload))
    }

    fn finish(self: &Arc<Self>, key: FrameKey, attempt: u32, outcome: FrameResult) {
        let mut state = self.lock();
        state.running = state.running.saturating_sub(1);
        metric!(gauge("loader.in_flight") = state.running as u64);

        let Some(load) = state.loads.get_mut(&key) else {
            return;
        };

        let outcome = match outcome {
            Err(err) if err.is_retryable() => {
                if load.cancel.is_cancelled() {
                    Err(FrameError::Cancelled)
                } else if self.retry.should_retry(attempt) {
                    load.phase = Phase::BackingOff;
                    let cancel = load.cancel.clone();
                    let delay = self.retry.delay(attempt);
                    drop(state);

                    self.counters.retries.fetch_add(1, Ordering::Relaxed);
                    metric!(counter("loader.retry") += 1, "error" => err.as_tag());
                    tracing::debug!(
                        key = %key,
                        attempt,
                        delay = ?delay,
                        error = %err,
                        "Retrying failed load"
                    );
                    self.schedule_retry(key, attempt, delay, cancel);
                    return;
                } else {
                    Err(FrameError::RetriesExhausted {
                        attempts: attempt,
                        last: Box::new(err),
                    })
                }
            }
            outcome => outcome,
        };

        let Some(load) = state.loads.remove(&key) else {
            return;
        };
        drop(state);

        if let Err(ref err) = outcome {
            self.record_failure(&key, load.origin, err);
        }
        for waiter in load.waiters {
            // the requester is free to drop the handle
            let _ = waiter.send(outcome.clone());
        }
    }

    fn record_failure(&self, key: &FrameKey, origin: Origin, err: &FrameError) {
        if *err == FrameError::Cancelled {
            self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
            return;
        }

        metric!(
            counter("loader.failure") += 1,
            "origin" => origin.as_str(),
            "error" => err.as_tag(),
        );
        match origin {
            Origin::Prefetch => {
                self.counters
                    .failed_prefetches
                    .fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %key, error = %err, "Prefetch failed");
            }
            Origin::Demand => {
                self.counters.failed_demands.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(key = %key, error = %err, "Failed to load frame");
            }
        }
    }

    fn schedule_retry(
        self: &Arc<Self>,
        key: FrameKey,
        attempt: u32,
        delay: Duration,
        cancel: CancellationToken,
    ) {
        let this = self.clone();
        let task = async move {
            tokio::select! {
                // the load has already been dropped by whoever cancelled it
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => this.requeue(key, attempt),
            }
        };
        self.runtime
            .spawn(task.bind_hub(Hub::new_from_top(Hub::current())));
    }

    fn requeue(self: &Arc<Self>, key: FrameKey, attempt: u32) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let Some(load) = state.loads.get_mut(&key) else {
            return;
        };
        if load.phase != Phase::BackingOff || load.attempt != attempt {
            return;
        }
        load.phase = Phase::Queued;
        load.ticket = state.queue.push(key, load.origin, load.priority);
        drop(guard);

        self.dispatch();
    }

    /// Serves a cached entry, loading it again if its payload turns out to be corrupt.
    async fn serve_cached(
        self: Arc<Self>,
        entry: Arc<CacheEntry>,
        origin: Origin,
        priority: u32,
    ) -> FrameResult {
        match self.unpack(&entry).await {
            Err(FrameError::DecompressionFailed(reason)) => {
                let key = entry.key().clone();
                tracing::warn!(
                    key = %key,
                    reason = %reason,
                    "Dropping cached frame that failed to decompress"
                );
                metric!(counter("cache.corrupt") += 1);
                self.store.remove(&key);

                match self.enqueue(key, origin, priority) {
                    Enqueued::Cached(entry) => self.unpack(&entry).await,
                    Enqueued::Waiting(receiver) => wait(receiver).await,
                }
            }
            result => result,
        }
    }

    async fn unpack(&self, entry: &CacheEntry) -> FrameResult {
        let payload = if entry.is_compressed() {
            self.decompressor.decompress(entry.payload().clone()).await?
        } else {
            entry.payload().clone()
        };
        Ok(Frame::new(entry.key().clone(), payload))
    }

    /// Makes `study` the only study whose loads are kept, cancelling all others.
    ///
    /// Returns the number of cancelled loads.
    pub fn set_active_study(&self, study: &StudyId) -> usize {
        let others: Vec<_> = {
            let mut state = self.lock();
            state.session(study);
            state
                .sessions
                .keys()
                .filter(|other| *other != study)
                .cloned()
                .collect()
        };

        others.iter().map(|other| self.cancel_study(other)).sum()
    }

    /// Drops all queued and backing-off loads of `study`.
    ///
    /// Their requesters receive [`FrameError::Cancelled`]. Running fetches complete, their result
    /// is still cached and delivered, but a failure is no longer retried. Returns the number of
    /// dropped loads.
    pub fn cancel_study(&self, study: &StudyId) -> usize {
        let cancelled: FxHashMap<_, _> = {
            let mut guard = self.lock();
            let state = &mut *guard;
            if let Some(token) = state.sessions.remove(study) {
                token.cancel();
            }

            let (cancelled, kept) = std::mem::take(&mut state.loads)
                .into_iter()
                .partition(|(key, load)| key.study == *study && load.phase != Phase::Running);
            state.loads = kept;
            state.queue.retain(|queued| queued.key.study != *study);
            cancelled
        };

        let count = cancelled.len();
        for (key, load) in cancelled {
            self.record_failure(&key, load.origin, &FrameError::Cancelled);
            for waiter in load.waiters {
                let _ = waiter.send(Err(FrameError::Cancelled));
            }
        }

        if count > 0 {
            metric!(counter("loader.cancelled") += count as i64);
            tracing::debug!(study = %study, count, "Cancelled pending loads");
        }
        count
    }

    pub fn stats(&self) -> LoaderStats {
        let (in_flight, queued) = {
            let state = self.lock();
            let queued = state
                .loads
                .values()
                .filter(|load| load.phase != Phase::Running)
                .count();
            (state.running, queued)
        };
        LoaderStats {
            in_flight,
            queued,
            max_concurrent_loads: self.max_concurrent_loads(),
            fetches: self.counters.fetches.load(Ordering::Relaxed),
            coalesced: self.counters.coalesced.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
            failed_prefetches: self.counters.failed_prefetches.load(Ordering::Relaxed),
            failed_demands: self.counters.failed_demands.load(Ordering::Relaxed),
        }
    }
}

async fn wait(receiver: oneshot::Receiver<FrameResult>) -> FrameResult {
    // the sender is only dropped without a result when the coordinator goes away
    receiver.await.unwrap_or(Err(FrameError::Cancelled))
}
