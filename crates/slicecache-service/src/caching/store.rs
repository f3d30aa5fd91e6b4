use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use bytes::Bytes;
use rustc_hash::FxHashMap;
use serde::Serialize;

use super::scorer::{EntryStats, EvictionScorer};
use crate::config::CacheConfig;
use crate::error::FrameError;
use crate::types::{FrameKey, Origin};

/// Insertion-time attributes of a [`CacheEntry`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryOptions {
    /// Protects the entry from eviction, higher is more important.
    pub priority_hint: u32,
    /// Whether the payload has to be decompressed before use.
    pub compressed: bool,
    /// Why the frame was loaded.
    pub origin: Origin,
}

impl Default for EntryOptions {
    fn default() -> Self {
        Self {
            priority_hint: 0,
            compressed: false,
            origin: Origin::Demand,
        }
    }
}

/// A frame payload held by the [`CacheStore`].
///
/// Everything but the access bookkeeping is immutable after insertion.
pub struct CacheEntry {
    key: FrameKey,
    payload: Bytes,
    size_bytes: u64,
    priority_hint: u32,
    compressed: bool,
    origin: Origin,
    sequence: u64,
    /// Nanoseconds since the epoch of the owning store.
    last_accessed: AtomicU64,
    access_count: AtomicU64,
    /// Set on the first read, used to count prefetch hits once.
    consumed: AtomicBool,
}

impl CacheEntry {
    pub fn key(&self) -> &FrameKey {
        &self.key
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn priority_hint(&self) -> u32 {
        self.priority_hint
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn access_count(&self) -> u64 {
        self.access_count.load(Ordering::Relaxed)
    }

    fn touch(&self, now: u64) {
        self.last_accessed.fetch_max(now, Ordering::Relaxed);
        self.access_count.fetch_add(1, Ordering::Relaxed);
    }

    fn stats(&self, now: u64) -> EntryStats {
        let last_accessed = self.last_accessed.load(Ordering::Relaxed);
        EntryStats {
            idle: Duration::from_nanos(now.saturating_sub(last_accessed)),
            access_count: self.access_count(),
            size_bytes: self.size_bytes,
            priority_hint: self.priority_hint,
        }
    }
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("key", &self.key)
            .field("size_bytes", &self.size_bytes)
            .field("priority_hint", &self.priority_hint)
            .field("compressed", &self.compressed)
            .field("origin", &self.origin)
            .field("access_count", &self.access_count())
            .finish()
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    entries: FxHashMap<FrameKey, Arc<CacheEntry>>,
    used_bytes: u64,
    next_sequence: u64,
}

#[derive(Debug, Default)]
struct StoreCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    prefetch_inserts: AtomicU64,
    prefetch_hits: AtomicU64,
}

/// A point-in-time view of the [`CacheStore`] counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct StoreStats {
    pub entries: usize,
    pub used_bytes: u64,
    pub max_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub prefetch_inserts: u64,
    pub prefetch_hits: u64,
}

impl StoreStats {
    /// Fraction of [`CacheStore::get`] calls that found an entry.
    pub fn hit_rate(&self) -> f64 {
        ratio(self.hits, self.hits + self.misses)
    }

    /// Fraction of prefetched frames that were read before being evicted or replaced.
    pub fn prefetch_hit_rate(&self) -> f64 {
        ratio(self.prefetch_hits, self.prefetch_inserts)
    }
}

fn ratio(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

/// A memory-bounded map from [`FrameKey`] to frame payloads.
///
/// The sum of all payload sizes never exceeds the budget once a mutating call returns. Reads
/// share a lock and only update atomic bookkeeping, all mutations are serialized through an
/// exclusive lock.
pub struct CacheStore {
    max_bytes: u64,
    scorer: EvictionScorer,
    epoch: Instant,
    inner: RwLock<StoreInner>,
    counters: StoreCounters,
}

impl CacheStore {
    pub fn new(max_bytes: u64, scorer: EvictionScorer) -> Self {
        Self {
            max_bytes,
            scorer,
            epoch: Instant::now(),
            inner: RwLock::default(),
            counters: StoreCounters::default(),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(
            config.max_memory_bytes,
            EvictionScorer::for_policy(config.eviction_policy),
        )
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn now(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    /// Looks up an entry and records the access.
    ///
    /// This never evicts anything.
    pub fn get(&self, key: &FrameKey) -> Option<Arc<CacheEntry>> {
        let entry = self.read().entries.get(key).cloned();

        let Some(entry) = entry else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            metric!(counter("cache.access") += 1, "hit" => "false");
            return None;
        };

        entry.touch(self.now());
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        if entry.origin == Origin::Prefetch && !entry.consumed.swap(true, Ordering::Relaxed) {
            self.counters.prefetch_hits.fetch_add(1, Ordering::Relaxed);
        }
        metric!(counter("cache.access") += 1, "hit" => "true");
        tracing::trace!(key = %key, "Cache hit");

        Some(entry)
    }

    /// Looks up an entry without recording an access.
    pub fn peek(&self, key: &FrameKey) -> Option<Arc<CacheEntry>> {
        self.read().entries.get(key).cloned()
    }

    pub fn contains(&self, key: &FrameKey) -> bool {
        self.read().entries.contains_key(key)
    }

    /// Inserts a payload, evicting the lowest scoring entries until it fits.
    ///
    /// An existing entry with the same key is replaced. A payload that is larger than the whole
    /// budget is rejected with [`FrameError::EntryTooLarge`] and leaves the store untouched.
    pub fn put(
        &self,
        key: FrameKey,
        payload: Bytes,
        options: EntryOptions,
    ) -> Result<(), FrameError> {
        let size_bytes = payload.len() as u64;
        if size_bytes > self.max_bytes {
            metric!(counter("cache.entry_too_large") += 1);
            return Err(FrameError::EntryTooLarge {
                size: size_bytes,
                budget: self.max_bytes,
            });
        }

        let now = self.now();
        let mut inner = self.write();

        if let Some(previous) = inner.entries.remove(&key) {
            inner.used_bytes -= previous.size_bytes;
        }
        let evicted = self.evict_down_to(&mut inner, self.max_bytes - size_bytes, now);

        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        inner.used_bytes += size_bytes;

        let EntryOptions {
            priority_hint,
            compressed,
            origin,
        } = options;
        if origin == Origin::Prefetch {
            self.counters
                .prefetch_inserts
                .fetch_add(1, Ordering::Relaxed);
        }

        tracing::trace!(
            key = %key,
            size_bytes,
            evicted,
            used_bytes = inner.used_bytes,
            "Inserted cache entry"
        );
        metric!(gauge("cache.memory_usage") = inner.used_bytes);

        inner.entries.insert(
            key.clone(),
            Arc::new(CacheEntry {
                key,
                payload,
                size_bytes,
                priority_hint,
                compressed,
                origin,
                sequence,
                last_accessed: AtomicU64::new(now),
                access_count: AtomicU64::new(0),
                consumed: AtomicBool::new(false),
            }),
        );

        Ok(())
    }

    /// Evicts entries in score order until at most `target_bytes` are in use.
    fn evict_down_to(&self, inner: &mut StoreInner, target_bytes: u64, now: u64) -> usize {
        if inner.used_bytes <= target_bytes {
            return 0;
        }

        let order = self.scorer.eviction_order(
            inner
                .entries
                .values()
                .map(|entry| (entry.key.clone(), entry.sequence, entry.stats(now))),
        );

        let mut evicted = 0;
        for key in order {
            if inner.used_bytes <= target_bytes {
                break;
            }
            if let Some(entry) = inner.entries.remove(&key) {
                inner.used_bytes -= entry.size_bytes;
                evicted += 1;
                tracing::trace!(key = %key, size_bytes = entry.size_bytes, "Evicted cache entry");
            }
        }

        self.counters
            .evictions
            .fetch_add(evicted as u64, Ordering::Relaxed);
        metric!(counter("cache.evictions") += evicted as i64);

        evicted
    }

    /// Evicts entries until at most `target_bytes` are in use, returning the number of evictions.
    pub fn shrink_to(&self, target_bytes: u64) -> usize {
        let now = self.now();
        let mut inner = self.write();
        let evicted = self.evict_down_to(&mut inner, target_bytes, now);
        metric!(gauge("cache.memory_usage") = inner.used_bytes);
        evicted
    }

    pub fn remove(&self, key: &FrameKey) -> bool {
        let mut inner = self.write();
        match inner.entries.remove(key) {
            Some(entry) => {
                inner.used_bytes -= entry.size_bytes;
                true
            }
            None => false,
        }
    }

    pub fn clear(&self) {
        let mut inner = self.write();
        inner.entries.clear();
        inner.used_bytes = 0;
    }

    /// Removes every entry matching `predicate`, returning how many were removed.
    pub fn clear_matching<F>(&self, mut predicate: F) -> usize
    where
        F: FnMut(&CacheEntry) -> bool,
    {
        let mut inner = self.write();
        let before = inner.entries.len();
        let mut released = 0;
        inner.entries.retain(|_, entry| {
            let remove = predicate(entry);
            if remove {
                released += entry.size_bytes;
            }
            !remove
        });
        inner.used_bytes -= released;
        before - inner.entries.len()
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn used_bytes(&self) -> u64 {
        self.read().used_bytes
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn stats(&self) -> StoreStats {
        let (entries, used_bytes) = {
            let inner = self.read();
            (inner.entries.len(), inner.used_bytes)
        };
        StoreStats {
            entries,
            used_bytes,
            max_bytes: self.max_bytes,
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            prefetch_inserts: self.counters.prefetch_inserts.load(Ordering::Relaxed),
            prefetch_hits: self.counters.prefetch_hits.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (entries, used_bytes) = match self.inner.try_read() {
            Ok(inner) => (inner.entries.len(), inner.used_bytes),
            Err(_) => Default::default(),
        };
        f.debug_struct("CacheStore")
            .field("max_bytes", &self.max_bytes)
            .field("scorer", &self.scorer)
            .field("entries", &entries)
            .field("used_bytes", &used_bytes)
            .finish()
    }
}
