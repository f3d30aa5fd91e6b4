//! The per-session engine that wires all components together.

use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use sentry::{Hub, SentryFutureExt};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::caching::CacheStore;
use crate::config::{Config, PrefetchConfig, PressureConfig};
use crate::loader::{BatchLoadCoordinator, Decompressor, FrameHandle, FrameSource, ZstdDecompressor};
use crate::navigation::{NavigationPattern, PatternTracker, PredictionRequest, PrefetchPredictor};
use crate::pressure::{PressureLevel, PressureMonitor, QualitySelector};
use crate::types::{FrameKey, Origin, QualityLevel, StudyId};

/// The default number of concurrent loads for a study with `total_slices` slices.
///
/// Small studies are loaded one or two frames at a time, so that prefetching does not compete
/// with the frame that is looked at. Large studies use up to four loads.
pub fn concurrency_for_study(total_slices: u32) -> usize {
    match total_slices {
        0..32 => 1,
        32..96 => 2,
        _ => 4,
    }
}

/// Engine counters, as reported to the viewer.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Statistics {
    /// Fraction of demand lookups served from the cache.
    pub hit_rate: f64,
    pub eviction_count: u64,
    /// Bytes held by the cache.
    pub memory_usage: u64,
    pub memory_budget: u64,
    pub entries: usize,
    /// Fraction of prefetched frames that were later demanded.
    pub prefetch_hit_rate: f64,
    pub loads_in_flight: usize,
    pub loads_queued: usize,
    pub max_concurrent_loads: usize,
    pub fetches: u64,
    pub failed_prefetches: u64,
    pub failed_demands: u64,
    pub quality_level: QualityLevel,
    pub pressure: PressureLevel,
}

/// Caching, prefetching and loading of frames for one viewer session.
///
/// All state lives in this struct, two engines never share anything.
pub struct FrameEngine {
    prefetch: PrefetchConfig,
    pressure: PressureConfig,
    fixed_concurrency: Option<usize>,
    store: Arc<CacheStore>,
    tracker: PatternTracker,
    predictor: PrefetchPredictor,
    loader: Arc<BatchLoadCoordinator>,
    monitor: PressureMonitor,
    quality: QualitySelector,
    /// Slice counts of the open studies.
    studies: RwLock<FxHashMap<StudyId, u32>>,
    /// Stops the background sampler when the engine is dropped.
    _sampler: Option<DropGuard>,
}

impl std::fmt::Debug for FrameEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameEngine")
            .field("store", &self.store)
            .field("loader", &self.loader)
            .field("quality", &self.quality)
            .finish()
    }
}

impl FrameEngine {
    /// Creates an engine that decompresses frames with [`ZstdDecompressor`].
    pub fn new(config: &Config, source: Arc<dyn FrameSource>, runtime: Handle) -> Arc<Self> {
        Self::with_decompressor(config, source, Arc::new(ZstdDecompressor), runtime)
    }

    pub fn with_decompressor(
        config: &Config,
        source: Arc<dyn FrameSource>,
        decompressor: Arc<dyn Decompressor>,
        runtime: Handle,
    ) -> Arc<Self> {
        let store = Arc::new(CacheStore::from_config(&config.cache));
        let loader = BatchLoadCoordinator::new(
            &config.loads,
            source,
            decompressor,
            store.clone(),
            runtime.clone(),
        );

        Arc::new_cyclic(|engine| {
            let sampler = config.pressure.sample_interval.map(|interval| {
                let cancel = CancellationToken::new();
                let task = sample_periodically(engine.clone(), interval, cancel.clone());
                runtime.spawn(task.bind_hub(Hub::new_from_top(Hub::current())));
                cancel.drop_guard()
            });

            Self {
                prefetch: config.prefetch,
                pressure: config.pressure,
                fixed_concurrency: config.loads.max_concurrent_loads,
                store,
                tracker: PatternTracker::new(config.prefetch.history_size),
                predictor: PrefetchPredictor::from_config(&config.prefetch),
                loader,
                monitor: PressureMonitor::from_config(&config.cache, &config.pressure),
                quality: QualitySelector::new(config.quality.coarsest_level),
                studies: RwLock::default(),
                _sampler: sampler,
            }
        })
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn loader(&self) -> &Arc<BatchLoadCoordinator> {
        &self.loader
    }

    /// Makes `study` the active study.
    ///
    /// Pending loads of all other studies are cancelled. Unless a fixed limit is configured, the
    /// number of concurrent loads is adapted to the size of the study.
    pub fn open_study(&self, study: &StudyId, total_slices: u32) {
        self.studies
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(study.clone(), total_slices);

        let cancelled = self.loader.set_active_study(study);
        let concurrency = self
            .fixed_concurrency
            .unwrap_or_else(|| concurrency_for_study(total_slices));
        self.loader.set_max_concurrent_loads(concurrency);

        tracing::info!(
            study = %study,
            total_slices,
            concurrency,
            cancelled,
            "Opened study"
        );
    }

    /// Forgets everything about `study` and releases its cached frames.
    pub fn close_study(&self, study: &StudyId) {
        self.studies
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(study);
        self.tracker.forget(study);
        let cancelled = self.loader.cancel_study(study);
        let released = self
            .store
            .clear_matching(|entry| entry.key().study == *study);

        tracing::info!(study = %study, cancelled, released, "Closed study");
    }

    /// The number of slices of an open study.
    pub fn total_slices(&self, study: &StudyId) -> Option<u32> {
        self.studies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(study)
            .copied()
    }

    /// Records that the user is looking at `slice` right now.
    pub fn observe(&self, study: &StudyId, slice: u32) -> NavigationPattern {
        self.observe_at(study, slice, Instant::now())
    }

    pub fn observe_at(&self, study: &StudyId, slice: u32, at: Instant) -> NavigationPattern {
        self.tracker.observe(study, slice, at)
    }

    /// Predicts the slices needed after `current_slice`, most urgent first.
    ///
    /// Studies that were not opened have no known size and yield no predictions.
    pub fn predict(&self, study: &StudyId, current_slice: u32, requested_count: usize) -> Vec<u32> {
        let Some(total_slices) = self.total_slices(study) else {
            tracing::debug!(study = %study, "Not predicting for unknown study");
            return Vec::new();
        };

        self.predict_with(
            study,
            PredictionRequest {
                current_slice,
                requested_count,
                total_slices,
                direction: None,
            },
        )
    }

    pub fn predict_with(&self, study: &StudyId, request: PredictionRequest) -> Vec<u32> {
        let pattern = self.tracker.pattern(study);
        self.predictor.predict(pattern.as_ref(), request)
    }

    /// Schedules the predicted slices around `current_slice` for loading.
    ///
    /// Returns the number of slices that were not cached yet.
    pub fn prefetch(&self, study: &StudyId, current_slice: u32) -> usize {
        let quality = self.quality.target();
        let predicted = self.predict(study, current_slice, self.prefetch.window_size);

        let mut scheduled = 0;
        for (rank, slice) in predicted.into_iter().enumerate() {
            let key = FrameKey::new(study.clone(), slice, quality);
            if self.loader.prefetch(key, rank as u32) {
                scheduled += 1;
            }
        }

        tracing::trace!(study = %study, current_slice, scheduled, "Scheduled prefetch");
        scheduled
    }

    /// Requests a frame, see [`BatchLoadCoordinator::request_frame`].
    pub fn request_frame(&self, key: FrameKey, origin: Origin, priority: u32) -> FrameHandle {
        self.loader.request_frame(key, origin, priority)
    }

    /// Demands a slice at the current target quality.
    pub fn request_slice(&self, study: &StudyId, slice: u32) -> FrameHandle {
        let key = FrameKey::new(study.clone(), slice, self.quality.target());
        self.loader.request_frame(key, Origin::Demand, 0)
    }

    /// Handles the user moving to `slice`.
    ///
    /// This updates the navigation model, demands the slice and prefetches the predicted ones.
    pub fn navigate(&self, study: &StudyId, slice: u32) -> FrameHandle {
        self.observe(study, slice);
        let handle = self.request_slice(study, slice);
        self.prefetch(study, slice);
        handle
    }

    /// Samples memory pressure and relieves it.
    ///
    /// High pressure evicts down to below the threshold right away, critical pressure also
    /// lowers the quality of subsequent requests.
    pub fn sample(&self) -> PressureLevel {
        let budget = self.store.max_bytes();
        let level = self.monitor.sample(self.store.used_bytes(), budget);

        if level >= PressureLevel::High {
            let target = self.monitor.relief_target(budget, self.pressure.relief);
            let evicted = self.store.shrink_to(target);
            tracing::debug!(level = level.as_str(), target, evicted, "Relieved memory pressure");
        }
        if level == PressureLevel::Critical {
            self.quality.degrade();
        }

        level
    }

    pub fn record_render_time(&self, elapsed: Duration) {
        self.monitor.record_render_time(elapsed);
    }

    /// The quality level new requests are made at.
    pub fn target_quality(&self) -> QualityLevel {
        self.quality.target()
    }

    /// Raises the target quality by one level.
    pub fn request_quality_upgrade(&self) -> QualityLevel {
        self.quality.request_upgrade()
    }

    pub fn set_max_concurrent_loads(&self, limit: usize) {
        self.loader.set_max_concurrent_loads(limit);
    }

    pub fn statistics(&self) -> Statistics {
        let store = self.store.stats();
        let loader = self.loader.stats();
        Statistics {
            hit_rate: store.hit_rate(),
            eviction_count: store.evictions,
            memory_usage: store.used_bytes,
            memory_budget: store.max_bytes,
            entries: store.entries,
            prefetch_hit_rate: store.prefetch_hit_rate(),
            loads_in_flight: loader.in_flight,
            loads_queued: loader.queued,
            max_concurrent_loads: loader.max_concurrent_loads,
            fetches: loader.fetches,
            failed_prefetches: loader.failed_prefetches,
            failed_demands: loader.failed_demands,
            quality_level: self.quality.target(),
            pressure: self.monitor.last_level(),
        }
    }
}

async fn sample_periodically(
    engine: Weak<FrameEngine>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let start = tokio::time::Instant::now() + interval;
    let mut ticker = tokio::time::interval_at(start, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        // the engine is gone, and the cancellation is on its way
        let Some(engine) = engine.upgrade() else {
            continue;
        };
        engine.sample();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concurrency_for_study() {
        assert_eq!(concurrency_for_study(1), 1);
        assert_eq!(concurrency_for_study(31), 1);
        assert_eq!(concurrency_for_study(32), 2);
        assert_eq!(concurrency_for_study(95), 2);
        assert_eq!(concurrency_for_study(96), 4);
        assert_eq!(concurrency_for_study(1000), 4);
    }
}
