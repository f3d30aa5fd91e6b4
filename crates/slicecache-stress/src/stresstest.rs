use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use sentry::SentryFutureExt;
use serde::Serialize;
use sketches_ddsketch::DDSketch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

use slicecache_service::config::Config;
use slicecache_service::engine::{FrameEngine, Statistics};
use slicecache_service::types::StudyId;

use crate::workloads::{Scrubber, SyntheticFrameSource, Workload, WorkloadsConfig};

/// The outcome of running one workload.
#[derive(Debug, Serialize)]
pub struct WorkloadReport {
    pub study: String,
    pub navigations: u64,
    pub failures: u64,
    #[serde(with = "humantime_serde")]
    pub avg: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub p50: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub p90: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub p99: Option<Duration>,
    pub statistics: Statistics,
}

impl WorkloadReport {
    fn new(study: String, latencies: &DDSketch, failures: u64, statistics: Statistics) -> Self {
        let quantile = |q| {
            latencies
                .quantile(q)
                .ok()
                .flatten()
                .map(Duration::from_secs_f64)
        };
        let navigations = latencies.count() as u64;
        let avg = latencies
            .sum()
            .filter(|_| navigations > 0)
            .map(|sum| Duration::from_secs_f64(sum / navigations as f64));

        Self {
            study,
            navigations,
            failures,
            avg,
            p50: quantile(0.5),
            p90: quantile(0.9),
            p99: quantile(0.99),
            statistics,
        }
    }
}

impl fmt::Display for WorkloadReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let or_zero = |d: Option<Duration>| d.unwrap_or_default();
        let stats = &self.statistics;

        writeln!(
            f,
            "Workload {}: {} navigations, {} failed",
            self.study, self.navigations, self.failures
        )?;
        writeln!(
            f,
            "  avg: {:.2?}; p50: {:.2?}; p90: {:.2?}; p99: {:.2?}",
            or_zero(self.avg),
            or_zero(self.p50),
            or_zero(self.p90),
            or_zero(self.p99)
        )?;
        writeln!(
            f,
            "  hit rate: {:.1}%; prefetch hit rate: {:.1}%; fetches: {}; evictions: {}",
            stats.hit_rate * 100.0,
            stats.prefetch_hit_rate * 100.0,
            stats.fetches,
            stats.eviction_count
        )?;
        write!(
            f,
            "  memory: {}/{} bytes; pressure: {}; quality: {}",
            stats.memory_usage,
            stats.memory_budget,
            stats.pressure.as_str(),
            stats.quality_level
        )
    }
}

pub async fn perform_stresstest(
    config: Config,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<Vec<WorkloadReport>> {
    let config = Arc::new(config);

    let mut tasks = JoinSet::new();
    for (i, workload) in workloads.workloads.into_iter().enumerate() {
        let source = SyntheticFrameSource::new(&workload)
            .with_context(|| format!("failed to prepare workload {i}"))?;
        let config = Arc::clone(&config);
        let task = run_workload(config, workload, Arc::new(source), duration);
        tasks.spawn(async move { (i, task.await) });
    }

    let mut reports = tasks.join_all().await;
    reports.sort_by_key(|(i, _)| *i);

    Ok(reports.into_iter().map(|(_, report)| report).collect())
}

async fn run_workload(
    config: Arc<Config>,
    workload: Workload,
    source: Arc<SyntheticFrameSource>,
    duration: Duration,
) -> WorkloadReport {
    let runtime = tokio::runtime::Handle::current();
    let engine = FrameEngine::new(&config, source, runtime);
    let study = StudyId::new(&workload.study);
    engine.open_study(&study, workload.slices);

    let latencies = Arc::new(Mutex::new(DDSketch::default()));
    let failures = Arc::new(AtomicU64::new(0));
    let mut scrubber = Scrubber::new(workload.pattern, workload.slices);

    let period = Duration::from_secs_f64(1.0 / workload.rate.max(0.001));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let deadline = tokio::time::Instant::now() + duration;
    let sleep = tokio::time::sleep_until(deadline);
    tokio::pin!(sleep);

    let mut outstanding = JoinSet::new();
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let slice = scrubber.next_slice();
                let start = Instant::now();
                let handle = engine.navigate(&study, slice);

                let latencies = Arc::clone(&latencies);
                let failures = Arc::clone(&failures);
                let engine = Arc::clone(&engine);

                let hub = sentry::Hub::new_from_top(sentry::Hub::current());
                let future = async move {
                    match handle.await {
                        Ok(_) => {
                            let elapsed = start.elapsed();
                            engine.record_render_time(elapsed);
                            latencies
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .add(elapsed.as_secs_f64());
                        }
                        Err(error) => {
                            tracing::debug!(slice, error = %error, "Navigation failed");
                            failures.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                };
                outstanding.spawn(future.bind_hub(hub));
            }
            _ = &mut sleep => break,
        }
    }

    // wait for all outstanding navigations to finish
    outstanding.join_all().await;
    engine.sample();

    let latencies: DDSketch = {
        let mut latencies = latencies.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut latencies)
    };
    let failures = failures.load(Ordering::Relaxed);
    WorkloadReport::new(workload.study, &latencies, failures, engine.statistics())
}
