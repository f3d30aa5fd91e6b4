//! Memory and render pressure, and the quality level it implies.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;

use crate::config::{CacheConfig, PressureConfig};
use crate::types::QualityLevel;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PressureLevel {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl PressureLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            PressureLevel::Low => "low",
            PressureLevel::Medium => "medium",
            PressureLevel::High => "high",
            PressureLevel::Critical => "critical",
        }
    }

    fn escalate(self) -> Self {
        match self {
            PressureLevel::Low => PressureLevel::Medium,
            PressureLevel::Medium => PressureLevel::High,
            PressureLevel::High | PressureLevel::Critical => PressureLevel::Critical,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => PressureLevel::Low,
            1 => PressureLevel::Medium,
            2 => PressureLevel::High,
            _ => PressureLevel::Critical,
        }
    }
}

/// Classifies memory occupancy and render latency into a [`PressureLevel`].
///
/// With a threshold `t` (a fraction of the budget), occupancy of at least `t` is high, at least
/// halfway between `t` and the full budget is critical, and at least `0.75 * t` is medium. An
/// average render time above the target raises the level by one step.
#[derive(Debug)]
pub struct PressureMonitor {
    threshold: f64,
    target_frame_time: Duration,
    latency_window: usize,
    render_times: Mutex<VecDeque<Duration>>,
    last_level: AtomicU8,
}

impl PressureMonitor {
    pub fn new(threshold: f64, target_frame_time: Duration, latency_window: usize) -> Self {
        let latency_window = latency_window.max(1);
        Self {
            threshold: threshold.clamp(0.5, 0.95),
            target_frame_time,
            latency_window,
            render_times: Mutex::new(VecDeque::with_capacity(latency_window)),
            last_level: AtomicU8::new(PressureLevel::Low as u8),
        }
    }

    pub fn from_config(cache: &CacheConfig, pressure: &PressureConfig) -> Self {
        Self::new(
            cache.pressure_threshold(),
            pressure.target_frame_time,
            pressure.latency_window,
        )
    }

    /// The occupancy at which pressure counts as high, as a fraction of the budget.
    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Records how long the renderer took for a frame.
    pub fn record_render_time(&self, elapsed: Duration) {
        let mut render_times = self
            .render_times
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if render_times.len() == self.latency_window {
            render_times.pop_front();
        }
        render_times.push_back(elapsed);
    }

    /// The average of the recorded render times, if any were recorded.
    pub fn average_render_time(&self) -> Option<Duration> {
        let render_times = self
            .render_times
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if render_times.is_empty() {
            return None;
        }
        let total: Duration = render_times.iter().sum();
        Some(total / render_times.len() as u32)
    }

    /// The pressure caused by memory occupancy alone.
    pub fn occupancy_level(&self, used_bytes: u64, budget_bytes: u64) -> PressureLevel {
        let occupancy = if budget_bytes == 0 {
            1.0
        } else {
            used_bytes as f64 / budget_bytes as f64
        };

        let critical = self.threshold + (1.0 - self.threshold) / 2.0;
        if occupancy >= critical {
            PressureLevel::Critical
        } else if occupancy >= self.threshold {
            PressureLevel::High
        } else if occupancy >= 0.75 * self.threshold {
            PressureLevel::Medium
        } else {
            PressureLevel::Low
        }
    }

    /// Computes the current pressure level.
    pub fn sample(&self, used_bytes: u64, budget_bytes: u64) -> PressureLevel {
        let mut level = self.occupancy_level(used_bytes, budget_bytes);
        let average = self.average_render_time();
        if average.is_some_and(|average| average > self.target_frame_time) {
            level = level.escalate();
        }

        let previous = PressureLevel::from_u8(self.last_level.swap(level as u8, Ordering::Relaxed));
        if previous != level {
            tracing::debug!(
                previous = previous.as_str(),
                level = level.as_str(),
                used_bytes,
                budget_bytes,
                average_render_time = ?average,
                "Memory pressure changed"
            );
        }
        metric!(gauge("pressure.level") = level as u64);

        level
    }

    /// The level computed by the last [`sample`](Self::sample).
    pub fn last_level(&self) -> PressureLevel {
        PressureLevel::from_u8(self.last_level.load(Ordering::Relaxed))
    }

    /// The occupancy a relief pass evicts down to, `relief` below the threshold.
    pub fn relief_target(&self, budget_bytes: u64, relief: f64) -> u64 {
        let fraction = (self.threshold - relief.max(0.0)).max(0.0);
        (budget_bytes as f64 * fraction) as u64
    }
}

/// The quality level new requests are made at.
///
/// Quality only ever gets coarser on its own. Going back to finer levels has to be requested.
#[derive(Debug)]
pub struct QualitySelector {
    level: AtomicU8,
    coarsest: QualityLevel,
}

impl QualitySelector {
    pub fn new(coarsest: QualityLevel) -> Self {
        Self {
            level: AtomicU8::new(QualityLevel::FULL.level()),
            coarsest,
        }
    }

    pub fn target(&self) -> QualityLevel {
        QualityLevel::new(self.level.load(Ordering::Relaxed))
    }

    /// Steps one level coarser, returning the new level if it changed.
    pub fn degrade(&self) -> Option<QualityLevel> {
        let coarsest = self.coarsest;
        let previous = self
            .level
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |level| {
                let next = QualityLevel::new(level).coarser(coarsest);
                (next.level() != level).then_some(next.level())
            })
            .ok()?;

        let level = QualityLevel::new(previous).coarser(coarsest);
        metric!(counter("quality.degraded") += 1, "level" => &level.to_string());
        tracing::info!(%level, "Degraded frame quality");
        Some(level)
    }

    /// Steps one level finer and returns the new target.
    pub fn request_upgrade(&self) -> QualityLevel {
        let previous = self
            .level
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |level| {
                Some(QualityLevel::new(level).finer().level())
            })
            .unwrap_or_else(|level| level);
        let level = QualityLevel::new(previous).finer();
        if level.level() != previous {
            tracing::info!(%level, "Upgraded frame quality");
        }
        level
    }
}
