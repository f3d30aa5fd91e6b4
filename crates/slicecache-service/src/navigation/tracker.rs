use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::types::StudyId;

/// The smallest history that still allows inferring a direction.
const MIN_HISTORY: usize = 3;

/// The dominant direction of navigation through a study.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Towards higher slice indices.
    Forward,
    /// Towards lower slice indices.
    Backward,
    /// No clear direction, the user is moving back and forth.
    #[default]
    Bidirectional,
}

/// A single navigation event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Observation {
    pub slice: u32,
    pub at: Instant,
}

/// The navigation model of a single study.
#[derive(Clone, Debug)]
pub struct NavigationPattern {
    direction: Direction,
    /// Slices per second, signed.
    velocity: f64,
    /// Slices per second², signed.
    acceleration: f64,
    history: VecDeque<Observation>,
    capacity: usize,
}

impl NavigationPattern {
    /// Creates an empty pattern keeping up to `capacity` observations.
    ///
    /// The capacity is raised to at least 3.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(MIN_HISTORY);
        Self {
            direction: Direction::default(),
            velocity: 0.0,
            acceleration: 0.0,
            history: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn velocity(&self) -> f64 {
        self.velocity
    }

    pub fn acceleration(&self) -> f64 {
        self.acceleration
    }

    pub fn history(&self) -> impl ExactSizeIterator<Item = &Observation> {
        self.history.iter()
    }

    /// The most recently observed slice.
    pub fn current_slice(&self) -> Option<u32> {
        self.history.back().map(|observation| observation.slice)
    }

    /// Appends an observation and updates the derived quantities.
    ///
    /// Velocity and acceleration only change when time has passed since the previous
    /// observation. The direction only changes once there are three observations to look at.
    pub fn record(&mut self, slice: u32, at: Instant) {
        if let Some(previous) = self.history.back() {
            let dt = at.saturating_duration_since(previous.at).as_secs_f64();
            if dt > 0.0 {
                let velocity = (f64::from(slice) - f64::from(previous.slice)) / dt;
                self.acceleration = (velocity - self.velocity) / dt;
                self.velocity = velocity;
            }
        }

        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(Observation { slice, at });

        if let Some(direction) = self.infer_direction() {
            self.direction = direction;
        }
    }

    fn infer_direction(&self) -> Option<Direction> {
        let len = self.history.len();
        if len < MIN_HISTORY {
            return None;
        }

        let recent: Vec<_> = self.history.range(len - MIN_HISTORY..).collect();
        let (mut positive, mut negative) = (0, 0);
        for pair in recent.windows(2) {
            match pair[1].slice.cmp(&pair[0].slice) {
                std::cmp::Ordering::Greater => positive += 1,
                std::cmp::Ordering::Less => negative += 1,
                std::cmp::Ordering::Equal => {}
            }
        }

        Some(if positive >= 2 {
            Direction::Forward
        } else if positive == 0 && negative > 0 {
            Direction::Backward
        } else {
            Direction::Bidirectional
        })
    }
}

/// Keeps a [`NavigationPattern`] per study.
#[derive(Debug)]
pub struct PatternTracker {
    history_size: usize,
    patterns: Mutex<FxHashMap<StudyId, NavigationPattern>>,
}

impl PatternTracker {
    pub fn new(history_size: usize) -> Self {
        Self {
            history_size,
            patterns: Mutex::default(),
        }
    }

    /// Records that `slice` of `study` was shown at `at`, creating the pattern on first use.
    ///
    /// Returns a snapshot of the updated pattern.
    pub fn observe(&self, study: &StudyId, slice: u32, at: Instant) -> NavigationPattern {
        let mut patterns = self.patterns.lock().unwrap_or_else(PoisonError::into_inner);
        let pattern = patterns
            .entry(study.clone())
            .or_insert_with(|| NavigationPattern::new(self.history_size));
        pattern.record(slice, at);

        tracing::trace!(
            study = %study,
            slice,
            direction = ?pattern.direction(),
            velocity = pattern.velocity(),
            "Observed navigation"
        );

        pattern.clone()
    }

    pub fn pattern(&self, study: &StudyId) -> Option<NavigationPattern> {
        let patterns = self.patterns.lock().unwrap_or_else(PoisonError::into_inner);
        patterns.get(study).cloned()
    }

    pub fn forget(&self, study: &StudyId) {
        let mut patterns = self.patterns.lock().unwrap_or_else(PoisonError::into_inner);
        patterns.remove(study);
    }
}
