use std::cmp::Ordering;
use std::time::Duration;

use serde::{Deserialize, Serialize};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;
const SECS_PER_HOUR: f64 = 3600.0;

/// Named weight presets for the [`EvictionScorer`].
///
/// All presets rank entries with the same four terms, they only shift the balance between them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// Every term counts the same.
    #[default]
    Balanced,
    /// Favors recently touched entries.
    Recency,
    /// Favors entries that are read often.
    Frequency,
    /// Frees memory with as few evictions as possible by targeting large entries.
    Footprint,
}

impl EvictionPolicy {
    pub fn weights(self) -> ScoreWeights {
        match self {
            EvictionPolicy::Balanced => ScoreWeights {
                age: 1.0,
                rarity: 1.0,
                size: 1.0,
                unimportance: 1.0,
            },
            EvictionPolicy::Recency => ScoreWeights {
                age: 4.0,
                rarity: 0.5,
                size: 0.5,
                unimportance: 1.0,
            },
            EvictionPolicy::Frequency => ScoreWeights {
                age: 0.5,
                rarity: 4.0,
                size: 0.5,
                unimportance: 1.0,
            },
            EvictionPolicy::Footprint => ScoreWeights {
                age: 0.5,
                rarity: 0.5,
                size: 4.0,
                unimportance: 1.0,
            },
        }
    }
}

/// Weights of the individual terms of an eviction score.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScoreWeights {
    /// Weight of the time since the last access, in hours.
    pub age: f64,
    /// Weight of `1 / (access_count + 1)`.
    pub rarity: f64,
    /// Weight of the payload size, in megabytes.
    pub size: f64,
    /// Weight of `1 / (priority_hint + 1)`.
    pub unimportance: f64,
}

/// The inputs of an eviction score.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EntryStats {
    /// Time since the entry was last read or written.
    pub idle: Duration,
    pub access_count: u64,
    pub size_bytes: u64,
    pub priority_hint: u32,
}

/// Ranks cache entries for eviction.
///
/// Each term grows the more expendable an entry is: long idle, rarely read, large, and not
/// close to where the user is looking. The score is the negated weighted sum of those terms, so
/// the entry with the *lowest* score is evicted first.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EvictionScorer {
    weights: ScoreWeights,
}

impl EvictionScorer {
    pub fn new(weights: ScoreWeights) -> Self {
        Self { weights }
    }

    pub fn for_policy(policy: EvictionPolicy) -> Self {
        Self::new(policy.weights())
    }

    pub fn weights(&self) -> ScoreWeights {
        self.weights
    }

    pub fn score(&self, stats: &EntryStats) -> f64 {
        let ScoreWeights {
            age,
            rarity,
            size,
            unimportance,
        } = self.weights;

        let age_hours = stats.idle.as_secs_f64() / SECS_PER_HOUR;
        let rarity_term = 1.0 / (stats.access_count as f64 + 1.0);
        let size_mb = stats.size_bytes as f64 / BYTES_PER_MB;
        let unimportance_term = 1.0 / (f64::from(stats.priority_hint) + 1.0);

        -(age * age_hours + rarity * rarity_term + size * size_mb + unimportance * unimportance_term)
    }

    /// Orders two candidates so that the one to evict first compares as [`Ordering::Less`].
    ///
    /// `sequence` is the insertion order, the older entry goes first on equal scores.
    pub fn compare(&self, a: (f64, u64), b: (f64, u64)) -> Ordering {
        a.0.total_cmp(&b.0).then(a.1.cmp(&b.1))
    }

    /// Sorts `(key, sequence, stats)` candidates into eviction order.
    pub fn eviction_order<K>(
        &self,
        candidates: impl IntoIterator<Item = (K, u64, EntryStats)>,
    ) -> Vec<K> {
        let mut scored: Vec<_> = candidates
            .into_iter()
            .map(|(key, sequence, stats)| (key, (self.score(&stats), sequence)))
            .collect();
        scored.sort_by(|(_, a), (_, b)| self.compare(*a, *b));
        scored.into_iter().map(|(key, _)| key).collect()
    }
}

impl Default for EvictionScorer {
    fn default() -> Self {
        Self::for_policy(EvictionPolicy::default())
    }
}
