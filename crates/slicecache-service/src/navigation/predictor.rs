use super::tracker::{Direction, NavigationPattern};
use crate::config::PrefetchConfig;

/// The input of a single prediction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PredictionRequest {
    pub current_slice: u32,
    /// Number of slices to predict when navigating at 1 slice/s.
    pub requested_count: usize,
    /// Number of slices in the study, predictions outside of it are dropped.
    pub total_slices: u32,
    /// Overrides the direction of the navigation pattern.
    pub direction: Option<Direction>,
}

/// Predicts which slices the user will look at next.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PrefetchPredictor {
    min_scale: f64,
    max_scale: f64,
}

impl PrefetchPredictor {
    pub fn new(min_scale: f64, max_scale: f64) -> Self {
        let min_scale = min_scale.max(0.0);
        Self {
            min_scale,
            max_scale: max_scale.max(min_scale),
        }
    }

    pub fn from_config(config: &PrefetchConfig) -> Self {
        Self::new(config.min_velocity_scale, config.max_velocity_scale)
    }

    /// Number of slices to predict in each direction.
    pub fn window(&self, requested_count: usize, velocity: f64) -> usize {
        let scale = velocity.abs().clamp(self.min_scale, self.max_scale);
        (requested_count as f64 * scale).round() as usize
    }

    /// Returns the predicted slices, most urgent first.
    ///
    /// Without a pattern the navigation is assumed to be bidirectional at zero velocity. Slices
    /// ahead of the current one are always predicted, slices behind it only when navigating
    /// backwards or back and forth. Both sides are interleaved so that the nearest slice in the
    /// dominant direction comes first.
    pub fn predict(
        &self,
        pattern: Option<&NavigationPattern>,
        request: PredictionRequest,
    ) -> Vec<u32> {
        let velocity = pattern.map_or(0.0, NavigationPattern::velocity);
        let direction = request
            .direction
            .or(pattern.map(NavigationPattern::direction))
            .unwrap_or_default();

        // no side can yield more slices than the study has
        let count = self
            .window(request.requested_count, velocity)
            .min(request.total_slices as usize);
        let current = i64::from(request.current_slice);
        let total = i64::from(request.total_slices);

        let backward_first = match direction {
            Direction::Forward => None,
            Direction::Backward => Some(true),
            Direction::Bidirectional => Some(velocity < 0.0),
        };

        let capacity = count.saturating_mul(2).min(request.total_slices as usize);
        let mut slices = Vec::with_capacity(capacity);
        let mut push = |slice: i64| {
            if (0..total).contains(&slice) {
                slices.push(slice as u32);
            }
        };

        for distance in 1..=count as i64 {
            let ahead = current + distance;
            let behind = current - distance;
            match backward_first {
                None => push(ahead),
                Some(true) => {
                    push(behind);
                    push(ahead);
                }
                Some(false) => {
                    push(ahead);
                    push(behind);
                }
            }
        }

        slices
    }
}

impl Default for PrefetchPredictor {
    fn default() -> Self {
        Self::from_config(&PrefetchConfig::default())
    }
}
