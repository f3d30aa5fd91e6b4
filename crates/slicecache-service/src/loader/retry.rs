use std::time::Duration;

use crate::config::RetryConfig;

/// Exponential backoff with random jitter.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    attempts: u32,
    base_delay: Duration,
    backoff_factor: f64,
    max_delay: Duration,
    jitter: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            attempts: config.attempts.max(1),
            base_delay: config.base_delay,
            backoff_factor: config.backoff_factor.max(1.0),
            max_delay: config.max_delay,
            jitter: config.jitter,
        }
    }

    /// The total number of fetch attempts, at least 1.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether another attempt is allowed after `attempt` attempts have failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.attempts
    }

    /// The delay before the retry following the failed `attempt` (counting from 1).
    ///
    /// This is `min(base * factor^(attempt - 1), max_delay)` plus up to `jitter` on top.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff(attempt) + self.jitter.mul_f64(rand::random::<f64>())
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}
