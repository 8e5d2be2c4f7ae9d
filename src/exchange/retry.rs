//! Exponential backoff for transient exchange failures.

use crate::config::RetryConfig;
use std::time::Duration;

/// Retry schedule for one logical request.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
    /// Extra random delay as a fraction of the computed delay.
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay_ms: config.base_delay_ms,
            backoff_multiplier: config.backoff_multiplier.max(1.0),
            max_delay_ms: config.max_delay_ms,
            jitter_ratio: config.jitter_ratio.clamp(0.0, 1.0),
        }
    }
}

impl RetryPolicy {
    /// Disable jitter, for deterministic schedules.
    pub fn without_jitter(mut self) -> Self {
        self.jitter_ratio = 0.0;
        self
    }

    /// True if another attempt is allowed after `attempt` failed.
    pub fn allows_retry_after(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before retry number `retry` (1 = before the second attempt).
    ///
    /// `base * multiplier^(retry-1)`, capped at `max_delay_ms`, plus up to
    /// `jitter_ratio` of that.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let exp = self.backoff_multiplier.powi(retry as i32 - 1);
        let delay = (self.base_delay_ms as f64 * exp).min(self.max_delay_ms as f64);
        let jitter = if self.jitter_ratio > 0.0 {
            delay * rand::random::<f64>() * self.jitter_ratio
        } else {
            0.0
        };
        Duration::from_millis((delay + jitter) as u64)
    }
}
