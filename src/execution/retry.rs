//! # Retry Backoff
//!
//! Exponential delay between retries of a retryable item failure:
//! `base * multiplier^attempt`, capped at `max_delay`, with optional symmetric
//! jitter so concurrent workers do not retry in lockstep.

use rand::Rng;
use std::time::Duration;

use crate::config::BackoffConfig;

#[derive(Debug, Clone)]
pub struct BackoffCalculator {
    config: BackoffConfig,
}

impl BackoffCalculator {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    /// Delay without jitter for the given zero-based retry attempt
    pub fn base_delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay_ms = self.config.base_delay_ms as f64 * self.config.multiplier.max(1.0).powi(exponent);
        let capped = delay_ms.min(self.config.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }

    /// Delay with jitter applied when enabled; never exceeds the cap
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay_for_attempt(attempt);
        if !self.config.jitter_enabled {
            return base;
        }

        let base_ms = base.as_millis() as u64;
        let jitter_range = (base_ms as f64 * self.config.max_jitter.clamp(0.0, 1.0)) as u64;
        if jitter_range == 0 {
            return base;
        }

        let mut rng = rand::thread_rng();
        let jitter = rng.gen_range(0..=jitter_range);
        let jittered = if rng.gen_bool(0.5) {
            base_ms.saturating_add(jitter)
        } else {
            base_ms.saturating_sub(jitter)
        };
        Duration::from_millis(jittered.min(self.config.max_delay_ms))
    }
}

impl Default for BackoffCalculator {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}
