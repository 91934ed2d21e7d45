//! Exponential backoff with jitter.

use crate::config::PoolSettings;
use rand::Rng;
use std::time::Duration;

/// How many times a fetch is retried and how long to wait between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Ceiling on any single delay.
    pub max_delay: Duration,
    /// Largest random stretch, as a fraction of the base delay.
    pub jitter: f64,
}

impl RetryPolicy {
    /// Policy from pool settings.
    #[must_use]
    pub const fn from_settings(settings: &PoolSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            jitter: settings.jitter,
        }
    }

    /// Delay before retry number `attempt` (1-based), with random jitter.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let stretch = if self.jitter > 0.0 {
            rand::thread_rng().gen_range(0.0..=self.jitter)
        } else {
            0.0
        };
        self.delay_with(attempt, stretch)
    }

    /// `min(max_delay, initial_delay * 2^(attempt-1) * (1 + stretch))`.
    #[must_use]
    pub fn delay_with(&self, attempt: u32, stretch: f64) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30);
        let factor = f64::from(1_u32 << exponent) * (1.0 + stretch.max(0.0));
        let delay = self.initial_delay.as_secs_f64() * factor;
        if !delay.is_finite() || delay >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&PoolSettings::default())
    }
}
