//! Wall-clock source for timestamps and rate buckets.

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use std::fmt::Debug;
use std::sync::Arc;

/// Source of "now" for job timestamps and minute buckets.
pub trait Clock: Debug + Send + Sync {
    /// Current time.
    fn now(&self) -> DateTime<Utc>;

    /// Index of the current minute since the Unix epoch.
    fn minute_bucket(&self) -> i64 {
        self.now().timestamp().div_euclid(60)
    }
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock driven by tokio's timer.
///
/// Starts at the beginning of the current wall-clock minute and advances with
/// `tokio::time::Instant`, so it follows paused and auto-advanced time in
/// tests.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    base: DateTime<Utc>,
    origin: tokio::time::Instant,
}

impl TokioClock {
    /// Create a clock anchored at the start of the current minute.
    #[must_use]
    pub fn new() -> Self {
        let now = Utc::now();
        let base = now.duration_trunc(TimeDelta::minutes(1)).unwrap_or(now);
        Self {
            base,
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = TimeDelta::from_std(self.origin.elapsed()).unwrap_or(TimeDelta::zero());
        self.base + elapsed
    }
}

/// Shared clock handle.
pub type SharedClock = Arc<dyn Clock>;

/// Default clock for production use.
#[must_use]
pub fn system() -> SharedClock {
    Arc::new(SystemClock)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_tokio_clock_follows_paused_time() {
        let clock = TokioClock::new();
        let start = clock.now();
        let bucket = clock.minute_bucket();

        tokio::time::sleep(Duration::from_secs(61)).await;

        assert_eq!((clock.now() - start).num_seconds(), 61);
        assert_eq!(clock.minute_bucket(), bucket + 1);
    }

    #[test]
    fn test_minute_bucket_is_floor_of_minutes() {
        let clock = SystemClock;
        let before = Utc::now().timestamp() / 60;
        let bucket = clock.minute_bucket();
        let after = Utc::now().timestamp() / 60;
        assert!((before..=after).contains(&bucket));
    }
}
