//! Cancellation, owned timers and tickers.
//!
//! Every timer, sweep and loop in this crate is an owned task: it is either
//! registered in a [`TimerRegistry`] or wrapped in a [`Ticker`], and it is
//! cancelled on shutdown instead of being left to leak across restarts.

use super::JobId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// A cancellation token shared between an owner and its tasks.
///
/// # Examples
///
/// ```rust
/// use acton_queue::jobs::CancellationToken;
/// use std::time::Duration;
///
/// #[tokio::main]
/// async fn main() {
///     let token = CancellationToken::new();
///     let child = token.clone();
///     let handle = tokio::spawn(async move {
///         // Returns false once the token is cancelled
///         while child.sleep(Duration::from_millis(10)).await {}
///     });
///
///     token.cancel();
///     let _ = handle.await;
/// }
/// ```
#[derive(Debug, Clone)]
pub struct CancellationToken {
    state: Arc<CancellationState>,
}

#[derive(Debug)]
struct CancellationState {
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

impl CancellationToken {
    /// Create a new cancellation token.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            state: Arc::new(CancellationState { tx, rx }),
        }
    }

    /// Check if cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.state.rx.borrow()
    }

    /// Request cancellation of every clone of this token.
    pub fn cancel(&self) {
        let _ = self.state.tx.send(true);
        debug!("Cancellation requested");
    }

    /// Wait for the cancellation signal.
    ///
    /// Returns immediately if already cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.state.rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Sleep for `duration` unless cancelled first.
    ///
    /// Returns `true` if the full duration elapsed, `false` on cancellation.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            () = tokio::time::sleep(duration) => !self.is_cancelled(),
            () = self.cancelled() => false,
        }
    }

    /// Run a future, abandoning it if the token is cancelled.
    ///
    /// # Errors
    ///
    /// Returns `Err(())` if the operation was cancelled.
    pub async fn run_until_cancelled<F, T>(&self, future: F) -> Result<T, ()>
    where
        F: Future<Output = T>,
    {
        tokio::select! {
            result = future => Ok(result),
            () = self.cancelled() => Err(()),
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot timers keyed by job, e.g. admission timeout sweeps.
///
/// Arming a job that already has a timer replaces (and aborts) the old one.
#[derive(Debug, Clone, Default)]
pub struct TimerRegistry {
    timers: Arc<Mutex<HashMap<JobId, JoinHandle<()>>>>,
}

impl TimerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` after `delay`, owned by this registry under `job_id`.
    pub fn arm<F>(&self, job_id: JobId, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let registry = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Drop our own entry first so disarm() from inside `task` can't abort us
            registry.timers.lock().remove(&job_id);
            task.await;
        });

        if let Some(previous) = self.timers.lock().insert(job_id, handle) {
            previous.abort();
        }
        debug!(job_id = %job_id, delay_ms = delay.as_millis(), "Armed timer");
    }

    /// Abort the timer for `job_id`, if any. Returns whether one was armed.
    pub fn disarm(&self, job_id: &JobId) -> bool {
        self.timers.lock().remove(job_id).is_some_and(|handle| {
            handle.abort();
            true
        })
    }

    /// Abort every armed timer.
    pub fn abort_all(&self) {
        let drained: Vec<_> = self.timers.lock().drain().collect();
        for (job_id, handle) in drained {
            handle.abort();
            debug!(job_id = %job_id, "Aborted timer");
        }
    }

    /// Number of timers currently armed.
    #[must_use]
    pub fn armed_count(&self) -> usize {
        self.timers.lock().len()
    }
}

/// An owned periodic task.
///
/// The task stops when [`Ticker::stop`] is called, when the token it was
/// started with is cancelled, or when the `Ticker` is dropped.
#[derive(Debug)]
pub struct Ticker {
    name: &'static str,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Ticker {
    /// Spawn `tick` every `period`, starting after one full period.
    pub fn spawn<F, Fut>(
        name: &'static str,
        period: Duration,
        parent: &CancellationToken,
        mut tick: F,
    ) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let own = token.clone();
        let parent = parent.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        debug!(ticker = name, "Tick");
                        tick().await;
                    }
                    () = own.cancelled() => break,
                    () = parent.cancelled() => break,
                }
            }
            debug!(ticker = name, "Ticker stopped");
        });

        Self {
            name,
            token,
            handle: Some(handle),
        }
    }

    /// Name given at spawn time.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Stop the ticker and wait for an in-progress tick to finish.
    pub async fn stop(mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_cancellation_token_cancel() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());

        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_cancellation_token_clone() {
        let token1 = CancellationToken::new();
        let token2 = token1.clone();

        token1.cancel();
        assert!(token2.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_returns_false_when_cancelled() {
        let token = CancellationToken::new();
        let child = token.clone();
        let sleeper = tokio::spawn(async move { child.sleep(Duration::from_secs(60)).await });

        token.cancel();
        assert!(!sleeper.await.unwrap());

        let fresh = CancellationToken::new();
        assert!(fresh.sleep(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_run_until_cancelled() {
        let token = CancellationToken::new();
        let token_clone = token.clone();
        let result = tokio::spawn(async move {
            token_clone
                .run_until_cancelled(async {
                    tokio::time::sleep(Duration::from_secs(1000)).await;
                    42
                })
                .await
        });

        token.cancel();

        let output = result.await.unwrap();
        assert_eq!(output, Err(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_once() {
        let registry = TimerRegistry::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();

        registry.arm(JobId::new(), Duration::from_secs(15), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(registry.armed_count(), 1);

        tokio::time::sleep(Duration::from_secs(16)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(registry.armed_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarmed_timer_never_fires() {
        let registry = TimerRegistry::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let job_id = JobId::new();

        registry.arm(job_id, Duration::from_secs(15), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(registry.disarm(&job_id));
        assert!(!registry.disarm(&job_id));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_runs_until_stopped() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let parent = CancellationToken::new();

        let ticker = Ticker::spawn("test", Duration::from_secs(1), &parent, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(3500)).await;
        ticker.stop().await;
        let seen = ticks.load(Ordering::SeqCst);
        assert_eq!(seen, 3);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_stops_with_parent() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let parent = CancellationToken::new();

        let _ticker = Ticker::spawn("test", Duration::from_secs(1), &parent, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        parent.cancel();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
    }
}
