//! Rate-limited worker pool.
//!
//! Drains one job kind (crawl by default) from the shared store under two
//! global ceilings: at most `rpm` dispatches per minute bucket and at most
//! `concurrency` jobs active at once. Both are enforced by the store's atomic
//! claim, so they hold across every process draining the same queue.
//!
//! The pump is a single task per process. It starts on the first enqueue,
//! claims as many jobs as the budget allows, fans each one out to its own
//! task, and stops once nothing is waiting and nothing it started is still
//! running. Finished tasks wake it early.
//!
//! Each claimed job runs a fetch-with-retry loop. Attempts are bounded by
//! the request timeout and the pool's shutdown token, transient failures are
//! retried with [`RetryPolicy`] backoff, and every retry first reserves a
//! unit of the same minute budget.

mod retry;

pub use retry::RetryPolicy;

use crate::clock::{self, SharedClock};
use crate::config::PoolSettings;
use crate::error::{QueueError, QueueResult};
use crate::executor::SharedExecutor;
use crate::jobs::{CancellationToken, Job, JobId, JobKind, JobState, StateTtls};
use crate::store::{ClaimRequest, FinishRequest, SharedStore};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Pool snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Kind this pool drains.
    pub kind: JobKind,
    /// Jobs waiting in the store.
    pub waiting: usize,
    /// Jobs active in the store, across processes.
    pub active: usize,
    /// Jobs this process is running.
    pub local_in_flight: usize,
    /// Units spent in the current minute bucket.
    pub minute_count: u32,
    /// Requests-per-minute ceiling.
    pub rpm: u32,
    /// Concurrency ceiling.
    pub concurrency: usize,
}

/// Builds a [`RateLimitedWorkerPool`].
pub struct PoolBuilder {
    store: SharedStore,
    executor: SharedExecutor,
    settings: PoolSettings,
    ttls: StateTtls,
    clock: SharedClock,
    kind: JobKind,
}

impl PoolBuilder {
    /// Settings (rates, retries, timeouts).
    #[must_use]
    pub fn settings(mut self, settings: PoolSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Record TTLs.
    #[must_use]
    pub const fn ttls(mut self, ttls: StateTtls) -> Self {
        self.ttls = ttls;
        self
    }

    /// Clock for timestamps and minute buckets.
    #[must_use]
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Job kind to drain.
    #[must_use]
    pub const fn kind(mut self, kind: JobKind) -> Self {
        self.kind = kind;
        self
    }

    /// Build the pool. Nothing runs until the first enqueue or [`RateLimitedWorkerPool::start`].
    #[must_use]
    pub fn build(self) -> RateLimitedWorkerPool {
        RateLimitedWorkerPool {
            inner: Arc::new(PoolInner {
                retry: RetryPolicy::from_settings(&self.settings),
                store: self.store,
                executor: self.executor,
                settings: self.settings,
                ttls: self.ttls,
                clock: self.clock,
                kind: self.kind,
                pumping: AtomicBool::new(false),
                wake: Notify::new(),
                idle: Notify::new(),
                in_flight: AtomicUsize::new(0),
                shutdown: CancellationToken::new(),
                pump: Mutex::new(None),
                tasks: Mutex::new(JoinSet::new()),
            }),
        }
    }
}

/// Shared-queue drain loop bounded by a per-minute rate and a concurrency cap.
#[derive(Clone)]
pub struct RateLimitedWorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    store: SharedStore,
    executor: SharedExecutor,
    settings: PoolSettings,
    retry: RetryPolicy,
    ttls: StateTtls,
    clock: SharedClock,
    kind: JobKind,
    pumping: AtomicBool,
    wake: Notify,
    idle: Notify,
    in_flight: AtomicUsize,
    shutdown: CancellationToken,
    pump: Mutex<Option<JoinHandle<()>>>,
    tasks: Mutex<JoinSet<()>>,
}

impl std::fmt::Debug for RateLimitedWorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitedWorkerPool")
            .field("kind", &self.inner.kind)
            .field("rpm", &self.inner.settings.rpm)
            .field("concurrency", &self.inner.settings.concurrency)
            .field("in_flight", &self.inner.in_flight.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl RateLimitedWorkerPool {
    /// Start building a pool on `store` that runs jobs with `executor`.
    #[must_use]
    pub fn builder(store: SharedStore, executor: SharedExecutor) -> PoolBuilder {
        PoolBuilder {
            store,
            executor,
            settings: PoolSettings::default(),
            ttls: StateTtls::default(),
            clock: clock::system(),
            kind: JobKind::Crawl,
        }
    }

    /// Pool with default ttls and the system clock.
    #[must_use]
    pub fn new(store: SharedStore, executor: SharedExecutor, settings: PoolSettings) -> Self {
        Self::builder(store, executor).settings(settings).build()
    }

    /// Queue a job and make sure the pump is running.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ShuttingDown`] after shutdown, or a store error.
    pub async fn enqueue(&self, subject_id: &str, payload: Value) -> QueueResult<Job> {
        if self.inner.shutdown.is_cancelled() {
            return Err(QueueError::ShuttingDown);
        }

        let mut job = Job::new(self.inner.kind, subject_id, payload);
        job.created_at = self.inner.clock.now();
        let waiting = self.inner.store.push_waiting(job.clone(), self.inner.ttls).await?;
        debug!(job_id = %job.id, kind = %job.kind, subject_id, waiting, "Job enqueued");

        self.ensure_pumping();
        Ok(job)
    }

    /// Resume pumping for jobs already waiting in the store.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn start(&self) -> QueueResult<()> {
        let depth = self.inner.store.depth(self.inner.kind).await?;
        if depth.waiting > 0 {
            info!(kind = %self.inner.kind, waiting = depth.waiting, "Resuming queued jobs");
            self.ensure_pumping();
        }
        Ok(())
    }

    /// Run one attempt right away, outside the queue, if the current minute
    /// still has budget for it.
    ///
    /// Up to `immediate_reserve` units per minute stay reserved for queued
    /// jobs.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::RateLimited`] when the budget is spent, or the
    /// attempt's own error.
    pub async fn fetch_now(&self, subject_id: &str, payload: Value) -> QueueResult<Value> {
        if self.inner.shutdown.is_cancelled() {
            return Err(QueueError::ShuttingDown);
        }

        let settings = &self.inner.settings;
        let limit = settings.rpm.saturating_sub(settings.immediate_reserve);
        let granted = self
            .inner
            .store
            .reserve_rate(self.inner.kind, self.inner.clock.minute_bucket(), limit, 1)
            .await?;
        if granted == 0 {
            warn!(kind = %self.inner.kind, rpm = settings.rpm, "Immediate fetch rejected by rate limit");
            return Err(QueueError::RateLimited { limit: settings.rpm });
        }

        self.attempt(subject_id, &payload).await
    }

    /// Current queue depth and budget use.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn stats(&self) -> QueueResult<PoolStats> {
        let depth = self.inner.store.depth(self.inner.kind).await?;
        let minute_count = self
            .inner
            .store
            .rate_count(self.inner.kind, self.inner.clock.minute_bucket())
            .await?;
        Ok(PoolStats {
            kind: self.inner.kind,
            waiting: depth.waiting,
            active: depth.active,
            local_in_flight: self.inner.in_flight.load(Ordering::SeqCst),
            minute_count,
            rpm: self.inner.settings.rpm,
            concurrency: self.inner.settings.concurrency,
        })
    }

    /// Stored record for `job_id`.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn get_status(&self, job_id: JobId) -> QueueResult<Option<Job>> {
        Ok(self.inner.store.get_job(job_id).await?)
    }

    /// Wait until nothing waits in the store and nothing runs locally.
    /// Returns `false` if `max_wait` elapsed first.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn wait_idle(&self, max_wait: Duration) -> QueueResult<bool> {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            let idle = self.inner.in_flight.load(Ordering::SeqCst) == 0
                && self.inner.store.depth(self.inner.kind).await?.waiting == 0;
            if idle {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::select! {
                () = self.inner.idle.notified() => {}
                () = tokio::time::sleep_until(deadline) => {}
                () = tokio::time::sleep(self.inner.settings.poll_interval()) => {}
            }
        }
    }

    /// Whether the pump task is running.
    #[must_use]
    pub fn is_pumping(&self) -> bool {
        self.inner.pumping.load(Ordering::SeqCst)
    }

    /// Stop pumping, cancel in-flight attempts and wait for their jobs to be
    /// recorded as failed.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.wake.notify_one();

        let pump = self.inner.pump.lock().take();
        if let Some(pump) = pump {
            let _ = pump.await;
        }

        let mut tasks = std::mem::take(&mut *self.inner.tasks.lock());
        while tasks.join_next().await.is_some() {}
        info!(kind = %self.inner.kind, "Worker pool shut down");
    }

    fn ensure_pumping(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        if self.inner.pumping.swap(true, Ordering::AcqRel) {
            self.inner.wake.notify_one();
            return;
        }

        let pool = self.clone();
        let handle = tokio::spawn(async move { pool.pump().await });
        *self.inner.pump.lock() = Some(handle);
    }

    async fn pump(self) {
        let inner = &self.inner;
        debug!(kind = %inner.kind, "Pump started");

        while !inner.shutdown.is_cancelled() {
            let request = ClaimRequest {
                kind: inner.kind,
                rpm: inner.settings.rpm,
                concurrency: inner.settings.concurrency,
                minute_bucket: inner.clock.minute_bucket(),
                now: inner.clock.now(),
                ttls: inner.ttls,
            };

            let outcome = match inner.store.claim(request).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(kind = %inner.kind, error = %e, "Claim failed");
                    if !inner.shutdown.sleep(inner.settings.poll_interval()).await {
                        break;
                    }
                    continue;
                }
            };

            if !outcome.jobs.is_empty() {
                debug!(
                    kind = %inner.kind,
                    claimed = outcome.jobs.len(),
                    in_flight = outcome.in_flight,
                    waiting = outcome.waiting,
                    "Claimed jobs"
                );
                for job in outcome.jobs {
                    self.spawn_job(job);
                }
                continue;
            }

            if outcome.waiting == 0 && inner.in_flight.load(Ordering::SeqCst) == 0 {
                break;
            }

            tokio::select! {
                () = tokio::time::sleep(inner.settings.poll_interval()) => {}
                () = inner.wake.notified() => {}
                () = inner.shutdown.cancelled() => break,
            }
        }

        inner.pumping.store(false, Ordering::SeqCst);
        debug!(kind = %inner.kind, "Pump stopped");

        // An enqueue that raced the exit only sent a wake-up
        if !inner.shutdown.is_cancelled() {
            match inner.store.depth(inner.kind).await {
                Ok(depth) if depth.waiting > 0 => self.ensure_pumping(),
                Ok(_) => {}
                Err(e) => error!(kind = %inner.kind, error = %e, "Depth check after pump exit failed"),
            }
        }
    }

    fn spawn_job(&self, job: Job) {
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        let pool = self.clone();
        let mut tasks = self.inner.tasks.lock();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move { pool.process(job).await });
    }

    /// Run the job's attempts in their own task so a panicking executor
    /// still ends in a recorded failure and a freed slot.
    async fn process(self, job: Job) {
        let inner = &self.inner;
        let pool = self.clone();
        let attempt_job = job.clone();
        let run = tokio::spawn(async move { pool.fetch_with_retry(&attempt_job).await });

        let (state, error, result, retries) = match run.await {
            Ok(Ok((value, retries))) => (JobState::Completed, None, Some(value), Some(retries)),
            Ok(Err((err, retries))) => (JobState::Failed, Some(err.job_error()), None, Some(retries)),
            Err(e) if e.is_panic() => {
                error!(job_id = %job.id, subject_id = %job.subject_id, "Executor panicked");
                let err = QueueError::Permanent("executor panicked".into());
                (JobState::Failed, Some(err.job_error()), None, None)
            }
            Err(_) => (JobState::Failed, Some(QueueError::ShuttingDown.job_error()), None, None),
        };

        let request = FinishRequest {
            job_id: job.id,
            kind: job.kind,
            state,
            error: error.clone(),
            result,
            retry_count: retries,
            promote_cap: None,
            now: inner.clock.now(),
            ttls: inner.ttls,
        };
        match inner.store.finish(request).await {
            Ok(outcome) if outcome.finished => match &error {
                None => info!(job_id = %job.id, subject_id = %job.subject_id, retries = ?retries, "Job completed"),
                Some(error) => warn!(job_id = %job.id, subject_id = %job.subject_id, retries = ?retries, error = %error, "Job failed"),
            },
            Ok(_) => warn!(job_id = %job.id, "Job was no longer active when it finished"),
            Err(e) => error!(job_id = %job.id, error = %e, "Recording job outcome failed"),
        }

        if inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            inner.idle.notify_waiters();
        }
        inner.wake.notify_one();
    }

    /// Run attempts until one succeeds, a failure is permanent, retries run
    /// out or the pool shuts down. Returns the retry count either way.
    async fn fetch_with_retry(&self, job: &Job) -> Result<(Value, u32), (QueueError, u32)> {
        let inner = &self.inner;
        let mut retries = 0;

        loop {
            let err = match self.attempt(&job.subject_id, &job.payload).await {
                Ok(value) => return Ok((value, retries)),
                Err(err) => err,
            };

            let retryable = matches!(err, QueueError::TransientUpstream(_) | QueueError::Timeout(_));
            if !retryable {
                return Err((err, retries));
            }
            if retries >= inner.retry.max_retries {
                let attempts = retries + 1;
                return Err((
                    QueueError::Permanent(format!("retries exhausted after {attempts} attempts: {err}")),
                    retries,
                ));
            }

            retries += 1;
            let delay = inner.retry.delay_for(retries);
            warn!(
                job_id = %job.id,
                retry = retries,
                max_retries = inner.retry.max_retries,
                delay_ms = delay.as_millis(),
                error = %err,
                "Transient failure, retrying"
            );

            if !inner.shutdown.sleep(delay).await {
                return Err((QueueError::ShuttingDown, retries));
            }
            if let Err(err) = self.reserve_retry_unit(job.id).await {
                return Err((err, retries));
            }
            if let Err(e) = inner.store.set_retry_count(job.id, retries).await {
                warn!(job_id = %job.id, error = %e, "Could not persist retry count");
            }
        }
    }

    async fn reserve_retry_unit(&self, job_id: JobId) -> QueueResult<()> {
        let inner = &self.inner;
        loop {
            let granted = inner
                .store
                .reserve_rate(inner.kind, inner.clock.minute_bucket(), inner.settings.rpm, 1)
                .await?;
            if granted == 1 {
                return Ok(());
            }
            debug!(job_id = %job_id, "Minute budget spent, retry waits");
            if !inner.shutdown.sleep(inner.settings.poll_interval()).await {
                return Err(QueueError::ShuttingDown);
            }
        }
    }

    async fn attempt(&self, subject_id: &str, payload: &Value) -> QueueResult<Value> {
        let timeout = self.inner.settings.request_timeout();
        let call = tokio::time::timeout(timeout, self.inner.executor.execute(subject_id, payload));
        match self.inner.shutdown.run_until_cancelled(call).await {
            Err(()) => Err(QueueError::ShuttingDown),
            Ok(Err(_elapsed)) => Err(QueueError::Timeout(timeout)),
            Ok(Ok(result)) => result.map_err(QueueError::from),
        }
    }
}
