//! Admission-controlled FIFO queues for session operations.
//!
//! Each [`JobKind`] gets its own bounded queue: at most `cap` jobs are active,
//! the rest wait in submission order. Admission, completion and promotion of
//! the next waiting job are single atomic store steps, so the cap holds for
//! every process sharing the store.
//!
//! An admitted job that is neither completed nor failed within the timeout
//! window is force-failed by its timeout sweep, which frees the slot for the
//! next waiting job exactly like [`AdmissionQueue::fail`]. Sweeps are armed in
//! the process that admitted the job; [`AdmissionQueue::reap_stale`] covers
//! jobs whose sweep was lost with a crashed process.
//!
//! # Example
//!
//! ```rust
//! use acton_queue::admission::AdmissionQueue;
//! use acton_queue::config::AdmissionSettings;
//! use acton_queue::jobs::{JobKind, JobState};
//! use acton_queue::store::MemoryStore;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> acton_queue::error::QueueResult<()> {
//! let queue = AdmissionQueue::new(Arc::new(MemoryStore::new()), AdmissionSettings::default());
//!
//! let job = queue.submit(JobKind::Start, "session-1", json!({})).await?;
//! assert_eq!(job.state, JobState::Active);
//!
//! // ... call the session API ...
//! queue.complete(job.id, Some(json!({"status": "WORKING"}))).await?;
//! # queue.shutdown();
//! # Ok(())
//! # }
//! ```

use crate::clock::{self, SharedClock};
use crate::config::AdmissionSettings;
use crate::error::{QueueError, QueueResult};
use crate::executor::Executor;
use crate::jobs::{CancellationToken, Job, JobId, JobKind, JobState, Ticker, TimerRegistry};
use crate::store::{FinishOutcome, FinishRequest, QueueList, SharedStore};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const ADMISSION_POLL: Duration = Duration::from_millis(250);

/// Waiting job and its 0-based place in line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueuePosition {
    /// Waiting job.
    pub job_id: JobId,
    /// Its kind.
    pub kind: JobKind,
    /// Jobs ahead of it.
    pub position: usize,
}

/// Queue snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Jobs waiting for a slot.
    pub waiting_count: usize,
    /// Jobs holding a slot.
    pub active_count: usize,
    /// Every waiting job, in line order per kind.
    pub positions: Vec<QueuePosition>,
}

/// Result of a completion or failure that changed state.
#[derive(Debug, Clone, PartialEq)]
pub struct Finished {
    /// The job that finished.
    pub job_id: JobId,
    /// Its terminal state.
    pub state: JobState,
    /// Waiting job that took the freed slot.
    pub promoted: Option<Job>,
}

/// Per-kind bounded-concurrency FIFO queue.
#[derive(Debug, Clone)]
pub struct AdmissionQueue {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    store: SharedStore,
    settings: AdmissionSettings,
    clock: SharedClock,
    timers: TimerRegistry,
    shutdown: CancellationToken,
}

impl AdmissionQueue {
    /// Create a queue on `store` using the system clock.
    #[must_use]
    pub fn new(store: SharedStore, settings: AdmissionSettings) -> Self {
        Self::with_clock(store, settings, clock::system())
    }

    /// Create a queue with an explicit clock.
    #[must_use]
    pub fn with_clock(store: SharedStore, settings: AdmissionSettings, clock: SharedClock) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                settings,
                clock,
                timers: TimerRegistry::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Settings in use.
    #[must_use]
    pub fn settings(&self) -> &AdmissionSettings {
        &self.inner.settings
    }

    /// Submit a job: admitted at once if its kind has room and nobody is
    /// waiting, otherwise appended to the waiting list.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ShuttingDown`] after [`Self::shutdown`], or a
    /// store error.
    pub async fn enqueue(&self, subject_id: &str, kind: JobKind, payload: Value) -> QueueResult<Job> {
        if self.inner.shutdown.is_cancelled() {
            return Err(QueueError::ShuttingDown);
        }

        let now = self.inner.clock.now();
        let mut job = Job::new(kind, subject_id, payload);
        job.created_at = now;

        let cap = self.inner.settings.cap_for(kind);
        let admission = self
            .inner
            .store
            .admit(job, cap, now, self.inner.settings.ttls())
            .await?;

        match admission.position {
            None => {
                info!(job_id = %admission.job.id, kind = %kind, subject_id, "Job admitted");
                self.arm_timeout(admission.job.id);
            }
            Some(position) => {
                info!(job_id = %admission.job.id, kind = %kind, subject_id, position, "Job queued");
            }
        }
        Ok(admission.job)
    }

    /// [`Self::enqueue`] with the caller-facing argument order.
    ///
    /// # Errors
    ///
    /// See [`Self::enqueue`].
    pub async fn submit(&self, kind: JobKind, subject_id: &str, payload: Value) -> QueueResult<Job> {
        self.enqueue(subject_id, kind, payload).await
    }

    /// Mark an active job completed and promote the next waiting job.
    ///
    /// Returns `None` if the job was no longer active, e.g. because its
    /// timeout already failed it.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::NotFound`] for an unknown job, or a store error.
    pub async fn complete(&self, job_id: JobId, result: Option<Value>) -> QueueResult<Option<Finished>> {
        self.finish(job_id, JobState::Completed, None, result).await
    }

    /// Mark an active job failed and promote the next waiting job.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::NotFound`] for an unknown job, or a store error.
    pub async fn fail(&self, job_id: JobId, error: impl Into<String> + Send) -> QueueResult<Option<Finished>> {
        self.finish(job_id, JobState::Failed, Some(error.into()), None).await
    }

    /// Force-fail `job_id` if it is still active. Runs when a job's timeout
    /// window elapses.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn timeout_sweep(&self, job_id: JobId) -> QueueResult<Option<Finished>> {
        let Some(job) = self.inner.store.get_job(job_id).await? else {
            return Ok(None);
        };
        if job.state != JobState::Active {
            return Ok(None);
        }

        let timeout = self.inner.settings.timeout();
        warn!(job_id = %job_id, kind = %job.kind, subject_id = %job.subject_id, timeout_secs = timeout.as_secs(), "Job timed out");
        self.finish_known(&job, JobState::Failed, Some(QueueError::Timeout(timeout).job_error()), None)
            .await
    }

    /// First active job on `subject_id`, across session kinds or within `kind`.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn find_active_by_subject(&self, subject_id: &str, kind: Option<JobKind>) -> QueueResult<Option<Job>> {
        for kind in kinds(kind) {
            for id in self.inner.store.list_ids(kind, QueueList::Active).await? {
                if let Some(job) = self.inner.store.get_job(id).await? {
                    if job.subject_id == subject_id {
                        return Ok(Some(job));
                    }
                }
            }
        }
        Ok(None)
    }

    /// Waiting/active counts and waiting positions, for one kind or all
    /// session kinds.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn stats(&self, kind: Option<JobKind>) -> QueueResult<QueueStats> {
        let mut stats = QueueStats::default();
        for kind in kinds(kind) {
            let waiting = self.inner.store.list_ids(kind, QueueList::Waiting).await?;
            stats.active_count += self.inner.store.depth(kind).await?.active;
            stats.waiting_count += waiting.len();
            stats.positions.extend(
                waiting
                    .into_iter()
                    .enumerate()
                    .map(|(position, job_id)| QueuePosition { job_id, kind, position }),
            );
        }
        Ok(stats)
    }

    /// Alias of [`Self::stats`].
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn get_stats(&self, kind: Option<JobKind>) -> QueueResult<QueueStats> {
        self.stats(kind).await
    }

    /// Stored record for `job_id`.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn get_status(&self, job_id: JobId) -> QueueResult<Option<Job>> {
        Ok(self.inner.store.get_job(job_id).await?)
    }

    /// Delete completed/failed records older than the retention window.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn purge_expired(&self) -> QueueResult<usize> {
        let retention = chrono::TimeDelta::from_std(self.inner.settings.retention())
            .map_err(|e| QueueError::Config(e.to_string()))?;
        let cutoff = self.inner.clock.now() - retention;
        let purged = self.inner.store.purge_finished(cutoff).await?;
        if purged > 0 {
            info!(purged, "Purged finished jobs");
        }
        Ok(purged)
    }

    /// Force-fail active jobs that outlived the timeout window by their
    /// stored `started_at`, promoting successors. Returns how many were
    /// failed.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn reap_stale(&self) -> QueueResult<usize> {
        let timeout = self.inner.settings.timeout();
        let window = chrono::TimeDelta::from_std(timeout).map_err(|e| QueueError::Config(e.to_string()))?;
        let deadline = self.inner.clock.now() - window;
        let mut reaped = 0;

        for kind in JobKind::SESSION {
            for id in self.inner.store.list_ids(kind, QueueList::Active).await? {
                let job = self.inner.store.get_job(id).await?;
                let stale = job
                    .as_ref()
                    .is_none_or(|job| job.started_at.is_none_or(|started| started <= deadline));
                if !stale {
                    continue;
                }

                let error = QueueError::Timeout(timeout).job_error();
                let finished = match job {
                    Some(job) => self.finish_known(&job, JobState::Failed, Some(error), None).await?,
                    None => {
                        // Record expired while its id stayed listed
                        let request = self.finish_request(id, kind, JobState::Failed, Some(error), None);
                        let outcome = self.inner.store.finish(request).await?;
                        self.after_finish(id, JobState::Failed, outcome)
                    }
                };
                if finished.is_some() {
                    warn!(job_id = %id, kind = %kind, "Reaped stale active job");
                    reaped += 1;
                }
            }
        }
        Ok(reaped)
    }

    /// Reap stale jobs now, then purge and reap on every cleanup interval
    /// until the returned ticker is stopped or the queue shuts down.
    ///
    /// # Errors
    ///
    /// Returns a store error from the initial reap.
    pub async fn start_maintenance(&self) -> QueueResult<Ticker> {
        let reaped = self.reap_stale().await?;
        if reaped > 0 {
            info!(reaped, "Reaped jobs left active by a previous run");
        }

        let queue = self.clone();
        Ok(Ticker::spawn(
            "admission-maintenance",
            self.inner.settings.cleanup_interval(),
            &self.inner.shutdown,
            move || {
                let queue = queue.clone();
                async move { queue.maintenance_pass().await }
            },
        ))
    }

    async fn maintenance_pass(&self) {
        if let Err(e) = self.purge_expired().await {
            error!(error = %e, "Purging finished jobs failed");
        }
        if let Err(e) = self.reap_stale().await {
            error!(error = %e, "Reaping stale jobs failed");
        }
    }

    /// Submit, wait for admission, run `executor`, then complete or fail.
    /// Returns the final record.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ShuttingDown`] if the queue shuts down while the
    /// job waits, or a store error. Executor failures are recorded on the job,
    /// not returned.
    pub async fn run(
        &self,
        kind: JobKind,
        subject_id: &str,
        payload: Value,
        executor: &dyn Executor,
    ) -> QueueResult<Job> {
        let mut job = self.submit(kind, subject_id, payload).await?;
        let id = job.id;

        while job.state == JobState::Waiting {
            if !self.inner.shutdown.sleep(ADMISSION_POLL).await {
                return Err(QueueError::ShuttingDown);
            }
            job = self.get_status(id).await?.ok_or(QueueError::NotFound(id))?;
        }
        if job.state != JobState::Active {
            return Ok(job);
        }

        match executor.execute(&job.subject_id, &job.payload).await {
            Ok(result) => {
                self.complete(id, Some(result)).await?;
            }
            Err(e) => {
                let error = QueueError::from(e);
                debug!(job_id = %id, error = %error, "Executor failed");
                self.fail(id, error.job_error()).await?;
            }
        }
        self.get_status(id).await?.ok_or(QueueError::NotFound(id))
    }

    /// Stop maintenance and abort every armed timeout. Jobs stay in the store.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.timers.abort_all();
        info!("Admission queue shut down");
    }

    async fn finish(
        &self,
        job_id: JobId,
        state: JobState,
        error: Option<String>,
        result: Option<Value>,
    ) -> QueueResult<Option<Finished>> {
        let job = self
            .inner
            .store
            .get_job(job_id)
            .await?
            .ok_or(QueueError::NotFound(job_id))?;
        self.finish_known(&job, state, error, result).await
    }

    async fn finish_known(
        &self,
        job: &Job,
        state: JobState,
        error: Option<String>,
        result: Option<Value>,
    ) -> QueueResult<Option<Finished>> {
        let request = self.finish_request(job.id, job.kind, state, error, result);
        let outcome = self.inner.store.finish(request).await?;
        Ok(self.after_finish(job.id, state, outcome))
    }

    fn finish_request(
        &self,
        job_id: JobId,
        kind: JobKind,
        state: JobState,
        error: Option<String>,
        result: Option<Value>,
    ) -> FinishRequest {
        FinishRequest {
            job_id,
            kind,
            state,
            error,
            result,
            retry_count: None,
            promote_cap: self.inner.settings.cap_for(kind),
            now: self.inner.clock.now(),
            ttls: self.inner.settings.ttls(),
        }
    }

    fn after_finish(&self, job_id: JobId, state: JobState, outcome: FinishOutcome) -> Option<Finished> {
        self.inner.timers.disarm(&job_id);
        if !outcome.finished {
            debug!(job_id = %job_id, "Job was not active, nothing to finish");
            return None;
        }

        info!(job_id = %job_id, state = %state, "Job finished");
        if let Some(promoted) = &outcome.promoted {
            info!(job_id = %promoted.id, kind = %promoted.kind, subject_id = %promoted.subject_id, "Promoted waiting job");
            self.arm_timeout(promoted.id);
        }
        Some(Finished {
            job_id,
            state,
            promoted: outcome.promoted,
        })
    }

    fn arm_timeout(&self, job_id: JobId) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        let queue = self.clone();
        self.inner.timers.arm(job_id, self.inner.settings.timeout(), async move {
            if let Err(e) = queue.timeout_sweep(job_id).await {
                error!(job_id = %job_id, error = %e, "Timeout sweep failed");
            }
        });
    }
}

fn kinds(kind: Option<JobKind>) -> Vec<JobKind> {
    kind.map_or_else(|| JobKind::SESSION.to_vec(), |kind| vec![kind])
}

#[cfg(test)]
mod tests;
