//! Shared-store access for jobs, queues, rate counters and conversation buffers.
//!
//! [`JobStore`] is the only seam between the queueing logic and the shared
//! store. Each method that protects a cross-step invariant (admit-if-room,
//! promote-next, claim-within-budget, drain-if-idle) is a single atomic
//! transaction in every backend:
//!
//! - [`RedisStore`] runs those steps as Lua scripts on the server, so the
//!   invariants hold across any number of service instances.
//! - [`MemoryStore`] runs them under one lock, for single-process use and tests.
//!
//! Callers never read-then-write across two calls to make a decision.

mod keys;
mod memory;
#[cfg(feature = "redis")]
mod record;
#[cfg(feature = "redis")]
mod redis;

pub use keys::StoreKeys;
pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

use crate::batcher::BufferedMessage;
use crate::error::StoreResult;
use crate::jobs::{Job, JobId, JobKind, JobState, StateTtls};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Lifetime of a minute rate bucket.
pub const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Shared store handle.
pub type SharedStore = Arc<dyn JobStore>;

/// Which per-kind list to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueList {
    /// Jobs waiting for a slot, oldest first.
    Waiting,
    /// Jobs holding a slot, in admission order.
    Active,
}

/// Result of an atomic admit.
#[derive(Debug, Clone, PartialEq)]
pub struct Admission {
    /// The stored job, `Active` or `Waiting`.
    pub job: Job,
    /// 0-based position in the waiting list, when parked.
    pub position: Option<usize>,
}

/// Terminal transition for an active job.
#[derive(Debug, Clone)]
pub struct FinishRequest {
    /// Job to finish.
    pub job_id: JobId,
    /// Its kind (selects the queue lists).
    pub kind: JobKind,
    /// `Completed` or `Failed`.
    pub state: JobState,
    /// Captured error for failures.
    pub error: Option<String>,
    /// Captured upstream result for completions.
    pub result: Option<serde_json::Value>,
    /// Final retry count, if it changed.
    pub retry_count: Option<u32>,
    /// Promote the head of waiting if active stays below this cap.
    /// `None` disables promotion.
    pub promote_cap: Option<usize>,
    /// Transition time.
    pub now: DateTime<Utc>,
    /// Record TTLs.
    pub ttls: StateTtls,
}

/// Result of an atomic finish.
#[derive(Debug, Clone, PartialEq)]
pub struct FinishOutcome {
    /// Whether the job was active and is now terminal.
    pub finished: bool,
    /// The waiting job promoted into the freed slot.
    pub promoted: Option<Job>,
}

/// Budgeted claim of waiting jobs.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    /// Queue to claim from.
    pub kind: JobKind,
    /// Requests-per-minute ceiling.
    pub rpm: u32,
    /// Maximum jobs in flight.
    pub concurrency: usize,
    /// Current minute bucket.
    pub minute_bucket: i64,
    /// Claim time, stored as `started_at`.
    pub now: DateTime<Utc>,
    /// Record TTLs.
    pub ttls: StateTtls,
}

/// Result of an atomic claim.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ClaimOutcome {
    /// Jobs moved to active, in FIFO order.
    pub jobs: Vec<Job>,
    /// Active jobs after the claim, claimed ones included.
    pub in_flight: usize,
    /// Jobs still waiting after the claim.
    pub waiting: usize,
}

/// Waiting and active counts for a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueDepth {
    /// Length of the waiting list.
    pub waiting: usize,
    /// Length of the active list.
    pub active: usize,
}

/// Result of an atomic drain attempt on a conversation buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum DrainOutcome {
    /// Nothing buffered.
    Empty,
    /// The buffer length changed since it was sampled.
    StillGrowing {
        /// Length the caller sampled.
        expected: usize,
        /// Length found now.
        actual: usize,
    },
    /// Another run holds the busy flag.
    Busy,
    /// Busy flag set and buffer emptied; these are the drained messages.
    Drained(Vec<BufferedMessage>),
}

/// Typed, atomic access to the shared store.
#[async_trait]
pub trait JobStore: std::fmt::Debug + Send + Sync + 'static {
    /// Read a job record.
    async fn get_job(&self, id: JobId) -> StoreResult<Option<Job>>;

    /// Admit `job` as active if fewer than `cap` jobs of its kind are active
    /// and nobody is waiting; otherwise append it to waiting. `cap = None`
    /// always admits. Admitted jobs get `started_at = now`.
    async fn admit(
        &self,
        job: Job,
        cap: Option<usize>,
        now: DateTime<Utc>,
        ttls: StateTtls,
    ) -> StoreResult<Admission>;

    /// Append `job` to its kind's waiting list unconditionally. Returns the
    /// new waiting length.
    async fn push_waiting(&self, job: Job, ttls: StateTtls) -> StoreResult<usize>;

    /// Move an active job to a terminal state, optionally promoting the head
    /// of waiting into the freed slot, all in one step.
    async fn finish(&self, request: FinishRequest) -> StoreResult<FinishOutcome>;

    /// Claim up to `min(rpm - used, concurrency - in_flight)` waiting jobs,
    /// mark them active and charge them to the minute bucket, in one step.
    async fn claim(&self, request: ClaimRequest) -> StoreResult<ClaimOutcome>;

    /// Persist a job's retry count.
    async fn set_retry_count(&self, id: JobId, retry_count: u32) -> StoreResult<()>;

    /// Ids in a kind's waiting or active list, in list order.
    async fn list_ids(&self, kind: JobKind, list: QueueList) -> StoreResult<Vec<JobId>>;

    /// Waiting and active counts for a kind.
    async fn depth(&self, kind: JobKind) -> StoreResult<QueueDepth>;

    /// Grant up to `want` units of the minute budget without exceeding
    /// `limit`. Returns the number granted.
    async fn reserve_rate(
        &self,
        kind: JobKind,
        minute_bucket: i64,
        limit: u32,
        want: u32,
    ) -> StoreResult<u32>;

    /// Units spent in a minute bucket.
    async fn rate_count(&self, kind: JobKind, minute_bucket: i64) -> StoreResult<u32>;

    /// Delete completed/failed records that finished before `cutoff`.
    async fn purge_finished(&self, cutoff: DateTime<Utc>) -> StoreResult<usize>;

    /// Append a message to a conversation buffer and refresh its TTL.
    /// Returns the new buffer length.
    async fn buffer_push(
        &self,
        conversation: &str,
        message: &BufferedMessage,
        ttl: Duration,
    ) -> StoreResult<usize>;

    /// Current buffer length.
    async fn buffer_len(&self, conversation: &str) -> StoreResult<usize>;

    /// If the buffer still has `expected_len` messages and the conversation
    /// is idle, set the busy flag to `token` (with `busy_ttl`) and drain the
    /// buffer.
    async fn begin_drain(
        &self,
        conversation: &str,
        expected_len: usize,
        token: &str,
        busy_ttl: Duration,
    ) -> StoreResult<DrainOutcome>;

    /// Push the busy flag's expiry out to `busy_ttl` from now, if `token`
    /// still holds it. Returns whether it did.
    async fn extend_busy(&self, conversation: &str, token: &str, busy_ttl: Duration) -> StoreResult<bool>;

    /// Clear the busy flag if `token` holds it. Returns whether it did.
    async fn release(&self, conversation: &str, token: &str) -> StoreResult<bool>;

    /// Whether the busy flag is set.
    async fn is_busy(&self, conversation: &str) -> StoreResult<bool>;

    /// Conversations that currently have a buffer.
    async fn buffered_conversations(&self) -> StoreResult<Vec<String>>;
}
