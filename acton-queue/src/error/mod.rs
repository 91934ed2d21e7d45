//! Error types and error handling
//!
//! Errors fall into four families:
//!
//! - [`UpstreamError`]: what an [`Executor`](crate::executor::Executor) reports.
//!   [`UpstreamError::is_retryable`] splits it into transient and permanent failures.
//! - [`QueueError::Timeout`]: an admission timeout or a fetch timeout.
//! - [`StoreError`]: the shared store failed. Multi-step updates are atomic
//!   scripts, so a store error never leaves a queue half-updated.
//! - Everything else in [`QueueError`]: caller mistakes and lifecycle states.

use crate::jobs::JobId;
use std::time::Duration;
use thiserror::Error;

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Result type for raw store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by the queueing layer.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Upstream failed in a way that may succeed on retry.
    #[error("transient upstream failure: {0}")]
    TransientUpstream(#[source] UpstreamError),

    /// Upstream failed permanently, or retries were exhausted.
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// An operation ran past its deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The shared store failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Serialization error at the store boundary.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Job not found.
    #[error("job not found: {0}")]
    NotFound(JobId),

    /// The per-minute request budget is spent.
    #[error("rate limit reached: {limit} requests per minute")]
    RateLimited {
        /// Configured requests-per-minute ceiling.
        limit: u32,
    },

    /// The component is shutting down and no longer accepts work.
    #[error("shutting down")]
    ShuttingDown,

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl QueueError {
    /// Captured error string stored on a failed job.
    #[must_use]
    pub fn job_error(&self) -> String {
        self.to_string()
    }
}

impl From<UpstreamError> for QueueError {
    fn from(err: UpstreamError) -> Self {
        if err.is_retryable() {
            Self::TransientUpstream(err)
        } else {
            Self::Permanent(err.to_string())
        }
    }
}

/// Errors reported by downstream collaborators.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UpstreamError {
    /// Upstream answered with a non-success HTTP status.
    #[error("upstream returned HTTP {status}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body or reason.
        message: String,
    },

    /// Upstream answered, but the body could not be parsed.
    #[error("invalid upstream response: {0}")]
    InvalidResponse(String),

    /// A single attempt exceeded its timeout.
    #[error("upstream call timed out after {0:?}")]
    Timeout(Duration),

    /// Upstream rejected the request (validation, auth, ...).
    #[error("upstream rejected request: {0}")]
    Rejected(String),
}

impl UpstreamError {
    /// HTTP statuses worth retrying.
    pub const RETRYABLE_STATUSES: [u16; 6] = [429, 500, 502, 503, 408, 402];

    /// Whether a retry may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Status { status, .. } => Self::RETRYABLE_STATUSES.contains(status),
            Self::InvalidResponse(_) | Self::Timeout(_) => true,
            Self::Rejected(_) => false,
        }
    }
}

/// Errors from the shared store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Redis command or script failed.
    #[cfg(feature = "redis")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Could not check out a pooled connection.
    #[error("connection pool error: {0}")]
    Pool(String),

    /// A stored record could not be decoded.
    #[error("corrupt record {key}: {reason}")]
    Corrupt {
        /// Store key of the record.
        key: String,
        /// What was wrong with it.
        reason: String,
    },
}

#[cfg(feature = "redis")]
impl From<deadpool_redis::PoolError> for StoreError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        Self::Pool(err.to_string())
    }
}
