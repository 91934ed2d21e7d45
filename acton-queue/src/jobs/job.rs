//! Job records and identifiers.

use super::JobState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    /// Create a new random job ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<JobId> for Uuid {
    fn from(id: JobId) -> Self {
        id.0
    }
}

/// Kind of external operation a job stands for.
///
/// Session lifecycle kinds go through the
/// [`AdmissionQueue`](crate::admission::AdmissionQueue); `Crawl` is drained by
/// the [`RateLimitedWorkerPool`](crate::pool::RateLimitedWorkerPool).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    /// Create a session.
    Create,
    /// Start a session.
    Start,
    /// Stop a session.
    Stop,
    /// Restart a session.
    Restart,
    /// Log a session out.
    Logout,
    /// Delete a session. Never waits behind other work.
    Delete,
    /// Fetch a web page through the crawl provider.
    Crawl,
}

impl JobKind {
    /// Every kind, in a stable order.
    pub const ALL: [Self; 7] = [
        Self::Create,
        Self::Start,
        Self::Stop,
        Self::Restart,
        Self::Logout,
        Self::Delete,
        Self::Crawl,
    ];

    /// Kinds handled by the admission queue.
    pub const SESSION: [Self; 6] = [
        Self::Create,
        Self::Start,
        Self::Stop,
        Self::Restart,
        Self::Logout,
        Self::Delete,
    ];

    /// Stable lowercase name, used in store keys and config.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Logout => "logout",
            Self::Delete => "delete",
            Self::Crawl => "crawl",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown job kind: {s}"))
    }
}

/// A job record as held in the shared store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job identifier.
    pub id: JobId,
    /// Operation kind.
    pub kind: JobKind,
    /// Entity the operation acts on (session id, URL, ...).
    pub subject_id: String,
    /// Lifecycle state.
    pub state: JobState,
    /// When the job was submitted.
    pub created_at: DateTime<Utc>,
    /// When the job was last admitted to active.
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
    /// Opaque payload handed to the executor.
    pub payload: serde_json::Value,
    /// Number of retries performed so far.
    pub retry_count: u32,
    /// Captured error for failed jobs.
    pub error: Option<String>,
    /// Captured upstream result for completed jobs.
    pub result: Option<serde_json::Value>,
}

impl Job {
    /// Build a fresh, not yet stored job.
    #[must_use]
    pub fn new(kind: JobKind, subject_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: JobId::new(),
            kind,
            subject_id: subject_id.into(),
            state: JobState::Waiting,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            payload,
            retry_count: 0,
            error: None,
            result: None,
        }
    }
}
