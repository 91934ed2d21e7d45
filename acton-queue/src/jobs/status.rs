//! Job state tracking.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Queued behind other jobs of its kind.
    #[default]
    Waiting,
    /// Admitted and in flight.
    Active,
    /// Finished successfully.
    Completed,
    /// Finished with an error (including timeouts).
    Failed,
}

impl JobState {
    /// Check if the job is in a terminal state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Get the state name as stored.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parse a stored state name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "waiting" => Some(Self::Waiting),
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// How long a job record lives in the store, per state.
///
/// Completed records go quickly, failed ones stay for diagnosis, and
/// waiting/active records get a long safety-net TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTtls {
    /// TTL for completed records.
    pub completed: Duration,
    /// TTL for failed records.
    pub failed: Duration,
    /// TTL for waiting and active records.
    pub pending: Duration,
}

impl StateTtls {
    /// TTL that applies to a record in `state`.
    #[must_use]
    pub const fn for_state(&self, state: JobState) -> Duration {
        match state {
            JobState::Completed => self.completed,
            JobState::Failed => self.failed,
            JobState::Waiting | JobState::Active => self.pending,
        }
    }
}

impl Default for StateTtls {
    fn default() -> Self {
        Self {
            completed: Duration::from_secs(3600),
            failed: Duration::from_secs(86_400),
            pending: Duration::from_secs(604_800),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_is_terminal() {
        assert!(!JobState::Waiting.is_terminal());
        assert!(!JobState::Active.is_terminal());
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
    }

    #[test]
    fn test_state_names_round_trip() {
        for state in [
            JobState::Waiting,
            JobState::Active,
            JobState::Completed,
            JobState::Failed,
        ] {
            assert_eq!(JobState::from_name(state.name()), Some(state));
        }
        assert_eq!(JobState::from_name("running"), None);
    }

    #[test]
    fn test_failed_outlives_completed() {
        let ttls = StateTtls::default();
        assert!(ttls.for_state(JobState::Failed) > ttls.for_state(JobState::Completed));
        assert!(ttls.for_state(JobState::Active) > ttls.for_state(JobState::Failed));
    }
}
