//! Store key layout.
//!
//! ```text
//! {prefix}:job:{id}                 hash, one job record
//! {prefix}:queue:{kind}:waiting     list of job ids, FIFO
//! {prefix}:queue:{kind}:active      list of job ids
//! {prefix}:rate:{kind}:{minute}     counter, expires 60s after first use
//! {prefix}:conv:{key}:buffer        list of JSON messages
//! {prefix}:conv:{key}:busy          busy flag with safety TTL
//! ```

use crate::jobs::{JobId, JobKind};

/// Builds every key under one prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreKeys {
    prefix: String,
}

impl StoreKeys {
    /// Create a key builder for `prefix` (trailing `:` is trimmed).
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self {
            prefix: prefix.trim_end_matches(':').to_string(),
        }
    }

    /// Key prefix without trailing separator.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Job record key.
    #[must_use]
    pub fn job(&self, id: JobId) -> String {
        format!("{}{id}", self.job_prefix())
    }

    /// Prefix every job record key starts with. Scripts append ids to it.
    #[must_use]
    pub fn job_prefix(&self) -> String {
        format!("{}:job:", self.prefix)
    }

    /// Pattern matching every job record.
    #[must_use]
    pub fn job_pattern(&self) -> String {
        format!("{}:job:*", self.prefix)
    }

    /// Waiting list for a kind.
    #[must_use]
    pub fn waiting(&self, kind: JobKind) -> String {
        format!("{}:queue:{kind}:waiting", self.prefix)
    }

    /// Active list for a kind.
    #[must_use]
    pub fn active(&self, kind: JobKind) -> String {
        format!("{}:queue:{kind}:active", self.prefix)
    }

    /// Per-minute dispatch counter.
    #[must_use]
    pub fn rate(&self, kind: JobKind, minute_bucket: i64) -> String {
        format!("{}:rate:{kind}:{minute_bucket}", self.prefix)
    }

    /// Pending message buffer for a conversation.
    #[must_use]
    pub fn buffer(&self, conversation: &str) -> String {
        format!("{}:conv:{conversation}:buffer", self.prefix)
    }

    /// Busy flag for a conversation.
    #[must_use]
    pub fn busy(&self, conversation: &str) -> String {
        format!("{}:conv:{conversation}:busy", self.prefix)
    }

    /// Pattern matching every conversation buffer.
    #[must_use]
    pub fn buffer_pattern(&self) -> String {
        format!("{}:conv:*:buffer", self.prefix)
    }

    /// Recover the conversation key from a buffer key.
    #[must_use]
    pub fn conversation_from_buffer<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.prefix.as_str())?
            .strip_prefix(":conv:")?
            .strip_suffix(":buffer")
    }
}

impl Default for StoreKeys {
    fn default() -> Self {
        Self::new("acton:queue")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_keys() {
        let keys = StoreKeys::new("app:");
        assert_eq!(keys.waiting(JobKind::Start), "app:queue:start:waiting");
        assert_eq!(keys.active(JobKind::Crawl), "app:queue:crawl:active");
        assert_eq!(keys.rate(JobKind::Crawl, 29_000_000), "app:rate:crawl:29000000");
    }

    #[test]
    fn test_job_key_uses_job_prefix() {
        let keys = StoreKeys::default();
        let id = JobId::new();
        assert_eq!(keys.job(id), format!("{}{id}", keys.job_prefix()));
        assert!(keys.job(id).starts_with("acton:queue:job:"));
    }

    #[test]
    fn test_conversation_from_buffer() {
        let keys = StoreKeys::default();
        let key = keys.buffer("5511999999999@c.us");
        assert_eq!(keys.conversation_from_buffer(&key), Some("5511999999999@c.us"));
        assert_eq!(keys.conversation_from_buffer("other:conv:x:buffer"), None);
        assert_eq!(keys.conversation_from_buffer(&keys.busy("x")), None);
    }
}
