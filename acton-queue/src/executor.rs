//! The downstream seam.
//!
//! Everything outside the queueing layer (session API calls, crawl
//! provider, chat consumer) is an [`Executor`]. The queue decides when it
//! runs; the executor decides what it does.

use crate::error::UpstreamError;
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

/// Runs one job against an external system.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Executor: Send + Sync {
    /// Execute a job for `subject_id` with its opaque `payload`.
    ///
    /// # Errors
    ///
    /// Returns an [`UpstreamError`]; [`UpstreamError::is_retryable`] decides
    /// whether the worker pool tries again.
    async fn execute(&self, subject_id: &str, payload: &Value) -> Result<Value, UpstreamError>;
}

/// Shared executor handle.
pub type SharedExecutor = Arc<dyn Executor>;

/// Adapts an async closure into an [`Executor`].
///
/// ```rust
/// use acton_queue::executor::{Executor, FnExecutor};
/// use serde_json::json;
///
/// # #[tokio::main]
/// # async fn main() {
/// let echo = FnExecutor::new(|subject: String, _payload: serde_json::Value| async move {
///     Ok::<_, acton_queue::error::UpstreamError>(json!({ "subject": subject }))
/// });
/// let out = echo.execute("session-1", &json!(null)).await.unwrap();
/// assert_eq!(out["subject"], "session-1");
/// # }
/// ```
pub struct FnExecutor<F> {
    f: F,
}

impl<F> FnExecutor<F> {
    /// Wrap `f`.
    pub const fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> std::fmt::Debug for FnExecutor<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnExecutor").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F, Fut> Executor for FnExecutor<F>
where
    F: Fn(String, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, UpstreamError>> + Send + 'static,
{
    async fn execute(&self, subject_id: &str, payload: &Value) -> Result<Value, UpstreamError> {
        (self.f)(subject_id.to_string(), payload.clone()).await
    }
}
