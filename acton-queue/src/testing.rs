//! Test doubles shared by the unit tests.

use crate::error::UpstreamError;
use crate::executor::Executor;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

type Responder = dyn Fn(usize) -> Result<Value, UpstreamError> + Send + Sync;

/// One recorded executor call.
#[derive(Debug, Clone)]
pub struct Call {
    /// Subject the call was made for.
    pub subject_id: String,
    /// Payload it carried.
    pub payload: Value,
    /// When it started.
    pub at: Instant,
}

/// Executor that sleeps, answers from a closure and records every call.
#[derive(Clone)]
pub struct RecordingExecutor {
    delay: Duration,
    respond: Arc<Responder>,
    calls: Arc<Mutex<Vec<Call>>>,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl std::fmt::Debug for RecordingExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingExecutor")
            .field("calls", &self.calls.lock().len())
            .finish_non_exhaustive()
    }
}

impl RecordingExecutor {
    /// Always succeeds after `delay`.
    pub fn ok(delay: Duration) -> Self {
        Self::responding(delay, |n| Ok(json!({ "call": n })))
    }

    /// Answers call `n` (0-based) with `respond(n)` after `delay`.
    pub fn responding<F>(delay: Duration, respond: F) -> Self
    where
        F: Fn(usize) -> Result<Value, UpstreamError> + Send + Sync + 'static,
    {
        Self {
            delay,
            respond: Arc::new(respond),
            calls: Arc::new(Mutex::new(Vec::new())),
            running: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Every call so far, in order.
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    /// Number of calls so far.
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Highest number of overlapping calls seen.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Executor for RecordingExecutor {
    async fn execute(&self, subject_id: &str, payload: &Value) -> Result<Value, UpstreamError> {
        let n = {
            let mut calls = self.calls.lock();
            calls.push(Call {
                subject_id: subject_id.to_string(),
                payload: payload.clone(),
                at: Instant::now(),
            });
            calls.len() - 1
        };

        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.running.fetch_sub(1, Ordering::SeqCst);

        (self.respond)(n)
    }
}
