//! acton-queue: concurrency control for bursty external-API work on a shared Redis store
//!
//! Three mechanisms, all coordinated through atomic store transactions so
//! they hold across any number of service instances:
//! - **[`AdmissionQueue`](admission::AdmissionQueue)**: per-kind bounded FIFO
//!   with timeout-driven failure and promotion of waiting jobs
//! - **[`RateLimitedWorkerPool`](pool::RateLimitedWorkerPool)**: drains a
//!   shared queue under a requests-per-minute ceiling and a concurrency
//!   ceiling, with retry and backoff
//! - **[`ConversationBatcher`](batcher::ConversationBatcher)**: debounces
//!   per-conversation messages into one downstream call at a time
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use acton_queue::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = QueueConfig::load_for_service("acton-queue")?;
//!     acton_queue::observability::init(&config.observability)?;
//!
//!     let store = Arc::new(RedisStore::from_settings(&config.store)?);
//!     let queue = AdmissionQueue::new(store, config.admission.clone());
//!
//!     let job = queue.enqueue("session-42", JobKind::Start, json!({})).await?;
//!     // ... call the upstream API, then:
//!     queue.complete(job.id, None).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Features
//!
//! - `redis` - [`RedisStore`](store::RedisStore) backend (default)

#![allow(clippy::missing_errors_doc)] // store errors are documented once, on the trait

pub mod admission;
pub mod batcher;
pub mod clock;
pub mod config;
pub mod error;
pub mod executor;
pub mod http;
pub mod jobs;
pub mod observability;
pub mod pool;
pub mod store;

#[cfg(test)]
pub mod testing;

pub mod prelude {
    //! Convenience re-exports for common types and traits
    //!
    //! ```rust
    //! use acton_queue::prelude::*;
    //! ```

    pub use crate::admission::{AdmissionQueue, Finished, QueuePosition, QueueStats};
    pub use crate::batcher::{
        Batch, BatchHandler, BufferedMessage, ConversationBatcher, DrainDecision, ExecutorBatchHandler,
    };
    pub use crate::config::{
        AdmissionSettings, BatcherSettings, HttpSettings, ObservabilitySettings, PoolSettings, QueueConfig,
        StoreSettings,
    };
    pub use crate::error::{QueueError, QueueResult, StoreError, UpstreamError};
    pub use crate::executor::{Executor, FnExecutor, SharedExecutor};
    pub use crate::http::HttpExecutor;
    pub use crate::jobs::{Job, JobId, JobKind, JobState, StateTtls};
    pub use crate::pool::{PoolStats, RateLimitedWorkerPool, RetryPolicy};
    #[cfg(feature = "redis")]
    pub use crate::store::RedisStore;
    pub use crate::store::{JobStore, MemoryStore, SharedStore, StoreKeys};

    pub use serde_json::json;
}
