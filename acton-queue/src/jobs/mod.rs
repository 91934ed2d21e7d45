//! Job records and the task-ownership primitives shared by every component.
//!
//! A [`Job`] is the unit all three mechanisms move through the store:
//!
//! - the [`AdmissionQueue`](crate::admission::AdmissionQueue) admits or parks it,
//! - the [`RateLimitedWorkerPool`](crate::pool::RateLimitedWorkerPool) claims and fetches it,
//! - its [`JobState`] and TTL follow it through both.
//!
//! Records only become bytes at the store boundary (see [`crate::store`]).

mod cancellation;
mod job;
mod status;

pub use cancellation::{CancellationToken, Ticker, TimerRegistry};
pub use job::{Job, JobId, JobKind};
pub use status::{JobState, StateTtls};
