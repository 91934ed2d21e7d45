//! In-process [`JobStore`].
//!
//! All state sits behind one lock, so each trait method is atomic exactly
//! like its Redis script. Expiry is measured on `tokio::time::Instant` and
//! applied lazily on access, which lets paused-time tests drive TTLs.

use super::{
    Admission, ClaimOutcome, ClaimRequest, DrainOutcome, FinishOutcome, FinishRequest, JobStore,
    QueueDepth, QueueList, RATE_WINDOW,
};
use crate::batcher::BufferedMessage;
use crate::error::StoreResult;
use crate::jobs::{Job, JobId, JobKind, JobState, StateTtls};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug)]
struct Expiring<T> {
    value: T,
    expires_at: Instant,
}

impl<T> Expiring<T> {
    fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<JobId, Expiring<Job>>,
    waiting: HashMap<JobKind, VecDeque<JobId>>,
    active: HashMap<JobKind, Vec<JobId>>,
    rates: HashMap<(JobKind, i64), Expiring<u32>>,
    buffers: HashMap<String, Expiring<Vec<BufferedMessage>>>,
    busy: HashMap<String, Expiring<String>>,
}

impl State {
    fn job_mut(&mut self, id: JobId) -> Option<&mut Expiring<Job>> {
        let now = Instant::now();
        if self.jobs.get(&id).is_some_and(|job| !job.is_live(now)) {
            self.jobs.remove(&id);
        }
        self.jobs.get_mut(&id)
    }

    fn put_job(&mut self, job: Job, ttl: Duration) {
        self.jobs.insert(job.id, Expiring::new(job, ttl));
    }

    fn active_len(&self, kind: JobKind) -> usize {
        self.active.get(&kind).map_or(0, Vec::len)
    }

    fn waiting_len(&self, kind: JobKind) -> usize {
        self.waiting.get(&kind).map_or(0, VecDeque::len)
    }

    /// Pop the first waiting job whose record still exists and activate it.
    fn promote_next(&mut self, kind: JobKind, now: DateTime<Utc>, ttls: StateTtls) -> Option<Job> {
        loop {
            let id = self.waiting.get_mut(&kind)?.pop_front()?;
            if let Some(entry) = self.job_mut(id) {
                entry.value.state = JobState::Active;
                entry.value.started_at = Some(now);
                entry.expires_at = Instant::now() + ttls.pending;
                let job = entry.value.clone();
                self.active.entry(kind).or_default().push(id);
                return Some(job);
            }
        }
    }

    /// Drops every expired bucket, not just `key`'s, so past minutes never
    /// pile up.
    fn rate_used(&mut self, key: (JobKind, i64)) -> u32 {
        let now = Instant::now();
        self.rates.retain(|_, count| count.is_live(now));
        self.rates.get(&key).map_or(0, |count| count.value)
    }

    fn charge_rate(&mut self, key: (JobKind, i64), units: u32) {
        if units == 0 {
            return;
        }
        self.rates
            .entry(key)
            .or_insert_with(|| Expiring::new(0, RATE_WINDOW))
            .value += units;
    }

    fn live_buffer(&mut self, conversation: &str) -> Option<&mut Expiring<Vec<BufferedMessage>>> {
        let now = Instant::now();
        if self
            .buffers
            .get(conversation)
            .is_some_and(|buffer| !buffer.is_live(now))
        {
            self.buffers.remove(conversation);
        }
        self.buffers.get_mut(conversation)
    }

    fn busy_holder(&mut self, conversation: &str) -> Option<&mut Expiring<String>> {
        let now = Instant::now();
        if self
            .busy
            .get(conversation)
            .is_some_and(|flag| !flag.is_live(now))
        {
            self.busy.remove(conversation);
        }
        self.busy.get_mut(conversation)
    }

    fn held_by(&mut self, conversation: &str, token: &str) -> bool {
        self.busy_holder(conversation)
            .is_some_and(|flag| flag.value == token)
    }
}

/// [`JobStore`] kept in process memory.
///
/// Suitable for a single service instance and for tests; queues are not
/// shared with other processes.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn get_job(&self, id: JobId) -> StoreResult<Option<Job>> {
        Ok(self.state.lock().job_mut(id).map(|entry| entry.value.clone()))
    }

    async fn admit(
        &self,
        job: Job,
        cap: Option<usize>,
        now: DateTime<Utc>,
        ttls: StateTtls,
    ) -> StoreResult<Admission> {
        let mut state = self.state.lock();
        let kind = job.kind;
        let has_room = cap.is_none_or(|cap| {
            state.active_len(kind) < cap && state.waiting_len(kind) == 0
        });

        let mut job = job;
        if has_room {
            job.state = JobState::Active;
            job.started_at = Some(now);
            state.active.entry(kind).or_default().push(job.id);
            state.put_job(job.clone(), ttls.pending);
            return Ok(Admission {
                job,
                position: None,
            });
        }

        job.state = JobState::Waiting;
        job.started_at = None;
        let waiting = state.waiting.entry(kind).or_default();
        waiting.push_back(job.id);
        let position = waiting.len() - 1;
        state.put_job(job.clone(), ttls.pending);
        Ok(Admission {
            job,
            position: Some(position),
        })
    }

    async fn push_waiting(&self, job: Job, ttls: StateTtls) -> StoreResult<usize> {
        let mut state = self.state.lock();
        let mut job = job;
        job.state = JobState::Waiting;
        let waiting = state.waiting.entry(job.kind).or_default();
        waiting.push_back(job.id);
        let len = waiting.len();
        state.put_job(job, ttls.pending);
        Ok(len)
    }

    async fn finish(&self, request: FinishRequest) -> StoreResult<FinishOutcome> {
        let mut state = self.state.lock();

        let Some(active) = state.active.get_mut(&request.kind) else {
            return Ok(FinishOutcome {
                finished: false,
                promoted: None,
            });
        };
        let Some(index) = active.iter().position(|id| *id == request.job_id) else {
            return Ok(FinishOutcome {
                finished: false,
                promoted: None,
            });
        };
        active.remove(index);

        if let Some(entry) = state.job_mut(request.job_id) {
            entry.value.state = request.state;
            entry.value.finished_at = Some(request.now);
            entry.value.error = request.error;
            entry.value.result = request.result;
            if let Some(retry_count) = request.retry_count {
                entry.value.retry_count = retry_count;
            }
            entry.expires_at = Instant::now() + request.ttls.for_state(request.state);
        }

        let promoted = match request.promote_cap {
            Some(cap) if state.active_len(request.kind) < cap => {
                state.promote_next(request.kind, request.now, request.ttls)
            }
            _ => None,
        };

        Ok(FinishOutcome {
            finished: true,
            promoted,
        })
    }

    async fn claim(&self, request: ClaimRequest) -> StoreResult<ClaimOutcome> {
        let mut state = self.state.lock();
        let rate_key = (request.kind, request.minute_bucket);

        let used = state.rate_used(rate_key);
        let in_flight = state.active_len(request.kind);
        let slots = usize::try_from(request.rpm.saturating_sub(used))
            .unwrap_or(usize::MAX)
            .min(request.concurrency.saturating_sub(in_flight));

        let mut jobs = Vec::with_capacity(slots);
        while jobs.len() < slots {
            match state.promote_next(request.kind, request.now, request.ttls) {
                Some(job) => jobs.push(job),
                None => break,
            }
        }
        state.charge_rate(rate_key, u32::try_from(jobs.len()).unwrap_or(u32::MAX));

        Ok(ClaimOutcome {
            in_flight: state.active_len(request.kind),
            waiting: state.waiting_len(request.kind),
            jobs,
        })
    }

    async fn set_retry_count(&self, id: JobId, retry_count: u32) -> StoreResult<()> {
        if let Some(entry) = self.state.lock().job_mut(id) {
            entry.value.retry_count = retry_count;
        }
        Ok(())
    }

    async fn list_ids(&self, kind: JobKind, list: QueueList) -> StoreResult<Vec<JobId>> {
        let state = self.state.lock();
        Ok(match list {
            QueueList::Waiting => state
                .waiting
                .get(&kind)
                .map(|ids| ids.iter().copied().collect())
                .unwrap_or_default(),
            QueueList::Active => state.active.get(&kind).cloned().unwrap_or_default(),
        })
    }

    async fn depth(&self, kind: JobKind) -> StoreResult<QueueDepth> {
        let state = self.state.lock();
        Ok(QueueDepth {
            waiting: state.waiting_len(kind),
            active: state.active_len(kind),
        })
    }

    async fn reserve_rate(
        &self,
        kind: JobKind,
        minute_bucket: i64,
        limit: u32,
        want: u32,
    ) -> StoreResult<u32> {
        let mut state = self.state.lock();
        let key = (kind, minute_bucket);
        let granted = want.min(limit.saturating_sub(state.rate_used(key)));
        state.charge_rate(key, granted);
        Ok(granted)
    }

    async fn rate_count(&self, kind: JobKind, minute_bucket: i64) -> StoreResult<u32> {
        Ok(self.state.lock().rate_used((kind, minute_bucket)))
    }

    async fn purge_finished(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        let mut state = self.state.lock();
        let now = Instant::now();
        let before = state.jobs.len();
        let mut purged = 0;
        state.jobs.retain(|_, entry| {
            if !entry.is_live(now) {
                return false;
            }
            let stale = entry.value.state.is_terminal()
                && entry.value.finished_at.is_some_and(|t| t < cutoff);
            if stale {
                purged += 1;
            }
            !stale
        });
        debug!(
            purged,
            expired = before - state.jobs.len() - purged,
            "Purged finished job records"
        );
        Ok(purged)
    }

    async fn buffer_push(
        &self,
        conversation: &str,
        message: &BufferedMessage,
        ttl: Duration,
    ) -> StoreResult<usize> {
        let mut state = self.state.lock();
        let expires_at = Instant::now() + ttl;
        if let Some(buffer) = state.live_buffer(conversation) {
            buffer.value.push(message.clone());
            buffer.expires_at = expires_at;
            return Ok(buffer.value.len());
        }
        state.buffers.insert(
            conversation.to_string(),
            Expiring {
                value: vec![message.clone()],
                expires_at,
            },
        );
        Ok(1)
    }

    async fn buffer_len(&self, conversation: &str) -> StoreResult<usize> {
        Ok(self
            .state
            .lock()
            .live_buffer(conversation)
            .map_or(0, |buffer| buffer.value.len()))
    }

    async fn begin_drain(
        &self,
        conversation: &str,
        expected_len: usize,
        token: &str,
        busy_ttl: Duration,
    ) -> StoreResult<DrainOutcome> {
        let mut state = self.state.lock();
        let len = state
            .live_buffer(conversation)
            .map_or(0, |buffer| buffer.value.len());

        if len == 0 {
            return Ok(DrainOutcome::Empty);
        }
        if len != expected_len {
            return Ok(DrainOutcome::StillGrowing {
                expected: expected_len,
                actual: len,
            });
        }
        if state.busy_holder(conversation).is_some() {
            return Ok(DrainOutcome::Busy);
        }

        state.busy.insert(
            conversation.to_string(),
            Expiring::new(token.to_string(), busy_ttl),
        );
        let items = state
            .buffers
            .remove(conversation)
            .map(|buffer| buffer.value)
            .unwrap_or_default();
        Ok(DrainOutcome::Drained(items))
    }

    async fn extend_busy(&self, conversation: &str, token: &str, busy_ttl: Duration) -> StoreResult<bool> {
        let mut state = self.state.lock();
        match state.busy_holder(conversation) {
            Some(flag) if flag.value == token => {
                flag.expires_at = Instant::now() + busy_ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, conversation: &str, token: &str) -> StoreResult<bool> {
        let mut state = self.state.lock();
        if !state.held_by(conversation, token) {
            return Ok(false);
        }
        state.busy.remove(conversation);
        Ok(true)
    }

    async fn is_busy(&self, conversation: &str) -> StoreResult<bool> {
        Ok(self.state.lock().busy_holder(conversation).is_some())
    }

    async fn buffered_conversations(&self) -> StoreResult<Vec<String>> {
        let mut state = self.state.lock();
        let now = Instant::now();
        state
            .buffers
            .retain(|_, buffer| buffer.is_live(now) && !buffer.value.is_empty());
        let mut conversations: Vec<String> = state.buffers.keys().cloned().collect();
        conversations.sort();
        Ok(conversations)
    }
}
