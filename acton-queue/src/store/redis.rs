//! Redis-backed [`JobStore`].
//!
//! Every invariant-bearing step is a Lua script, so admit, finish/promote,
//! claim, rate reservation and drain are each a single server-side
//! transaction no matter how many service instances share the store.
//!
//! Scripts touch job records by building their keys from the job key prefix.
//! That is fine on a single Redis node or a replicated primary, but not on
//! Redis Cluster.

use super::record;
use super::{
    Admission, ClaimOutcome, ClaimRequest, DrainOutcome, FinishOutcome, FinishRequest, JobStore,
    QueueDepth, QueueList, StoreKeys, RATE_WINDOW,
};
use crate::batcher::BufferedMessage;
use crate::config::StoreSettings;
use crate::error::{StoreError, StoreResult};
use crate::jobs::{Job, JobId, JobKind, JobState, StateTtls};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::{Pool, PoolConfig, Runtime};
use redis::{AsyncCommands, Script};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

const SCAN_COUNT: usize = 200;

/// KEYS: job, active, waiting. ARGV: id, cap (-1 = none), now, pending ttl,
/// then the encoded record as field/value pairs.
const ADMIT: &str = r"
local cap = tonumber(ARGV[2])
local active = redis.call('LLEN', KEYS[2])
local waiting = redis.call('LLEN', KEYS[3])
redis.call('HSET', KEYS[1], unpack(ARGV, 5))
if cap < 0 or (active < cap and waiting == 0) then
  redis.call('HSET', KEYS[1], 'state', 'active', 'started_at', ARGV[3])
  redis.call('EXPIRE', KEYS[1], ARGV[4])
  redis.call('RPUSH', KEYS[2], ARGV[1])
  return {'active', -1}
end
redis.call('HSET', KEYS[1], 'state', 'waiting', 'started_at', '')
redis.call('EXPIRE', KEYS[1], ARGV[4])
local len = redis.call('RPUSH', KEYS[3], ARGV[1])
return {'waiting', len - 1}
";

/// KEYS: active, waiting, job. ARGV: id, state, now, terminal ttl, error,
/// result, retry count ('' = keep), cap (-1 = no promotion), job prefix,
/// pending ttl.
const FINISH: &str = r"
if redis.call('LREM', KEYS[1], 1, ARGV[1]) == 0 then
  return {0, ''}
end
if redis.call('EXISTS', KEYS[3]) == 1 then
  redis.call('HSET', KEYS[3], 'state', ARGV[2], 'finished_at', ARGV[3], 'error', ARGV[5], 'result', ARGV[6])
  if ARGV[7] ~= '' then
    redis.call('HSET', KEYS[3], 'retry_count', ARGV[7])
  end
  redis.call('EXPIRE', KEYS[3], ARGV[4])
end
local cap = tonumber(ARGV[8])
if cap < 0 or redis.call('LLEN', KEYS[1]) >= cap then
  return {1, ''}
end
while true do
  local next_id = redis.call('LPOP', KEYS[2])
  if not next_id then
    return {1, ''}
  end
  local next_key = ARGV[9] .. next_id
  if redis.call('EXISTS', next_key) == 1 then
    redis.call('HSET', next_key, 'state', 'active', 'started_at', ARGV[3])
    redis.call('EXPIRE', next_key, ARGV[10])
    redis.call('RPUSH', KEYS[1], next_id)
    return {1, next_id}
  end
end
";

/// KEYS: waiting, active, rate. ARGV: rpm, concurrency, now, job prefix,
/// pending ttl, rate window.
const CLAIM: &str = r"
local used = tonumber(redis.call('GET', KEYS[3]) or '0')
local in_flight = redis.call('LLEN', KEYS[2])
local slots = math.min(tonumber(ARGV[1]) - used, tonumber(ARGV[2]) - in_flight)
local claimed = {}
while slots > 0 do
  local id = redis.call('LPOP', KEYS[1])
  if not id then
    break
  end
  local key = ARGV[4] .. id
  if redis.call('EXISTS', key) == 1 then
    redis.call('HSET', key, 'state', 'active', 'started_at', ARGV[3])
    redis.call('EXPIRE', key, ARGV[5])
    redis.call('RPUSH', KEYS[2], id)
    claimed[#claimed + 1] = id
    slots = slots - 1
  end
end
if #claimed > 0 then
  redis.call('INCRBY', KEYS[3], #claimed)
  if redis.call('TTL', KEYS[3]) < 0 then
    redis.call('EXPIRE', KEYS[3], ARGV[6])
  end
end
return {redis.call('LLEN', KEYS[2]), redis.call('LLEN', KEYS[1]), claimed}
";

/// KEYS: rate. ARGV: limit, want, rate window.
const RESERVE: &str = r"
local used = tonumber(redis.call('GET', KEYS[1]) or '0')
local granted = math.min(tonumber(ARGV[2]), tonumber(ARGV[1]) - used)
if granted <= 0 then
  return 0
end
redis.call('INCRBY', KEYS[1], granted)
if redis.call('TTL', KEYS[1]) < 0 then
  redis.call('EXPIRE', KEYS[1], ARGV[3])
end
return granted
";

/// KEYS: buffer, busy. ARGV: expected length, run token, busy ttl.
/// A drain reports the buffer's remaining TTL in ms in place of its length.
const BEGIN_DRAIN: &str = r"
local len = redis.call('LLEN', KEYS[1])
if len == 0 then
  return {'empty', 0, {}}
end
if len ~= tonumber(ARGV[1]) then
  return {'growing', len, {}}
end
if redis.call('EXISTS', KEYS[2]) == 1 then
  return {'busy', len, {}}
end
redis.call('SET', KEYS[2], ARGV[2], 'EX', ARGV[3])
local ttl = redis.call('PTTL', KEYS[1])
local items = redis.call('LRANGE', KEYS[1], 0, -1)
redis.call('DEL', KEYS[1])
return {'drained', ttl, items}
";

/// KEYS: busy. ARGV: run token, busy ttl.
const EXTEND_BUSY: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  redis.call('EXPIRE', KEYS[1], ARGV[2])
  return 1
end
return 0
";

/// KEYS: busy. ARGV: run token.
const RELEASE: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
";

/// KEYS: buffer, busy. ARGV: run token, buffer ttl in ms, then the drained
/// entries in order. Puts them back ahead of anything pushed since.
const RESTORE_BUFFER: &str = r"
for i = #ARGV, 3, -1 do
  redis.call('LPUSH', KEYS[1], ARGV[i])
end
if tonumber(ARGV[2]) > 0 and redis.call('PTTL', KEYS[1]) < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
if redis.call('GET', KEYS[2]) == ARGV[1] then
  redis.call('DEL', KEYS[2])
end
return redis.call('LLEN', KEYS[1])
";

/// KEYS: job. ARGV: field, value.
const SET_IF_EXISTS: &str = r"
if redis.call('EXISTS', KEYS[1]) == 1 then
  redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
  return 1
end
return 0
";

struct Scripts {
    admit: Script,
    finish: Script,
    claim: Script,
    reserve: Script,
    begin_drain: Script,
    extend_busy: Script,
    release: Script,
    restore_buffer: Script,
    set_if_exists: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            admit: Script::new(ADMIT),
            finish: Script::new(FINISH),
            claim: Script::new(CLAIM),
            reserve: Script::new(RESERVE),
            begin_drain: Script::new(BEGIN_DRAIN),
            extend_busy: Script::new(EXTEND_BUSY),
            release: Script::new(RELEASE),
            restore_buffer: Script::new(RESTORE_BUFFER),
            set_if_exists: Script::new(SET_IF_EXISTS),
        }
    }
}

/// [`JobStore`] on a pooled Redis connection.
pub struct RedisStore {
    pool: Pool,
    keys: StoreKeys,
    scripts: Scripts,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("prefix", &self.keys.prefix())
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Build a store on an existing pool.
    #[must_use]
    pub fn new(pool: Pool, keys: StoreKeys) -> Self {
        Self {
            pool,
            keys,
            scripts: Scripts::load(),
        }
    }

    /// Create a pool for `url` with at most `pool_size` connections.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Pool`] if the URL is invalid.
    pub fn connect(url: &str, pool_size: usize, keys: StoreKeys) -> StoreResult<Self> {
        let mut config = deadpool_redis::Config::from_url(url);
        config.pool = Some(PoolConfig::new(pool_size.max(1)));
        let pool = config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| StoreError::Pool(e.to_string()))?;
        debug!(prefix = keys.prefix(), pool_size, "Created Redis pool");
        Ok(Self::new(pool, keys))
    }

    /// Pool and key layout from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Pool`] if the URL is invalid.
    pub fn from_settings(settings: &StoreSettings) -> StoreResult<Self> {
        Self::connect(&settings.redis_url, settings.pool_size, StoreKeys::new(&settings.key_prefix))
    }

    /// Key layout in use.
    #[must_use]
    pub const fn keys(&self) -> &StoreKeys {
        &self.keys
    }

    /// Round-trip a `PING`.
    ///
    /// # Errors
    ///
    /// Returns an error if the server is unreachable.
    pub async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.pool.get().await?;
        let _: String = redis::cmd("PING").query_async(&mut *conn).await?;
        Ok(())
    }

    /// Put drained entries back at the head of the buffer and drop this
    /// run's busy flag.
    async fn restore_buffer(&self, conversation: &str, token: &str, ttl_ms: i64, items: &[String]) -> StoreResult<()> {
        let mut invocation = self.scripts.restore_buffer.prepare_invoke();
        invocation
            .key(self.keys.buffer(conversation))
            .key(self.keys.busy(conversation))
            .arg(token)
            .arg(ttl_ms);
        for raw in items {
            invocation.arg(raw);
        }
        let mut conn = self.pool.get().await?;
        let len: i64 = invocation.invoke_async(&mut *conn).await?;
        warn!(conversation, restored = items.len(), buffered = len, "Restored undecodable conversation buffer");
        Ok(())
    }

    async fn scan(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.pool.get().await?;
        let mut cursor: u64 = 0;
        let mut found = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut *conn)
                .await?;
            found.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(found)
    }
}

fn secs(duration: Duration) -> u64 {
    duration.as_secs().max(1)
}

fn cap_arg(cap: Option<usize>) -> i64 {
    cap.map_or(-1, |cap| i64::try_from(cap).unwrap_or(i64::MAX))
}

fn to_usize(value: i64) -> usize {
    usize::try_from(value).unwrap_or(0)
}

fn parse_ids(key: &str, raw: Vec<String>) -> StoreResult<Vec<JobId>> {
    raw.into_iter()
        .map(|id| {
            id.parse().map_err(|e: uuid::Error| StoreError::Corrupt {
                key: key.to_string(),
                reason: e.to_string(),
            })
        })
        .collect()
}

#[async_trait]
impl JobStore for RedisStore {
    async fn get_job(&self, id: JobId) -> StoreResult<Option<Job>> {
        let key = self.keys.job(id);
        let mut conn = self.pool.get().await?;
        let fields: HashMap<String, String> = conn.hgetall(&key).await?;
        record::decode(&key, fields)
    }

    async fn admit(
        &self,
        job: Job,
        cap: Option<usize>,
        now: DateTime<Utc>,
        ttls: StateTtls,
    ) -> StoreResult<Admission> {
        let key = self.keys.job(job.id);
        let fields = record::encode(&key, &job)?;
        let now_raw = now.to_rfc3339();

        let mut invocation = self.scripts.admit.prepare_invoke();
        invocation
            .key(&key)
            .key(self.keys.active(job.kind))
            .key(self.keys.waiting(job.kind))
            .arg(job.id.to_string())
            .arg(cap_arg(cap))
            .arg(&now_raw)
            .arg(secs(ttls.pending));
        for (field, value) in &fields {
            invocation.arg(*field).arg(value);
        }

        let mut conn = self.pool.get().await?;
        let (state, position): (String, i64) = invocation.invoke_async(&mut *conn).await?;

        let mut job = job;
        if state == JobState::Active.name() {
            job.state = JobState::Active;
            job.started_at = Some(now);
            Ok(Admission {
                job,
                position: None,
            })
        } else {
            job.state = JobState::Waiting;
            job.started_at = None;
            Ok(Admission {
                job,
                position: Some(to_usize(position)),
            })
        }
    }

    async fn push_waiting(&self, job: Job, ttls: StateTtls) -> StoreResult<usize> {
        let key = self.keys.job(job.id);
        let mut job = job;
        job.state = JobState::Waiting;
        let fields = record::encode(&key, &job)?;

        let mut conn = self.pool.get().await?;
        let (len,): (usize,) = redis::pipe()
            .atomic()
            .hset_multiple(&key, &fields)
            .ignore()
            .expire(&key, i64::try_from(secs(ttls.pending)).unwrap_or(i64::MAX))
            .ignore()
            .rpush(self.keys.waiting(job.kind), job.id.to_string())
            .query_async(&mut *conn)
            .await?;
        Ok(len)
    }

    async fn finish(&self, request: FinishRequest) -> StoreResult<FinishOutcome> {
        let key = self.keys.job(request.job_id);
        let result = request
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Corrupt {
                key: key.clone(),
                reason: e.to_string(),
            })?
            .unwrap_or_default();

        let mut invocation = self.scripts.finish.prepare_invoke();
        invocation
            .key(self.keys.active(request.kind))
            .key(self.keys.waiting(request.kind))
            .key(&key)
            .arg(request.job_id.to_string())
            .arg(request.state.name())
            .arg(request.now.to_rfc3339())
            .arg(secs(request.ttls.for_state(request.state)))
            .arg(request.error.clone().unwrap_or_default())
            .arg(result)
            .arg(request.retry_count.map(|n| n.to_string()).unwrap_or_default())
            .arg(cap_arg(request.promote_cap))
            .arg(self.keys.job_prefix())
            .arg(secs(request.ttls.pending));

        let (finished, promoted_id): (i64, String) = {
            let mut conn = self.pool.get().await?;
            invocation.invoke_async(&mut *conn).await?
        };

        let promoted = if promoted_id.is_empty() {
            None
        } else {
            let id = promoted_id.parse().map_err(|e: uuid::Error| StoreError::Corrupt {
                key: self.keys.waiting(request.kind),
                reason: e.to_string(),
            })?;
            let job = self.get_job(id).await?;
            if job.is_none() {
                warn!(job_id = %id, "Promoted job record vanished before it could be read");
            }
            job
        };

        Ok(FinishOutcome {
            finished: finished == 1,
            promoted,
        })
    }

    async fn claim(&self, request: ClaimRequest) -> StoreResult<ClaimOutcome> {
        let mut invocation = self.scripts.claim.prepare_invoke();
        invocation
            .key(self.keys.waiting(request.kind))
            .key(self.keys.active(request.kind))
            .key(self.keys.rate(request.kind, request.minute_bucket))
            .arg(request.rpm)
            .arg(request.concurrency)
            .arg(request.now.to_rfc3339())
            .arg(self.keys.job_prefix())
            .arg(secs(request.ttls.pending))
            .arg(RATE_WINDOW.as_secs());

        let (in_flight, waiting, ids): (i64, i64, Vec<String>) = {
            let mut conn = self.pool.get().await?;
            invocation.invoke_async(&mut *conn).await?
        };

        let mut jobs = Vec::with_capacity(ids.len());
        for id in parse_ids(&self.keys.active(request.kind), ids)? {
            match self.get_job(id).await? {
                Some(job) => jobs.push(job),
                None => warn!(job_id = %id, "Claimed job record vanished before it could be read"),
            }
        }

        Ok(ClaimOutcome {
            jobs,
            in_flight: to_usize(in_flight),
            waiting: to_usize(waiting),
        })
    }

    async fn set_retry_count(&self, id: JobId, retry_count: u32) -> StoreResult<()> {
        let mut invocation = self.scripts.set_if_exists.prepare_invoke();
        invocation
            .key(self.keys.job(id))
            .arg("retry_count")
            .arg(retry_count);
        let mut conn = self.pool.get().await?;
        let _: i64 = invocation.invoke_async(&mut *conn).await?;
        Ok(())
    }

    async fn list_ids(&self, kind: JobKind, list: QueueList) -> StoreResult<Vec<JobId>> {
        let key = match list {
            QueueList::Waiting => self.keys.waiting(kind),
            QueueList::Active => self.keys.active(kind),
        };
        let mut conn = self.pool.get().await?;
        let raw: Vec<String> = conn.lrange(&key, 0, -1).await?;
        parse_ids(&key, raw)
    }

    async fn depth(&self, kind: JobKind) -> StoreResult<QueueDepth> {
        let mut conn = self.pool.get().await?;
        let (waiting, active): (usize, usize) = redis::pipe()
            .llen(self.keys.waiting(kind))
            .llen(self.keys.active(kind))
            .query_async(&mut *conn)
            .await?;
        Ok(QueueDepth { waiting, active })
    }

    async fn reserve_rate(
        &self,
        kind: JobKind,
        minute_bucket: i64,
        limit: u32,
        want: u32,
    ) -> StoreResult<u32> {
        let mut invocation = self.scripts.reserve.prepare_invoke();
        invocation
            .key(self.keys.rate(kind, minute_bucket))
            .arg(limit)
            .arg(want)
            .arg(RATE_WINDOW.as_secs());
        let mut conn = self.pool.get().await?;
        let granted: i64 = invocation.invoke_async(&mut *conn).await?;
        Ok(u32::try_from(granted).unwrap_or(0))
    }

    async fn rate_count(&self, kind: JobKind, minute_bucket: i64) -> StoreResult<u32> {
        let mut conn = self.pool.get().await?;
        let count: Option<u32> = conn.get(self.keys.rate(kind, minute_bucket)).await?;
        Ok(count.unwrap_or(0))
    }

    async fn purge_finished(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        let keys = self.scan(&self.keys.job_pattern()).await?;
        let mut conn = self.pool.get().await?;
        let mut purged = 0;

        for key in keys {
            let (state, finished_at): (Option<String>, Option<String>) = redis::cmd("HMGET")
                .arg(&key)
                .arg("state")
                .arg("finished_at")
                .query_async(&mut *conn)
                .await?;

            let terminal = state
                .as_deref()
                .and_then(JobState::from_name)
                .is_some_and(JobState::is_terminal);
            if !terminal {
                continue;
            }

            let finished_at = record::parse_time(&key, finished_at.filter(|v| !v.is_empty()))?;
            if finished_at.is_some_and(|t| t < cutoff) {
                let removed: usize = conn.del(&key).await?;
                purged += removed;
            }
        }

        debug!(purged, cutoff = %cutoff, "Purged finished job records");
        Ok(purged)
    }

    async fn buffer_push(
        &self,
        conversation: &str,
        message: &BufferedMessage,
        ttl: Duration,
    ) -> StoreResult<usize> {
        let key = self.keys.buffer(conversation);
        let encoded = serde_json::to_string(message).map_err(|e| StoreError::Corrupt {
            key: key.clone(),
            reason: e.to_string(),
        })?;

        let mut conn = self.pool.get().await?;
        let (len,): (usize,) = redis::pipe()
            .atomic()
            .rpush(&key, encoded)
            .expire(&key, i64::try_from(secs(ttl)).unwrap_or(i64::MAX))
            .ignore()
            .query_async(&mut *conn)
            .await?;
        Ok(len)
    }

    async fn buffer_len(&self, conversation: &str) -> StoreResult<usize> {
        let mut conn = self.pool.get().await?;
        let len: usize = conn.llen(self.keys.buffer(conversation)).await?;
        Ok(len)
    }

    async fn begin_drain(
        &self,
        conversation: &str,
        expected_len: usize,
        token: &str,
        busy_ttl: Duration,
    ) -> StoreResult<DrainOutcome> {
        let buffer = self.keys.buffer(conversation);
        let mut invocation = self.scripts.begin_drain.prepare_invoke();
        invocation
            .key(&buffer)
            .key(self.keys.busy(conversation))
            .arg(expected_len)
            .arg(token)
            .arg(secs(busy_ttl));

        let (status, len, items): (String, i64, Vec<String>) = {
            let mut conn = self.pool.get().await?;
            invocation.invoke_async(&mut *conn).await?
        };

        match status.as_str() {
            "empty" => Ok(DrainOutcome::Empty),
            "growing" => Ok(DrainOutcome::StillGrowing {
                expected: expected_len,
                actual: to_usize(len),
            }),
            "busy" => Ok(DrainOutcome::Busy),
            "drained" => {
                let decoded: Result<Vec<BufferedMessage>, _> = items
                    .iter()
                    .map(|raw| serde_json::from_str::<BufferedMessage>(raw))
                    .collect();
                match decoded {
                    Ok(messages) => Ok(DrainOutcome::Drained(messages)),
                    Err(e) => {
                        self.restore_buffer(conversation, token, len, &items).await?;
                        Err(StoreError::Corrupt {
                            key: buffer,
                            reason: format!("undecodable buffered message, buffer restored: {e}"),
                        })
                    }
                }
            }
            other => Err(StoreError::Corrupt {
                key: buffer,
                reason: format!("unexpected drain status {other}"),
            }),
        }
    }

    async fn extend_busy(&self, conversation: &str, token: &str, busy_ttl: Duration) -> StoreResult<bool> {
        let mut invocation = self.scripts.extend_busy.prepare_invoke();
        invocation
            .key(self.keys.busy(conversation))
            .arg(token)
            .arg(secs(busy_ttl));
        let mut conn = self.pool.get().await?;
        let extended: i64 = invocation.invoke_async(&mut *conn).await?;
        Ok(extended == 1)
    }

    async fn release(&self, conversation: &str, token: &str) -> StoreResult<bool> {
        let mut invocation = self.scripts.release.prepare_invoke();
        invocation.key(self.keys.busy(conversation)).arg(token);
        let mut conn = self.pool.get().await?;
        let released: i64 = invocation.invoke_async(&mut *conn).await?;
        Ok(released == 1)
    }

    async fn is_busy(&self, conversation: &str) -> StoreResult<bool> {
        let mut conn = self.pool.get().await?;
        let busy: bool = conn.exists(self.keys.busy(conversation)).await?;
        Ok(busy)
    }

    async fn buffered_conversations(&self) -> StoreResult<Vec<String>> {
        let keys = self.scan(&self.keys.buffer_pattern()).await?;
        let mut conversations: Vec<String> = keys
            .iter()
            .filter_map(|key| self.keys.conversation_from_buffer(key))
            .map(str::to_string)
            .collect();
        conversations.sort();
        conversations.dedup();
        Ok(conversations)
    }
}
