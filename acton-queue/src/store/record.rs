//! Job record <-> Redis hash fields.
//!
//! Optional fields are stored as empty strings so scripts can overwrite them
//! with plain `HSET`.

use crate::error::{StoreError, StoreResult};
use crate::jobs::{Job, JobKind, JobState};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

pub(super) fn encode(key: &str, job: &Job) -> StoreResult<Vec<(&'static str, String)>> {
    let payload = serde_json::to_string(&job.payload).map_err(|e| corrupt(key, &e))?;
    let result = job
        .result
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| corrupt(key, &e))?
        .unwrap_or_default();

    Ok(vec![
        ("id", job.id.to_string()),
        ("kind", job.kind.as_str().to_string()),
        ("subject_id", job.subject_id.clone()),
        ("state", job.state.name().to_string()),
        ("created_at", job.created_at.to_rfc3339()),
        ("started_at", optional_time(job.started_at)),
        ("finished_at", optional_time(job.finished_at)),
        ("payload", payload),
        ("retry_count", job.retry_count.to_string()),
        ("error", job.error.clone().unwrap_or_default()),
        ("result", result),
    ])
}

/// Decode a hash read with `HGETALL`. An empty hash means the key is gone.
pub(super) fn decode(key: &str, mut fields: HashMap<String, String>) -> StoreResult<Option<Job>> {
    if fields.is_empty() {
        return Ok(None);
    }

    let mut take = |name: &str| fields.remove(name).filter(|v| !v.is_empty());

    let id = take("id")
        .ok_or_else(|| missing(key, "id"))?
        .parse()
        .map_err(|e| corrupt(key, &e))?;
    let kind = take("kind")
        .ok_or_else(|| missing(key, "kind"))?
        .parse::<JobKind>()
        .map_err(|e| corrupt(key, &e))?;
    let state_name = take("state").ok_or_else(|| missing(key, "state"))?;
    let state = JobState::from_name(&state_name)
        .ok_or_else(|| corrupt(key, &format!("unknown state {state_name}")))?;
    let created_at = parse_time(key, take("created_at"))?.ok_or_else(|| missing(key, "created_at"))?;
    let started_at = parse_time(key, take("started_at"))?;
    let finished_at = parse_time(key, take("finished_at"))?;
    let payload = match take("payload") {
        Some(raw) => serde_json::from_str(&raw).map_err(|e| corrupt(key, &e))?,
        None => serde_json::Value::Null,
    };
    let retry_count = take("retry_count")
        .map(|raw| raw.parse::<u32>())
        .transpose()
        .map_err(|e| corrupt(key, &e))?
        .unwrap_or(0);
    let result = take("result")
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(|e| corrupt(key, &e))?;

    Ok(Some(Job {
        id,
        kind,
        subject_id: take("subject_id").unwrap_or_default(),
        state,
        created_at,
        started_at,
        finished_at,
        payload,
        retry_count,
        error: take("error"),
        result,
    }))
}

fn optional_time(time: Option<DateTime<Utc>>) -> String {
    time.map(|t| t.to_rfc3339()).unwrap_or_default()
}

pub(super) fn parse_time(key: &str, raw: Option<String>) -> StoreResult<Option<DateTime<Utc>>> {
    raw.map(|raw| DateTime::parse_from_rfc3339(&raw).map(|t| t.with_timezone(&Utc)))
        .transpose()
        .map_err(|e| corrupt(key, &e))
}

fn missing(key: &str, field: &str) -> StoreError {
    StoreError::Corrupt {
        key: key.to_string(),
        reason: format!("missing field {field}"),
    }
}

fn corrupt(key: &str, reason: &dyn std::fmt::Display) -> StoreError {
    StoreError::Corrupt {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}
