//! Single-job commands

use super::{Context, INFO, SUCCESS};
use acton_queue::admission::Finished;
use acton_queue::jobs::{Job, JobId, JobKind, JobState};
use acton_queue::store::JobStore;
use anyhow::{bail, Context as _, Result};
use clap::Subcommand;
use console::style;
use serde_json::Value;

#[derive(Debug, Subcommand)]
pub enum JobsCommand {
    /// Show a stored job
    Status {
        /// Job ID
        job_id: JobId,

        /// Print the raw record as JSON
        #[arg(long)]
        json: bool,
    },

    /// Submit a job
    Submit {
        /// Job kind (create, start, stop, restart, logout, delete, crawl)
        kind: JobKind,

        /// Session id or URL the job acts on
        subject_id: String,

        /// JSON payload
        #[arg(short, long, default_value = "{}")]
        payload: String,
    },

    /// Mark an active session job completed
    Complete {
        /// Job ID
        job_id: JobId,

        /// JSON result to store
        #[arg(short, long)]
        result: Option<String>,
    },

    /// Mark an active session job failed
    Fail {
        /// Job ID
        job_id: JobId,

        /// Error to record
        error: String,
    },
}

impl JobsCommand {
    pub async fn execute(&self, ctx: &Context) -> Result<()> {
        match self {
            Self::Status { job_id, json } => status(ctx, *job_id, *json).await,
            Self::Submit {
                kind,
                subject_id,
                payload,
            } => submit(ctx, *kind, subject_id, payload).await,
            Self::Complete { job_id, result } => {
                let result = result.as_deref().map(parse_json).transpose()?;
                let queue = ctx.admission();
                let finished = queue.complete(*job_id, result).await;
                queue.shutdown();
                report(*job_id, finished?)
            }
            Self::Fail { job_id, error } => {
                let queue = ctx.admission();
                let finished = queue.fail(*job_id, error.as_str()).await;
                queue.shutdown();
                report(*job_id, finished?)
            }
        }
    }
}

async fn status(ctx: &Context, job_id: JobId, json: bool) -> Result<()> {
    let Some(job) = ctx.store.get_job(job_id).await? else {
        bail!("Job {job_id} not found (never existed or expired)");
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&job)?);
    } else {
        print_job(&job);
    }
    Ok(())
}

async fn submit(ctx: &Context, kind: JobKind, subject_id: &str, payload: &str) -> Result<()> {
    let payload = parse_json(payload)?;

    if kind == JobKind::Crawl {
        let job = Job::new(kind, subject_id, payload);
        let waiting = ctx.store.push_waiting(job.clone(), ctx.config.admission.ttls()).await?;
        println!("{} Queued crawl {} ({} waiting)", SUCCESS, style(job.id).cyan(), waiting);
        println!("  {}", style("A running worker pool picks it up").dim());
        return Ok(());
    }

    let queue = ctx.admission();
    let job = queue.submit(kind, subject_id, payload).await;
    queue.shutdown();
    let job = job?;

    println!("{} Submitted {} job {}", SUCCESS, kind, style(job.id).cyan());
    print_job(&job);
    if job.state == JobState::Active {
        println!("  {}", style(admitted_hint(ctx.config.admission.timeout_secs)).dim());
    }
    Ok(())
}

/// The CLI exits right after submitting, taking the job's timeout sweep with it.
fn admitted_hint(timeout_secs: u64) -> String {
    format!(
        "Admitted now. No timeout sweep runs from the CLI: complete or fail it yourself, \
         or run `acton-queue reap` once {timeout_secs}s have passed (a running service's \
         maintenance also reclaims it)"
    )
}

fn report(job_id: JobId, finished: Option<Finished>) -> Result<()> {
    let Some(finished) = finished else {
        println!("{} Job {} was not active; nothing changed", INFO, style(job_id).cyan());
        return Ok(());
    };

    println!("{} Job {} is now {}", SUCCESS, style(job_id).cyan(), finished.state);
    if let Some(promoted) = finished.promoted {
        println!("  Promoted {} ({})", style(promoted.id).green(), promoted.subject_id);
    }
    Ok(())
}

fn print_job(job: &Job) {
    let state = match job.state {
        JobState::Waiting => style(job.state.name()).blue(),
        JobState::Active => style(job.state.name()).yellow(),
        JobState::Completed => style(job.state.name()).green(),
        JobState::Failed => style(job.state.name()).red(),
    };

    println!("  ID:          {}", job.id);
    println!("  Kind:        {}", job.kind);
    println!("  Subject:     {}", job.subject_id);
    println!("  State:       {state}");
    println!("  Created:     {}", job.created_at.to_rfc3339());
    if let Some(started) = job.started_at {
        println!("  Started:     {}", started.to_rfc3339());
    }
    if let Some(finished) = job.finished_at {
        println!("  Finished:    {}", finished.to_rfc3339());
    }
    if job.retry_count > 0 {
        println!("  Retries:     {}", job.retry_count);
    }
    if let Some(error) = &job.error {
        println!("  Error:       {}", style(error).red());
    }
    if let Some(result) = &job.result {
        println!("  Result:      {result}");
    }
}

fn parse_json(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("Invalid JSON: {raw}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admitted_hint_points_at_reap() {
        let hint = admitted_hint(15);
        assert!(hint.contains("acton-queue reap"));
        assert!(hint.contains("15s"));
        assert!(hint.contains("No timeout sweep"));
    }

    #[test]
    fn test_parse_json_rejects_garbage() {
        assert_eq!(parse_json(r#"{"a": 1}"#).unwrap()["a"], 1);
        assert!(parse_json("{nope").is_err());
    }
}
