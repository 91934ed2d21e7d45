//! CLI command implementations

mod jobs;
mod stats;

pub use jobs::JobsCommand;
pub use stats::{watch, StatsCommand};

use acton_queue::admission::AdmissionQueue;
use acton_queue::config::QueueConfig;
use acton_queue::store::RedisStore;
use anyhow::{Context as _, Result};
use console::{style, Emoji};
use std::sync::Arc;

pub static SUCCESS: Emoji = Emoji("✓", "√");
pub static INFO: Emoji = Emoji("ℹ", "i");

/// Loaded configuration and a store handle.
pub struct Context {
    pub config: QueueConfig,
    pub store: Arc<RedisStore>,
}

impl Context {
    /// Load configuration and build the Redis pool.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid or the Redis URL cannot
    /// be parsed. The server is not contacted yet.
    pub fn load(config_path: Option<&str>, service: &str) -> Result<Self> {
        let config = match config_path {
            Some(path) => QueueConfig::load_from(path)
                .with_context(|| format!("Failed to load configuration from {path}"))?,
            None => QueueConfig::load_for_service(service).context("Failed to load configuration")?,
        };
        acton_queue::observability::init(&config.observability)?;

        let store = RedisStore::from_settings(&config.store)
            .with_context(|| format!("Failed to create Redis pool for {}", config.store.redis_url))?;
        Ok(Self {
            config,
            store: Arc::new(store),
        })
    }

    /// Admission queue over the configured store.
    pub fn admission(&self) -> AdmissionQueue {
        AdmissionQueue::new(self.store.clone(), self.config.admission.clone())
    }
}

pub async fn purge(ctx: &Context) -> Result<()> {
    let queue = ctx.admission();
    let removed = queue.purge_expired().await.context("Purge failed")?;
    queue.shutdown();

    println!(
        "{} Purged {} record(s) older than {}h",
        SUCCESS,
        style(removed).cyan(),
        ctx.config.admission.retention_hours
    );
    Ok(())
}

pub async fn reap(ctx: &Context) -> Result<()> {
    let queue = ctx.admission();
    let reaped = queue.reap_stale().await.context("Reap failed")?;
    queue.shutdown();

    if reaped == 0 {
        println!("{} No stale active jobs", INFO);
    } else {
        println!("{} Failed {} stale job(s)", SUCCESS, style(reaped).yellow());
    }
    Ok(())
}
