//! acton-queue CLI tool

#![forbid(unsafe_code)]
#![allow(clippy::multiple_crate_versions)]

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{Context, JobsCommand, StatsCommand};

#[derive(Parser)]
#[command(name = "acton-queue")]
#[command(version)]
#[command(about = "Inspect and operate acton-queue stores", long_about = None)]
struct Cli {
    /// Configuration file (defaults to the layered service configuration)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Service name used to locate configuration files
    #[arg(long, global = true, default_value = "acton-queue")]
    service: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show waiting and active counts per kind
    Stats(StatsCommand),
    /// Refresh stats until interrupted
    Watch {
        /// Update interval in seconds
        #[arg(short, long, default_value = "2")]
        interval: u64,
    },
    #[command(flatten)]
    Jobs(JobsCommand),
    /// Delete completed and failed records past the retention window
    Purge,
    /// Fail active jobs that outlived their timeout and promote successors
    Reap,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let ctx = Context::load(cli.config.as_deref(), &cli.service)?;

    match cli.command {
        Commands::Stats(command) => command.execute(&ctx).await?,
        Commands::Watch { interval } => commands::watch(&ctx, interval).await?,
        Commands::Jobs(command) => command.execute(&ctx).await?,
        Commands::Purge => commands::purge(&ctx).await?,
        Commands::Reap => commands::reap(&ctx).await?,
    }

    Ok(())
}
