//! Queue depth and rate budget views

use super::{Context, INFO};
use acton_queue::clock;
use acton_queue::jobs::JobKind;
use acton_queue::store::JobStore;
use anyhow::Result;
use clap::Args;
use console::{style, Term};
use std::time::Duration;

#[derive(Debug, Args)]
pub struct StatsCommand {
    /// Only this kind
    #[arg(short, long)]
    kind: Option<JobKind>,

    /// Also list waiting job ids with their positions
    #[arg(short, long)]
    positions: bool,
}

impl StatsCommand {
    pub async fn execute(&self, ctx: &Context) -> Result<()> {
        print_depths(ctx, self.kind).await?;

        if self.positions {
            let queue = ctx.admission();
            let stats = queue.get_stats(self.kind).await?;
            queue.shutdown();

            println!();
            println!("{}", style("Waiting").bold().underlined());
            if stats.positions.is_empty() {
                println!("  {}", style("(nothing waiting)").dim());
            }
            for entry in stats.positions {
                println!("  {:<8} #{:<4} {}", entry.kind, entry.position, entry.job_id);
            }
        }
        Ok(())
    }
}

async fn print_depths(ctx: &Context, only: Option<JobKind>) -> Result<()> {
    let bucket = clock::system().minute_bucket();

    println!("{}", style("Queue Status").bold().underlined());
    println!("  {:<10} {:>8} {:>8} {:>12}", "Kind", "Waiting", "Active", "Limit");
    for kind in JobKind::ALL {
        if only.is_some_and(|only| only != kind) {
            continue;
        }
        let depth = ctx.store.depth(kind).await?;
        let limit = match kind {
            JobKind::Crawl => format!("{}/min", ctx.config.pool.rpm),
            _ => ctx
                .config
                .admission
                .cap_for(kind)
                .map_or_else(|| "none".to_string(), |cap| cap.to_string()),
        };
        println!(
            "  {:<10} {:>8} {:>8} {:>12}",
            kind.as_str(),
            style(depth.waiting).blue(),
            style(depth.active).yellow(),
            limit
        );
    }

    if only.is_none_or(|kind| kind == JobKind::Crawl) {
        let used = ctx.store.rate_count(JobKind::Crawl, bucket).await?;
        println!();
        println!(
            "  Crawl budget this minute: {} / {}",
            style(used).cyan(),
            ctx.config.pool.rpm
        );
    }
    Ok(())
}

/// Redraw the depth table every `interval` seconds until Ctrl-C.
pub async fn watch(ctx: &Context, interval: u64) -> Result<()> {
    let term = Term::stdout();
    let period = Duration::from_secs(interval.max(1));

    loop {
        term.clear_screen()?;
        println!(
            "{} {} (every {}s, Ctrl-C to stop)",
            INFO,
            chrono::Local::now().format("%H:%M:%S"),
            period.as_secs()
        );
        println!();
        print_depths(ctx, None).await?;

        tokio::select! {
            () = tokio::time::sleep(period) => {}
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}
