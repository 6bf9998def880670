//! Push demo jobs onto the configured queue

use anyhow::Context;
use clap::Parser;
use report_worker::{PruneJob, ReportJob};
use std::path::PathBuf;
use std::time::Duration;
use stevedore_queue::{QueueConfig, QueueManager, QueuedJob};

#[derive(Parser, Debug)]
#[command(name = "enqueue-reports", about = "Queue demo report jobs")]
struct Args {
    /// Queue configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of reports to queue
    #[arg(short, long, default_value = "10")]
    count: u64,

    /// Seconds before the reports become eligible
    #[arg(long, default_value = "0")]
    delay: u64,

    /// Also queue a prune job
    #[arg(long)]
    prune: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    stevedore_cli::init_tracing(false);

    let config = match &args.config {
        Some(path) => QueueConfig::from_file(path)?,
        None => {
            let _ = dotenvy::dotenv();
            QueueConfig::from_env()?
        }
    };
    let manager = QueueManager::new(config, report_worker::registry());
    manager
        .connection(None)
        .await?
        .prepare()
        .await
        .context("preparing queue storage")?;

    let ids = if args.delay == 0 {
        manager
            .enqueue_many(
                (1..=args.count).map(|report_id| QueuedJob::new(ReportJob { report_id })),
                None,
            )
            .await?
    } else {
        let mut ids = Vec::new();
        for report_id in 1..=args.count {
            ids.push(
                manager
                    .later(ReportJob { report_id }, Duration::from_secs(args.delay), None)
                    .await?,
            );
        }
        ids
    };
    tracing::info!(count = ids.len(), "Queued reports");

    if args.prune {
        let id = manager.enqueue(PruneJob { older_than_days: 30 }, None).await?;
        tracing::info!(job_id = %id, "Queued prune job");
    }
    Ok(())
}
