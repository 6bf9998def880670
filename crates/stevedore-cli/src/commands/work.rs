//! Worker commands

use anyhow::Result;
use clap::Args;
use console::style;
use std::sync::Arc;
use std::time::Duration;
use stevedore_queue::{QueueManager, Worker, WorkerOptions};

/// Arguments for the `work` command
#[derive(Args, Debug)]
pub struct WorkArgs {
    /// Connection name (default: the configured default)
    #[arg(long)]
    pub connection: Option<String>,

    /// Queue to poll (default: the connection's default queue)
    #[arg(short, long)]
    pub queue: Option<String>,

    /// Seconds to sleep when no job is available
    #[arg(long, default_value = "3")]
    pub sleep: u64,

    /// Attempts before a job is dead-lettered (caps the job's own limit)
    #[arg(long)]
    pub tries: Option<u32>,

    /// Seconds a job may run (overrides the job's own; 0 disables)
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Stop after processing this many jobs
    #[arg(long)]
    pub max_jobs: Option<u64>,

    /// Stop once the queue has no eligible job
    #[arg(long)]
    pub stop_when_empty: bool,

    /// Jobs processed side by side
    #[arg(long, default_value = "1")]
    pub concurrency: usize,
}

impl WorkArgs {
    pub fn options(&self) -> WorkerOptions {
        let mut options = WorkerOptions::new()
            .sleep(Duration::from_secs(self.sleep))
            .concurrency(self.concurrency);
        options.connection = self.connection.clone();
        options.queue = self.queue.clone();
        options.max_tries = self.tries;
        options.timeout = self.timeout.map(Duration::from_secs);
        options.max_jobs = self.max_jobs;
        options.stop_when_empty = self.stop_when_empty;
        options
    }
}

/// Arguments for the `run-next` command
#[derive(Args, Debug)]
pub struct RunNextArgs {
    /// Connection name (default: the configured default)
    #[arg(long)]
    pub connection: Option<String>,

    /// Queue to reserve from
    #[arg(short, long)]
    pub queue: Option<String>,

    /// Attempts before the job is dead-lettered (caps the job's own limit)
    #[arg(long)]
    pub tries: Option<u32>,

    /// Seconds the job may run (0 disables)
    #[arg(long)]
    pub timeout: Option<u64>,
}

impl RunNextArgs {
    pub fn options(&self) -> WorkerOptions {
        let mut options = WorkerOptions::new().handle_signals(false);
        options.connection = self.connection.clone();
        options.queue = self.queue.clone();
        options.max_tries = self.tries;
        options.timeout = self.timeout.map(Duration::from_secs);
        options
    }
}

/// Run a worker until it is stopped or runs out of work
pub async fn work(manager: Arc<QueueManager>, args: WorkArgs) -> Result<()> {
    let options = args.options();

    println!(
        "{} {}",
        style("Processing jobs on").bold(),
        style(options.queue.as_deref().unwrap_or("the default queue")).cyan()
    );
    println!("{}", style("Press Ctrl+C to stop").dim());
    println!();

    let stats = Worker::new(manager).run(options).await?;

    println!();
    println!(
        "{} processed {}, succeeded {}, retried {}, dead-lettered {}, rejected {}",
        style("Worker stopped:").bold(),
        stats.processed,
        style(stats.succeeded).green(),
        style(stats.retried).yellow(),
        style(stats.dead_lettered).red(),
        stats.rejected
    );
    Ok(())
}

/// Process at most one job
pub async fn run_next(manager: Arc<QueueManager>, args: RunNextArgs) -> Result<()> {
    let options = args.options();

    if Worker::new(manager).run_next_job(&options).await? {
        println!("{} Processed one job", style("✓").green());
    } else {
        println!("{}", style("No job available").dim());
    }
    Ok(())
}
