//! CLI argument parsing

use crate::commands::{self, ConnectionArgs, QueueArgs, RunNextArgs, WorkArgs};
use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use stevedore_queue::{JobRegistry, QueueConfig, QueueManager};

/// Stevedore - run and administer durable job queues
#[derive(Parser, Debug)]
#[command(name = "stevedore")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Queue configuration file (TOML). Without it, STEVEDORE_* variables are read.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Emit logs and listings as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Process jobs until stopped
    Work(WorkArgs),

    /// Reserve and process a single job
    RunNext(RunNextArgs),

    /// Count the jobs on a queue
    Size(QueueArgs),

    /// Delete every job on a queue
    Clear(QueueArgs),

    /// Create the queue tables
    Setup(ConnectionArgs),

    /// List dead-lettered jobs
    Failed(ConnectionArgs),

    /// Push a dead-lettered job back onto its queue
    Retry {
        uuid: String,
        #[command(flatten)]
        target: ConnectionArgs,
    },

    /// Delete one dead-lettered job
    Forget {
        uuid: String,
        #[command(flatten)]
        target: ConnectionArgs,
    },

    /// Delete all dead-lettered jobs
    Flush(ConnectionArgs),
}

impl Cli {
    /// Execute the CLI command with the application's job kinds
    pub async fn execute(self, registry: JobRegistry) -> anyhow::Result<()> {
        let config = self.load_config()?;
        let manager = Arc::new(QueueManager::new(config, registry));
        let json = self.json;

        match self.command {
            Commands::Work(args) => commands::work(manager, args).await,
            Commands::RunNext(args) => commands::run_next(manager, args).await,
            Commands::Size(args) => commands::size(&manager, args).await,
            Commands::Clear(args) => commands::clear(&manager, args).await,
            Commands::Setup(args) => commands::setup(&manager, args).await,
            Commands::Failed(args) => commands::list_failed(&manager, args, json).await,
            Commands::Retry { uuid, target } => {
                commands::retry_failed(&manager, target, &uuid).await
            }
            Commands::Forget { uuid, target } => {
                commands::forget_failed(&manager, target, &uuid).await
            }
            Commands::Flush(args) => commands::flush_failed(&manager, args).await,
        }
    }

    fn load_config(&self) -> anyhow::Result<QueueConfig> {
        match &self.config {
            Some(path) => QueueConfig::from_file(path)
                .with_context(|| format!("loading queue config from {}", path.display())),
            None => {
                // A missing .env file is fine
                let _ = dotenvy::dotenv();
                QueueConfig::from_env().context("loading queue config from environment")
            }
        }
    }
}
