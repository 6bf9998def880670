//! Administration binary.
//!
//! Registers no job kinds, so it is meant for `setup`, `size`, `clear` and
//! the dead-letter commands. Workers belong in the application binary that
//! knows its jobs.

use clap::Parser;
use stevedore_cli::Cli;
use stevedore_queue::JobRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    stevedore_cli::init_tracing(cli.json);
    cli.execute(JobRegistry::new()).await
}
