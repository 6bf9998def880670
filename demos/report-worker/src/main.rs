//! Report worker
//!
//! ```text
//! report-worker --config queue.toml setup
//! report-worker --config queue.toml work --queue reports --concurrency 4
//! report-worker --config queue.toml failed
//! ```

use clap::Parser;
use stevedore_cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    stevedore_cli::init_tracing(cli.json);
    cli.execute(report_worker::registry()).await
}
