//! Operator command line for stevedore queues
//!
//! Applications embed [`Cli`] in their own binary after registering their
//! job kinds, since a worker can only run jobs it knows how to rebuild:
//!
//! ```rust,ignore
//! use clap::Parser;
//! use stevedore_cli::Cli;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cli = Cli::parse();
//!     stevedore_cli::init_tracing(cli.json);
//!     cli.execute(JobRegistry::new().with::<ReportJob>()).await
//! }
//! ```

mod cli;
mod commands;

pub use cli::{Cli, Commands};
pub use commands::{ConnectionArgs, QueueArgs, RunNextArgs, WorkArgs};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `RUST_LOG` is not set
pub const DEFAULT_LOG_FILTER: &str = "info,stevedore=debug";

/// Install the global tracing subscriber. Does nothing if one is already set.
pub fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let registry = tracing_subscriber::registry().with(filter);

    let _ = if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
}
