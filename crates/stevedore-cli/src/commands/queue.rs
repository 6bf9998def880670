//! Queue inspection and maintenance commands

use anyhow::Result;
use clap::Args;
use console::style;
use std::sync::Arc;
use stevedore_queue::{QueueBackend, QueueManager};

/// Selects a connection
#[derive(Args, Debug, Clone, Default)]
pub struct ConnectionArgs {
    /// Connection name (default: the configured default)
    #[arg(long)]
    pub connection: Option<String>,
}

/// Selects a queue on a connection
#[derive(Args, Debug, Clone, Default)]
pub struct QueueArgs {
    /// Connection name (default: the configured default)
    #[arg(long)]
    pub connection: Option<String>,

    /// Queue name (default: the connection's default queue)
    #[arg(short, long)]
    pub queue: Option<String>,
}

pub(crate) async fn resolve(
    manager: &QueueManager,
    connection: Option<&str>,
) -> Result<Arc<dyn QueueBackend>> {
    Ok(manager.connection(connection).await?)
}

fn queue_name(backend: &dyn QueueBackend, args: &QueueArgs) -> String {
    args.queue
        .clone()
        .unwrap_or_else(|| backend.default_queue().to_string())
}

pub async fn size(manager: &QueueManager, args: QueueArgs) -> Result<()> {
    let backend = resolve(manager, args.connection.as_deref()).await?;
    let queue = queue_name(backend.as_ref(), &args);
    let count = backend.size(&queue).await?;

    println!(
        "{} {} {}",
        style(backend.connection_name()).cyan(),
        style(&queue).bold(),
        count
    );
    Ok(())
}

pub async fn clear(manager: &QueueManager, args: QueueArgs) -> Result<()> {
    let backend = resolve(manager, args.connection.as_deref()).await?;
    let queue = queue_name(backend.as_ref(), &args);
    let removed = backend.clear(&queue).await?;

    tracing::warn!(connection = backend.connection_name(), queue = %queue, removed, "Cleared queue");
    println!(
        "{} Removed {} job(s) from {}",
        style("✓").green(),
        removed,
        style(&queue).bold()
    );
    Ok(())
}

pub async fn setup(manager: &QueueManager, args: ConnectionArgs) -> Result<()> {
    let backend = resolve(manager, args.connection.as_deref()).await?;
    backend.prepare().await?;

    println!(
        "{} Queue storage ready on {}",
        style("✓").green(),
        style(backend.connection_name()).cyan()
    );
    Ok(())
}
