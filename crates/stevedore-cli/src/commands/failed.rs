//! Dead-letter commands

use super::queue::{resolve, ConnectionArgs};
use anyhow::Result;
use console::style;
use stevedore_queue::QueueManager;

pub async fn list_failed(manager: &QueueManager, args: ConnectionArgs, json: bool) -> Result<()> {
    let backend = resolve(manager, args.connection.as_deref()).await?;
    let failed = backend.failed_jobs().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&failed)?);
        return Ok(());
    }

    if failed.is_empty() {
        println!("{}", style("No failed jobs").dim());
        return Ok(());
    }

    for job in &failed {
        let first_line = job.exception.lines().next().unwrap_or("");
        println!(
            "{} {} {} {}",
            style(&job.uuid).bold(),
            style(job.failed_at.to_rfc3339()).dim(),
            style(&job.queue).cyan(),
            style(first_line).red()
        );
    }
    println!();
    println!("{} failed job(s)", failed.len());
    Ok(())
}

pub async fn retry_failed(manager: &QueueManager, args: ConnectionArgs, uuid: &str) -> Result<()> {
    let backend = resolve(manager, args.connection.as_deref()).await?;

    match backend.retry_failed(uuid).await? {
        Some(id) => {
            println!(
                "{} Failed job {} pushed back as job {}",
                style("✓").green(),
                style(uuid).bold(),
                id
            );
            Ok(())
        }
        None => anyhow::bail!("no failed job with uuid {}", uuid),
    }
}

pub async fn forget_failed(manager: &QueueManager, args: ConnectionArgs, uuid: &str) -> Result<()> {
    let backend = resolve(manager, args.connection.as_deref()).await?;

    if !backend.forget_failed(uuid).await? {
        anyhow::bail!("no failed job with uuid {}", uuid);
    }
    println!("{} Failed job {} deleted", style("✓").green(), style(uuid).bold());
    Ok(())
}

pub async fn flush_failed(manager: &QueueManager, args: ConnectionArgs) -> Result<()> {
    let backend = resolve(manager, args.connection.as_deref()).await?;
    let removed = backend.flush_failed().await?;

    println!("{} Deleted {} failed job(s)", style("✓").green(), removed);
    Ok(())
}
