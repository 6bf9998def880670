//! Jobs for the report worker demo

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use stevedore_queue::{Job, JobContext, JobError, JobRegistry, Result};

/// Render a report. Odd ids fail, to show retries and dead-lettering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportJob {
    pub report_id: u64,
}

#[async_trait]
impl Job for ReportJob {
    const NAME: &'static str = "report";

    fn queue(&self) -> Option<&str> {
        Some("reports")
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(30)
    }

    fn retry_after(&self) -> Duration {
        Duration::from_secs(10)
    }

    /// Linear backoff: 10s, 20s, 30s ...
    fn backoff(&self, attempt: u32) -> Duration {
        self.retry_after() * attempt.max(1)
    }

    fn display_name(&self) -> String {
        format!("report #{}", self.report_id)
    }

    async fn handle(&self, ctx: JobContext) -> Result<()> {
        tracing::info!(report_id = self.report_id, attempt = ctx.attempt, "Rendering report");
        tokio::time::sleep(Duration::from_millis(200)).await;

        if self.report_id % 2 == 1 {
            return Err(JobError::execution(format!(
                "report {} has no data source",
                self.report_id
            )));
        }
        Ok(())
    }

    async fn failed(&self, ctx: JobContext, error: &JobError) -> Result<()> {
        tracing::error!(
            report_id = self.report_id,
            attempts = ctx.attempt,
            error = %error,
            "Giving up on report"
        );
        Ok(())
    }
}

/// Remove reports older than a cutoff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PruneJob {
    pub older_than_days: u32,
}

#[async_trait]
impl Job for PruneJob {
    const NAME: &'static str = "prune";

    fn max_tries(&self) -> u32 {
        1
    }

    async fn handle(&self, _ctx: JobContext) -> Result<()> {
        tracing::info!(older_than_days = self.older_than_days, "Pruning old reports");
        Ok(())
    }
}

/// Every job kind this application can run
pub fn registry() -> JobRegistry {
    JobRegistry::new().with::<ReportJob>().with::<PruneJob>()
}
