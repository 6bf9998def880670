#![allow(dead_code)]

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use stevedore_queue::{
    DatabaseBackend, DatabaseConfig, Job, JobContext, JobError, JobRegistry, ManualClock,
    QueueBackend, Result,
};
use tempfile::TempDir;

/// Epoch seconds every test clock starts from
pub const START: i64 = 1_700_000_000;

fn tally() -> &'static Mutex<HashMap<String, u32>> {
    static TALLY: OnceLock<Mutex<HashMap<String, u32>>> = OnceLock::new();
    TALLY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Jobs are rebuilt from payloads, so side effects are recorded globally
/// under a key unique to each test.
pub fn bump(key: &str) -> u32 {
    let mut tally = tally().lock().unwrap();
    let count = tally.entry(key.to_string()).or_insert(0);
    *count += 1;
    *count
}

pub fn hits(key: &str) -> u32 {
    tally().lock().unwrap().get(key).copied().unwrap_or(0)
}

/// Fails its first `fail_times` runs, then succeeds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountingJob {
    pub key: String,
    pub fail_times: u32,
}

impl CountingJob {
    pub fn ok(key: &str) -> Self {
        Self {
            key: key.to_string(),
            fail_times: 0,
        }
    }

    pub fn always_failing(key: &str) -> Self {
        Self {
            key: key.to_string(),
            fail_times: u32::MAX,
        }
    }
}

#[async_trait]
impl Job for CountingJob {
    const NAME: &'static str = "counting";

    async fn handle(&self, _ctx: JobContext) -> Result<()> {
        let run = bump(&self.key);
        if run <= self.fail_times {
            return Err(JobError::execution(format!("run {} of {} failed", run, self.key)));
        }
        Ok(())
    }

    async fn failed(&self, _ctx: JobContext, _error: &JobError) -> Result<()> {
        bump(&format!("failed:{}", self.key));
        Ok(())
    }
}

/// Report generation that never succeeds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportJob {
    pub report_id: u64,
}

#[async_trait]
impl Job for ReportJob {
    const NAME: &'static str = "report";

    async fn handle(&self, _ctx: JobContext) -> Result<()> {
        Err(JobError::execution(format!(
            "report {} could not be generated",
            self.report_id
        )))
    }

    async fn failed(&self, _ctx: JobContext, _error: &JobError) -> Result<()> {
        bump(&format!("report-failed:{}", self.report_id));
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlowJob {
    pub key: String,
}

#[async_trait]
impl Job for SlowJob {
    const NAME: &'static str = "slow";

    async fn handle(&self, _ctx: JobContext) -> Result<()> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        bump(&self.key);
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PanickingJob {}

#[async_trait]
impl Job for PanickingJob {
    const NAME: &'static str = "panicking";

    async fn handle(&self, _ctx: JobContext) -> Result<()> {
        panic!("exploded mid-job");
    }
}

/// Fails, and its failure hook fails too
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokenHookJob {
    pub key: String,
}

#[async_trait]
impl Job for BrokenHookJob {
    const NAME: &'static str = "broken_hook";

    fn max_tries(&self) -> u32 {
        1
    }

    async fn handle(&self, _ctx: JobContext) -> Result<()> {
        Err(JobError::execution("handle failed"))
    }

    async fn failed(&self, _ctx: JobContext, _error: &JobError) -> Result<()> {
        bump(&self.key);
        Err(JobError::execution("hook failed too"))
    }
}

/// Fails, and its failure hook panics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PanickingHookJob {
    pub key: String,
}

#[async_trait]
impl Job for PanickingHookJob {
    const NAME: &'static str = "panicking_hook";

    fn max_tries(&self) -> u32 {
        1
    }

    async fn handle(&self, _ctx: JobContext) -> Result<()> {
        Err(JobError::execution("handle failed"))
    }

    async fn failed(&self, _ctx: JobContext, _error: &JobError) -> Result<()> {
        bump(&self.key);
        panic!("hook exploded");
    }
}

pub fn registry() -> JobRegistry {
    JobRegistry::new()
        .with::<CountingJob>()
        .with::<ReportJob>()
        .with::<SlowJob>()
        .with::<PanickingJob>()
        .with::<BrokenHookJob>()
        .with::<PanickingHookJob>()
}

pub fn sqlite_config(dir: &TempDir) -> DatabaseConfig {
    let path = dir.path().join("queue.db");
    DatabaseConfig::with_url(format!("sqlite://{}?mode=rwc", path.display()))
}

/// A prepared SQLite-backed queue in a fresh temp directory
pub async fn sqlite_backend(clock: &ManualClock) -> (TempDir, Arc<DatabaseBackend>) {
    let dir = tempfile::tempdir().expect("temp dir");
    let backend = DatabaseBackend::connect("database", &sqlite_config(&dir), Arc::new(registry()))
        .await
        .expect("connect")
        .with_clock(Arc::new(clock.clone()));
    backend.prepare().await.expect("prepare");
    (dir, Arc::new(backend))
}

/// Insert a row bypassing serialization, as a foreign producer might
pub async fn insert_raw(backend: &DatabaseBackend, queue: &str, payload: &str) {
    sqlx::query(
        "INSERT INTO jobs (queue, payload, attempts, reserved_at, available_at, created_at) \
         VALUES ($1, $2, 0, NULL, $3, $3)",
    )
    .bind(queue)
    .bind(payload)
    .bind(START)
    .execute(backend.pool())
    .await
    .expect("raw insert");
}
