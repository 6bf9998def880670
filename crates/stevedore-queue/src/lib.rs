//! Durable background job queue
//!
//! Jobs are persisted in a relational table, leased to workers one row at a
//! time, retried with a delay when they fail and moved to a dead-letter table
//! once their attempts run out. Delivery is at-least-once: a worker that dies
//! mid-job leaves a lease that expires and the job runs again elsewhere.
//!
//! ```rust,ignore
//! use stevedore_queue::{Job, JobContext, JobRegistry, QueueConfig, QueueManager, Result};
//!
//! #[derive(serde::Serialize, serde::Deserialize)]
//! struct ReportJob { report_id: u64 }
//!
//! #[async_trait::async_trait]
//! impl Job for ReportJob {
//!     const NAME: &'static str = "report";
//!
//!     async fn handle(&self, _ctx: JobContext) -> Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! let registry = JobRegistry::new().with::<ReportJob>();
//! let manager = QueueManager::new(QueueConfig::from_env()?, registry);
//! manager.enqueue(ReportJob { report_id: 42 }, None).await?;
//! ```

pub mod backend;
pub mod clock;
pub mod config;
pub mod error;
pub mod job;
pub mod manager;
pub mod registry;
pub mod worker;

pub use backend::database::{DatabaseBackend, Dialect};
pub use backend::sync::SyncBackend;
pub use backend::{FailedJob, QueueBackend};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConnectionConfig, DatabaseConfig, QueueConfig};
pub use error::{JobError, Result};
pub use job::{Job, JobContext, JobEnvelope, JobId, QueuedJob, DEFAULT_QUEUE};
pub use manager::{ConnectionScope, QueueManager};
pub use registry::JobRegistry;
pub use worker::{JobOutcome, Worker, WorkerOptions, WorkerStats};
