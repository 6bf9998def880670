use crate::backend::database::DatabaseBackend;
use crate::backend::sync::SyncBackend;
use crate::backend::QueueBackend;
use crate::clock::{Clock, SystemClock};
use crate::config::{ConnectionConfig, QueueConfig};
use crate::error::{JobError, Result};
use crate::job::{JobId, QueuedJob};
use crate::registry::JobRegistry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Resolves connection names to backends and forwards queue operations.
///
/// Producers and workers go through the manager rather than a concrete
/// backend, so switching a connection's driver needs no code change.
/// Resolved backends are cached for the life of the manager.
pub struct QueueManager {
    config: QueueConfig,
    registry: Arc<JobRegistry>,
    clock: Arc<dyn Clock>,
    connections: RwLock<HashMap<String, Arc<dyn QueueBackend>>>,
}

impl QueueManager {
    pub fn new(config: QueueConfig, registry: JobRegistry) -> Self {
        Self {
            config,
            registry: Arc::new(registry),
            clock: Arc::new(SystemClock),
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Clock handed to database backends resolved after this call
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Use a pre-built backend for `name` instead of building one from config
    pub fn with_backend(mut self, name: impl Into<String>, backend: Arc<dyn QueueBackend>) -> Self {
        self.connections.get_mut().insert(name.into(), backend);
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn default_connection(&self) -> &str {
        &self.config.default
    }

    /// Resolve a connection, building and caching it on first use
    pub async fn connection(&self, name: Option<&str>) -> Result<Arc<dyn QueueBackend>> {
        let name = name.unwrap_or(&self.config.default);

        if let Some(backend) = self.connections.read().await.get(name) {
            return Ok(Arc::clone(backend));
        }

        let mut connections = self.connections.write().await;
        // Another task may have resolved it while we waited for the lock
        if let Some(backend) = connections.get(name) {
            return Ok(Arc::clone(backend));
        }

        let backend = self.resolve(name).await?;
        connections.insert(name.to_string(), Arc::clone(&backend));
        Ok(backend)
    }

    async fn resolve(&self, name: &str) -> Result<Arc<dyn QueueBackend>> {
        let config = self
            .config
            .connection(name)
            .ok_or_else(|| JobError::Config(format!("queue connection `{}` is not configured", name)))?;

        let backend: Arc<dyn QueueBackend> = match config {
            ConnectionConfig::Sync => Arc::new(SyncBackend::new(name)),
            ConnectionConfig::Database(db) => Arc::new(
                DatabaseBackend::connect(name, db, Arc::clone(&self.registry))
                    .await?
                    .with_clock(Arc::clone(&self.clock)),
            ),
        };

        tracing::info!(connection = name, "Resolved queue connection");
        Ok(backend)
    }

    /// Queue operations against a named connection instead of the default
    pub fn on<'a>(&'a self, connection: &'a str) -> ConnectionScope<'a> {
        ConnectionScope {
            manager: self,
            connection: Some(connection),
        }
    }

    fn default_scope(&self) -> ConnectionScope<'_> {
        ConnectionScope {
            manager: self,
            connection: None,
        }
    }

    /// Push a job onto the default connection
    pub async fn enqueue(&self, job: impl Into<QueuedJob>, queue: Option<&str>) -> Result<JobId> {
        self.default_scope().enqueue(job, queue).await
    }

    /// Push a job that becomes eligible after `delay`
    pub async fn later(
        &self,
        job: impl Into<QueuedJob>,
        delay: Duration,
        queue: Option<&str>,
    ) -> Result<JobId> {
        self.default_scope().later(job, delay, queue).await
    }

    /// Push jobs one at a time.
    ///
    /// Stops at the first failure; jobs pushed before it stay enqueued.
    pub async fn enqueue_many<I>(&self, jobs: I, queue: Option<&str>) -> Result<Vec<JobId>>
    where
        I: IntoIterator<Item = QueuedJob>,
    {
        self.default_scope().enqueue_many(jobs, queue).await
    }

    pub async fn reserve(&self, queue: Option<&str>) -> Result<Option<QueuedJob>> {
        self.default_scope().reserve(queue).await
    }

    pub async fn size(&self, queue: Option<&str>) -> Result<u64> {
        self.default_scope().size(queue).await
    }
}

/// Producer operations bound to one connection, from [`QueueManager::on`]
#[derive(Clone, Copy)]
pub struct ConnectionScope<'a> {
    manager: &'a QueueManager,
    connection: Option<&'a str>,
}

impl ConnectionScope<'_> {
    async fn backend(&self) -> Result<Arc<dyn QueueBackend>> {
        self.manager.connection(self.connection).await
    }

    pub async fn enqueue(&self, job: impl Into<QueuedJob>, queue: Option<&str>) -> Result<JobId> {
        self.later(job, Duration::ZERO, queue).await
    }

    pub async fn later(
        &self,
        job: impl Into<QueuedJob>,
        delay: Duration,
        queue: Option<&str>,
    ) -> Result<JobId> {
        let mut job = job.into();
        if let Some(queue) = queue {
            job = job.on_queue(queue);
        }
        self.backend().await?.push(&mut job, delay).await
    }

    pub async fn enqueue_many<I>(&self, jobs: I, queue: Option<&str>) -> Result<Vec<JobId>>
    where
        I: IntoIterator<Item = QueuedJob>,
    {
        let backend = self.backend().await?;
        let mut ids = Vec::new();
        for mut job in jobs {
            if let Some(queue) = queue {
                job = job.on_queue(queue);
            }
            ids.push(backend.push(&mut job, Duration::ZERO).await?);
        }
        Ok(ids)
    }

    pub async fn reserve(&self, queue: Option<&str>) -> Result<Option<QueuedJob>> {
        let backend = self.backend().await?;
        let queue = queue.unwrap_or(backend.default_queue()).to_string();
        backend.reserve(&queue).await
    }

    pub async fn size(&self, queue: Option<&str>) -> Result<u64> {
        let backend = self.backend().await?;
        let queue = queue.unwrap_or(backend.default_queue()).to_string();
        backend.size(&queue).await
    }
}
