use super::{FailedJob, QueueBackend};
use crate::clock::{self, Clock, SystemClock};
use crate::config::DatabaseConfig;
use crate::error::{JobError, Result};
use crate::job::{JobId, QueuedJob};
use crate::registry::JobRegistry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// SQL flavour of the pool behind a [`DatabaseBackend`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    Sqlite,
}

impl Dialect {
    pub fn from_url(url: &str) -> Result<Self> {
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Ok(Self::Postgres)
        } else if url.starts_with("sqlite:") {
            Ok(Self::Sqlite)
        } else {
            Err(JobError::Config(format!(
                "unsupported database url `{}`; expected postgres:// or sqlite:",
                url
            )))
        }
    }

    /// Row lock taken by the reservation subquery. SQLite serialises writers
    /// on its database lock instead.
    fn lock_clause(self) -> &'static str {
        match self {
            Self::Postgres => " FOR UPDATE SKIP LOCKED",
            Self::Sqlite => "",
        }
    }

    fn id_column(self) -> &'static str {
        match self {
            Self::Postgres => "BIGSERIAL PRIMARY KEY",
            Self::Sqlite => "INTEGER PRIMARY KEY AUTOINCREMENT",
        }
    }
}

/// Relational queue backend.
///
/// Jobs live in one table (`jobs` by default) and dead letters in another
/// (`failed_jobs`). Reservation is a conditional `UPDATE ... RETURNING` in its
/// own transaction, so any number of workers on any number of hosts can poll
/// the same table and each row is leased to at most one of them at a time.
/// A lease that is neither deleted nor released expires after `retry_after`,
/// which makes delivery at-least-once.
pub struct DatabaseBackend {
    pool: AnyPool,
    dialect: Dialect,
    connection: String,
    table: String,
    failed_table: String,
    queue: String,
    retry_after: Duration,
    registry: Arc<JobRegistry>,
    clock: Arc<dyn Clock>,
}

impl DatabaseBackend {
    /// Wrap an existing pool
    pub fn new(
        pool: AnyPool,
        dialect: Dialect,
        connection: &str,
        config: &DatabaseConfig,
        registry: Arc<JobRegistry>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            pool,
            dialect,
            connection: connection.to_string(),
            table: config.table.clone(),
            failed_table: config.failed_table.clone(),
            queue: config.queue.clone(),
            retry_after: config.retry_after_duration(),
            registry,
            clock: Arc::new(SystemClock),
        })
    }

    /// Open a pool from `config.url`
    pub async fn connect(
        connection: &str,
        config: &DatabaseConfig,
        registry: Arc<JobRegistry>,
    ) -> Result<Self> {
        let url = config.url.as_deref().ok_or_else(|| {
            JobError::Config(format!("connection `{}` has no database url", connection))
        })?;
        let dialect = Dialect::from_url(url)?;

        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(url)
            .await?;

        tracing::debug!(connection, ?dialect, table = %config.table, "Connected queue backend");
        Self::new(pool, dialect, connection, config, registry)
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn now(&self) -> i64 {
        self.clock.now()
    }

    fn timestamp(&self, now: i64) -> String {
        DateTime::<Utc>::from_timestamp(now, 0)
            .unwrap_or_else(Utc::now)
            .to_rfc3339()
    }

    fn queue_for<'a>(&'a self, job: &'a QueuedJob) -> &'a str {
        job.queue().unwrap_or(&self.queue)
    }

    /// Dead-letter a row whose payload could not be decoded
    async fn bury(&self, id: JobId, queue: &str, payload: &str, error: &JobError) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        self.insert_failed(&mut tx, queue, payload, error).await?;
        sqlx::query(&format!("DELETE FROM {} WHERE id = $1", self.table))
            .bind(id.0)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn insert_failed(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Any>,
        queue: &str,
        payload: &str,
        error: &JobError,
    ) -> Result<String> {
        let uuid = Uuid::new_v4().to_string();
        let query = format!(
            r#"
            INSERT INTO {} (uuid, connection, queue, payload, exception, failed_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
            self.failed_table
        );

        sqlx::query(&query)
            .bind(&uuid)
            .bind(&self.connection)
            .bind(queue)
            .bind(payload)
            .bind(error.report())
            .bind(self.timestamp(self.now()))
            .execute(&mut **tx)
            .await?;

        Ok(uuid)
    }

    fn failed_from_row(row: &AnyRow) -> Result<FailedJob> {
        let failed_at: String = row.try_get("failed_at")?;
        let failed_at = DateTime::parse_from_rfc3339(&failed_at)
            .map_err(|e| JobError::InvalidPayload(format!("failed_at `{}`: {}", failed_at, e)))?
            .with_timezone(&Utc);

        Ok(FailedJob {
            uuid: row.try_get("uuid")?,
            connection: row.try_get("connection")?,
            queue: row.try_get("queue")?,
            payload: row.try_get("payload")?,
            exception: row.try_get("exception")?,
            failed_at,
        })
    }
}

#[async_trait]
impl QueueBackend for DatabaseBackend {
    fn connection_name(&self) -> &str {
        &self.connection
    }

    fn default_queue(&self) -> &str {
        &self.queue
    }

    async fn prepare(&self) -> Result<()> {
        let statements = [
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {} (
                    id {},
                    queue TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    attempts BIGINT NOT NULL DEFAULT 0,
                    reserved_at BIGINT NULL,
                    available_at BIGINT NOT NULL,
                    created_at BIGINT NOT NULL
                )
                "#,
                self.table,
                self.dialect.id_column()
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_{}_queue ON {} (queue, available_at)",
                self.table, self.table
            ),
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {} (
                    uuid TEXT PRIMARY KEY,
                    connection TEXT NOT NULL,
                    queue TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    exception TEXT NOT NULL,
                    failed_at TEXT NOT NULL
                )
                "#,
                self.failed_table
            ),
        ];

        for statement in &statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        Ok(())
    }

    async fn push(&self, job: &mut QueuedJob, delay: Duration) -> Result<JobId> {
        let payload = job.payload()?;
        let now = self.now();
        let available_at = clock::after(now, delay);
        let queue = self.queue_for(job).to_string();

        let query = format!(
            r#"
            INSERT INTO {} (queue, payload, attempts, reserved_at, available_at, created_at)
            VALUES ($1, $2, 0, NULL, $3, $4)
            RETURNING id
            "#,
            self.table
        );

        let row = sqlx::query(&query)
            .bind(&queue)
            .bind(&payload)
            .bind(available_at)
            .bind(now)
            .fetch_one(&self.pool)
            .await?;

        let id = JobId(row.try_get("id")?);
        job.set_id(id);

        tracing::debug!(job_id = %id, job = job.name(), queue = %queue, available_at, "Pushed job");
        Ok(id)
    }

    async fn reserve(&self, queue: &str) -> Result<Option<QueuedJob>> {
        let now = self.now();
        let lease_expired_before = now.saturating_sub(clock::seconds(self.retry_after));

        // The lease predicate is repeated outside the subquery so a concurrent
        // reservation that committed first makes this update match nothing.
        let query = format!(
            r#"
            UPDATE {table}
            SET reserved_at = $1, attempts = attempts + 1
            WHERE id = (
                SELECT id FROM {table}
                WHERE queue = $2
                  AND available_at <= $1
                  AND (reserved_at IS NULL OR reserved_at <= $3)
                ORDER BY id ASC
                LIMIT 1{lock}
            )
            AND (reserved_at IS NULL OR reserved_at <= $3)
            RETURNING id, queue, payload, attempts
            "#,
            table = self.table,
            lock = self.dialect.lock_clause(),
        );

        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&query)
            .bind(now)
            .bind(queue)
            .bind(lease_expired_before)
            .fetch_optional(&mut *tx)
            .await?;
        tx.commit().await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let id = JobId(row.try_get("id")?);
        let row_queue: String = row.try_get("queue")?;
        let payload: String = row.try_get("payload")?;
        let attempts: i64 = row.try_get("attempts")?;

        match self.registry.deserialize(&payload) {
            Ok(job) => {
                let mut job = job.on_queue(row_queue);
                job.set_id(id);
                job.set_attempts(attempts as u32);
                tracing::debug!(job_id = %id, job = job.name(), attempts, "Reserved job");
                Ok(Some(job))
            }
            Err(err) => {
                tracing::error!(job_id = %id, queue = %row_queue, error = %err, "Undecodable payload moved to dead letters");
                self.bury(id, &row_queue, &payload, &err).await?;
                Err(err)
            }
        }
    }

    async fn release(&self, job: &QueuedJob, delay: Duration) -> Result<()> {
        let id = job
            .id()
            .ok_or_else(|| JobError::NotEnqueued(job.display_name()))?;
        let available_at = clock::after(self.now(), delay);

        let query = format!(
            "UPDATE {} SET reserved_at = NULL, available_at = $1 WHERE id = $2",
            self.table
        );
        let result = sqlx::query(&query)
            .bind(available_at)
            .bind(id.0)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(JobError::JobNotFound(id));
        }
        Ok(())
    }

    async fn delete(&self, id: JobId) -> Result<bool> {
        let query = format!("DELETE FROM {} WHERE id = $1", self.table);
        let result = sqlx::query(&query)
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn move_to_dead_letter(&self, job: &QueuedJob, error: &JobError) -> Result<()> {
        let payload = job.payload()?;
        let queue = self.queue_for(job).to_string();

        let mut tx = self.pool.begin().await?;
        let uuid = self.insert_failed(&mut tx, &queue, &payload, error).await?;
        if let Some(id) = job.id() {
            sqlx::query(&format!("DELETE FROM {} WHERE id = $1", self.table))
                .bind(id.0)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        tracing::debug!(uuid = %uuid, job = job.name(), queue = %queue, "Recorded failed job");
        Ok(())
    }

    async fn size(&self, queue: &str) -> Result<u64> {
        let query = format!("SELECT COUNT(*) AS total FROM {} WHERE queue = $1", self.table);
        let row = sqlx::query(&query)
            .bind(queue)
            .fetch_one(&self.pool)
            .await?;
        let total: i64 = row.try_get("total")?;
        Ok(total as u64)
    }

    async fn clear(&self, queue: &str) -> Result<u64> {
        let query = format!("DELETE FROM {} WHERE queue = $1", self.table);
        let result = sqlx::query(&query)
            .bind(queue)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn failed_jobs(&self) -> Result<Vec<FailedJob>> {
        let query = format!(
            r#"
            SELECT uuid, connection, queue, payload, exception, failed_at
            FROM {}
            ORDER BY failed_at ASC, uuid ASC
            "#,
            self.failed_table
        );
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(Self::failed_from_row).collect()
    }

    async fn retry_failed(&self, uuid: &str) -> Result<Option<JobId>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT queue, payload FROM {} WHERE uuid = $1",
            self.failed_table
        ))
        .bind(uuid)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };
        let queue: String = row.try_get("queue")?;
        let payload: String = row.try_get("payload")?;
        let now = self.now();

        let inserted = sqlx::query(&format!(
            r#"
            INSERT INTO {} (queue, payload, attempts, reserved_at, available_at, created_at)
            VALUES ($1, $2, 0, NULL, $3, $3)
            RETURNING id
            "#,
            self.table
        ))
        .bind(&queue)
        .bind(&payload)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;
        let id = JobId(inserted.try_get("id")?);

        sqlx::query(&format!("DELETE FROM {} WHERE uuid = $1", self.failed_table))
            .bind(uuid)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::info!(uuid, job_id = %id, queue = %queue, "Failed job pushed back onto queue");
        Ok(Some(id))
    }

    async fn forget_failed(&self, uuid: &str) -> Result<bool> {
        let result = sqlx::query(&format!("DELETE FROM {} WHERE uuid = $1", self.failed_table))
            .bind(uuid)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn flush_failed(&self) -> Result<u64> {
        let result = sqlx::query(&format!("DELETE FROM {}", self.failed_table))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
