//! Connection configuration for the queue manager.
//!
//! Configuration is read from TOML:
//!
//! ```toml
//! default = "main"
//!
//! [connections.main]
//! driver = "database"
//! url = "postgres://localhost/app"
//! table = "jobs"
//! retry_after = 90
//!
//! [connections.inline]
//! driver = "sync"
//! ```
//!
//! or, for a single connection, from `STEVEDORE_*` environment variables
//! (`STEVEDORE_DRIVER`, `STEVEDORE_DATABASE_URL`, `STEVEDORE_TABLE`, ...).

use crate::error::{JobError, Result};
use crate::job::DEFAULT_QUEUE;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

const ENV_PREFIX: &str = "STEVEDORE_";

fn default_connection() -> String {
    "sync".to_string()
}

/// Named connections and which one is the default
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_connection")]
    pub default: String,
    #[serde(default)]
    pub connections: BTreeMap<String, ConnectionConfig>,
}

/// Settings for one connection, selected by `driver`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "driver", rename_all = "lowercase")]
pub enum ConnectionConfig {
    Sync,
    Database(DatabaseConfig),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub table: String,
    pub failed_table: String,
    pub queue: String,
    /// Seconds a lease lasts before the job may be reserved again
    pub retry_after: u64,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            table: "jobs".to_string(),
            failed_table: "failed_jobs".to_string(),
            queue: DEFAULT_QUEUE.to_string(),
            retry_after: 90,
            max_connections: 5,
        }
    }
}

impl DatabaseConfig {
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    pub fn retry_after_duration(&self) -> Duration {
        Duration::from_secs(self.retry_after)
    }

    /// Table names are interpolated into SQL, so they must be plain identifiers.
    pub fn validate(&self) -> Result<()> {
        for (field, name) in [("table", &self.table), ("failed_table", &self.failed_table)] {
            if !is_identifier(name) {
                return Err(JobError::Config(format!(
                    "{} `{}` is not a valid SQL identifier",
                    field, name
                )));
            }
        }
        if self.queue.is_empty() {
            return Err(JobError::Config("queue name must not be empty".to_string()));
        }
        if self.max_connections == 0 {
            return Err(JobError::Config(
                "max_connections must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && name.len() <= 63
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default: default_connection(),
            connections: BTreeMap::from([(default_connection(), ConnectionConfig::Sync)]),
        }
    }
}

/// Flat single-connection settings read from the environment
#[derive(Debug, Deserialize)]
struct EnvConfig {
    connection: Option<String>,
    driver: Option<String>,
    database_url: Option<String>,
    table: Option<String>,
    failed_table: Option<String>,
    queue: Option<String>,
    retry_after: Option<u64>,
    max_connections: Option<u32>,
}

impl QueueConfig {
    /// A configuration with one connection, which is also the default
    pub fn single(name: impl Into<String>, connection: ConnectionConfig) -> Self {
        let name = name.into();
        Self {
            default: name.clone(),
            connections: BTreeMap::from([(name, connection)]),
        }
    }

    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source)
            .map_err(|e| JobError::Config(format!("invalid queue configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|e| JobError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&source)
    }

    /// Load from `STEVEDORE_*` process environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_env_vars(std::env::vars())
    }

    pub fn from_env_vars<I>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let env: EnvConfig = envy::prefixed(ENV_PREFIX)
            .from_iter(vars)
            .map_err(|e| JobError::Config(e.to_string()))?;

        let connection = match env.driver.as_deref().unwrap_or("sync") {
            "sync" => ConnectionConfig::Sync,
            "database" => {
                let defaults = DatabaseConfig::default();
                ConnectionConfig::Database(DatabaseConfig {
                    url: env.database_url,
                    table: env.table.unwrap_or(defaults.table),
                    failed_table: env.failed_table.unwrap_or(defaults.failed_table),
                    queue: env.queue.unwrap_or(defaults.queue),
                    retry_after: env.retry_after.unwrap_or(defaults.retry_after),
                    max_connections: env.max_connections.unwrap_or(defaults.max_connections),
                })
            }
            other => {
                return Err(JobError::Config(format!("unknown queue driver `{}`", other)));
            }
        };

        let name = env.connection.unwrap_or_else(|| match connection {
            ConnectionConfig::Sync => "sync".to_string(),
            ConnectionConfig::Database(_) => "database".to_string(),
        });
        let config = Self::single(name, connection);
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.connections.contains_key(&self.default) {
            return Err(JobError::Config(format!(
                "default connection `{}` is not configured",
                self.default
            )));
        }
        for connection in self.connections.values() {
            if let ConnectionConfig::Database(db) = connection {
                db.validate()?;
            }
        }
        Ok(())
    }

    pub fn connection(&self, name: &str) -> Option<&ConnectionConfig> {
        self.connections.get(name)
    }
}
