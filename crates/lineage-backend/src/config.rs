//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/lineage";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default minimum database connections in the pool.
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 2;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default database idle timeout in seconds (10 minutes).
pub const DEFAULT_DATABASE_IDLE_TIMEOUT_SECS: u64 = 600;

/// Default directory for result files, logs and staging areas.
pub const DEFAULT_DATA_DIR: &str = "./data";

/// Default pause between dispatcher passes.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// Delay before a job waiting on an unfinished parent is retried.
pub const DEFAULT_PARENT_WAIT_SECS: i64 = 30;

/// Delay before an interrupted job may be picked up again.
pub const DEFAULT_INTERRUPT_RETRY_SECS: i64 = 10;

/// What to do when a chain of unfinished presets has no real source above it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OrphanedPresetPolicy {
    /// Log a warning and finish the job without processing
    #[default]
    Finish,
    /// Log an error, annotate dataset and job, leave the job for an operator
    Escalate,
}

impl FromStr for OrphanedPresetPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "finish" => Ok(Self::Finish),
            "escalate" | "alert" => Ok(Self::Escalate),
            _ => Err(anyhow::anyhow!("Invalid orphaned preset policy: {}", s)),
        }
    }
}

/// Backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub workers: WorkerConfig,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

/// Where result files live
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

/// Worker and dispatcher behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub poll_interval_ms: u64,
    pub parent_wait_secs: i64,
    pub interrupt_retry_secs: i64,
    pub orphaned_preset_policy: OrphanedPresetPolicy,
    /// Recorded on every dataset a worker processes
    pub software_version: String,
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Parse `name` from the environment, or `default` when unset
fn env_or<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid value {:?} for {}: {}", value, name, e)),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Load configuration from `.env`, the environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let orphaned_preset_policy = match std::env::var("LINEAGE_ORPHANED_PRESET_POLICY") {
            Ok(value) => value.parse()?,
            Err(_) => OrphanedPresetPolicy::default(),
        };

        let config = Config {
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
                max_connections: env_or(
                    "DATABASE_MAX_CONNECTIONS",
                    DEFAULT_DATABASE_MAX_CONNECTIONS,
                )?,
                min_connections: env_or(
                    "DATABASE_MIN_CONNECTIONS",
                    DEFAULT_DATABASE_MIN_CONNECTIONS,
                )?,
                connect_timeout_secs: env_or(
                    "DATABASE_CONNECT_TIMEOUT",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                )?,
                idle_timeout_secs: env_or(
                    "DATABASE_IDLE_TIMEOUT",
                    DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
                )?,
            },
            storage: StorageConfig {
                data_dir: PathBuf::from(
                    std::env::var("LINEAGE_DATA_DIR")
                        .unwrap_or_else(|_| DEFAULT_DATA_DIR.to_string()),
                ),
            },
            workers: WorkerConfig {
                poll_interval_ms: env_or("LINEAGE_POLL_INTERVAL_MS", DEFAULT_POLL_INTERVAL_MS)?,
                parent_wait_secs: env_or("LINEAGE_PARENT_WAIT_SECS", DEFAULT_PARENT_WAIT_SECS)?,
                interrupt_retry_secs: env_or(
                    "LINEAGE_INTERRUPT_RETRY_SECS",
                    DEFAULT_INTERRUPT_RETRY_SECS,
                )?,
                orphaned_preset_policy,
                software_version: std::env::var("LINEAGE_SOFTWARE_VERSION")
                    .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            },
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }

        if self.database.min_connections > self.database.max_connections {
            anyhow::bail!(
                "Database min_connections ({}) cannot be greater than max_connections ({})",
                self.database.min_connections,
                self.database.max_connections
            );
        }

        if self.storage.data_dir.as_os_str().is_empty() {
            anyhow::bail!("LINEAGE_DATA_DIR cannot be empty");
        }

        if self.workers.poll_interval_ms == 0 {
            anyhow::bail!("LINEAGE_POLL_INTERVAL_MS must be greater than 0");
        }

        if self.workers.parent_wait_secs < 0 || self.workers.interrupt_retry_secs < 0 {
            anyhow::bail!("Retry delays cannot be negative");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: DEFAULT_DATABASE_URL.to_string(),
                max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
                min_connections: DEFAULT_DATABASE_MIN_CONNECTIONS,
                connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                idle_timeout_secs: DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
            },
            storage: StorageConfig {
                data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            },
            workers: WorkerConfig::default(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            parent_wait_secs: DEFAULT_PARENT_WAIT_SECS,
            interrupt_retry_secs: DEFAULT_INTERRUPT_RETRY_SECS,
            orphaned_preset_policy: OrphanedPresetPolicy::Finish,
            software_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
