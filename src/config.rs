//! Configuration loading and management.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Project-local config file, relative to the working directory.
pub const LOCAL_CONFIG_PATH: &str = "task-graph-engine/config.yaml";

/// Engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub engine: EngineConfig,
}

/// Where the shared store lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database file shared by every scheduler and worker.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

/// Timing and sizing knobs of the scheduler and worker loops.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// How long an acquired lock stays valid without a heartbeat.
    #[serde(default = "default_lease_duration")]
    pub lease_duration_secs: u64,

    /// How often a worker extends its lease while executing.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Sleep between polls when there is no work.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Maximum tasks visited per sweep step.
    #[serde(default = "default_sweep_batch_size")]
    pub sweep_batch_size: usize,

    /// Queue workers poll when none is named.
    #[serde(default = "default_queue")]
    pub default_queue: String,

    /// Cap given to queues created on first use.
    #[serde(default = "default_queue_concurrency")]
    pub default_queue_concurrency: i32,

    /// Upper bound for exponential retry backoff.
    #[serde(default = "default_retry_max_interval")]
    pub retry_max_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lease_duration_secs: default_lease_duration(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            poll_interval_ms: default_poll_interval(),
            sweep_batch_size: default_sweep_batch_size(),
            default_queue: default_queue(),
            default_queue_concurrency: default_queue_concurrency(),
            retry_max_interval_secs: default_retry_max_interval(),
        }
    }
}

impl EngineConfig {
    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_duration_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn retry_max_interval(&self) -> Duration {
        Duration::from_secs(self.retry_max_interval_secs)
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("task-graph-engine/engine.db")
}

fn default_lease_duration() -> u64 {
    60
}

fn default_heartbeat_interval() -> u64 {
    20
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_sweep_batch_size() -> usize {
    100
}

fn default_queue() -> String {
    crate::types::DEFAULT_QUEUE.to_string()
}

fn default_queue_concurrency() -> i32 {
    16
}

fn default_retry_max_interval() -> u64 {
    3600
}

impl Config {
    /// Load configuration from file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from default locations or return defaults.
    ///
    /// Environment overrides are applied on top either way.
    pub fn load_or_default() -> Self {
        let mut config = Self::default_locations()
            .into_iter()
            .find_map(|path| Self::load(path).ok())
            .unwrap_or_default();
        config.apply_env_overrides();
        config
    }

    fn default_locations() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(LOCAL_CONFIG_PATH)];
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".task-graph-engine").join("config.yaml"));
        }
        paths
    }

    /// Apply `TASK_GRAPH_ENGINE_*` environment variables.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(db_path) = std::env::var("TASK_GRAPH_ENGINE_DB_PATH") {
            self.store.db_path = PathBuf::from(db_path);
        }

        if let Ok(lease) = std::env::var("TASK_GRAPH_ENGINE_LEASE_SECS")
            && let Ok(lease) = lease.parse()
        {
            self.engine.lease_duration_secs = lease;
        }

        if let Ok(poll) = std::env::var("TASK_GRAPH_ENGINE_POLL_MS")
            && let Ok(poll) = poll.parse()
        {
            self.engine.poll_interval_ms = poll;
        }
    }

    /// Ensure the database directory exists.
    pub fn ensure_db_dir(&self) -> Result<()> {
        if let Some(parent) = self.store.db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}
