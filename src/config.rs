use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::{params, OptionalExtension};

use crate::error::Result;
use crate::scheduler::backoff::BackoffPolicy;
use crate::scheduler::job::DEFAULT_MAX_RETRIES;
use crate::store::Store;
use crate::worker::heartbeat::MIN_HEARTBEAT_INTERVAL;

/// Config key holding the exponential backoff base.
pub const BACKOFF_BASE_KEY: &str = "backoff_base";

/// In-process tunables for the engine and its worker pool.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// SQLite database file
    pub db_path: PathBuf,
    /// How long an idle worker waits before polling for pending jobs again
    pub poll_interval: Duration,
    /// Length of one backoff unit; a retry waits `unit * base^attempts`
    pub backoff_unit: Duration,
    /// How often a running pool refreshes its registry row
    pub heartbeat_interval: Duration,
    /// Pools silent for longer than this are not counted as active
    pub pool_liveness_timeout: Duration,
    /// Retry ceiling for submissions that don't specify one
    pub default_max_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("queuectl.db"),
            poll_interval: Duration::from_secs(1),
            backoff_unit: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(1),
            pool_liveness_timeout: Duration::from_secs(5),
            default_max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl EngineConfig {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            ..Default::default()
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_backoff_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit = unit;
        self
    }

    /// Values below [`MIN_HEARTBEAT_INTERVAL`] are raised to it.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval.max(MIN_HEARTBEAT_INTERVAL);
        self
    }
}

/// Durable key/value settings, shared with the CLI's `config` commands.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    store: Arc<Store>,
}

impl ConfigStore {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.store.conn()?;
        let value = conn
            .query_row(
                "SELECT value FROM config WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn get_or(&self, key: &str, default: &str) -> Result<String> {
        Ok(self.get(key)?.unwrap_or_else(|| default.to_string()))
    }

    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.store.conn()?;
        conn.execute(
            "INSERT INTO config (key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        tracing::debug!(key, value, "Config updated");
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<(String, String)>> {
        let conn = self.store.conn()?;
        let mut stmt = conn.prepare("SELECT key, value FROM config ORDER BY key")?;
        let entries = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    /// Current backoff policy. Read on every failure so changes apply
    /// without restarting workers.
    pub fn backoff_policy(&self, unit: Duration) -> Result<BackoffPolicy> {
        let raw = self.get(BACKOFF_BASE_KEY)?;
        Ok(BackoffPolicy::from_config_value(raw.as_deref(), unit))
    }
}
