//! SQLite-backed durable storage shared by every queue component.
//!
//! One database file holds four tables:
//!
//! - `jobs`: live jobs (pending, processing, completed, failed)
//! - `dead_letters`: jobs that exhausted their retries
//! - `config`: key/value tunables
//! - `worker_pools`: registry of running worker pools
//!
//! Operations that must be atomic run inside `BEGIN IMMEDIATE` transactions,
//! which take the database write lock before reading. That keeps them atomic
//! across threads sharing a [`Store`] and across processes sharing the file.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, Transaction, TransactionBehavior};

use crate::error::{QueueError, Result};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    command TEXT NOT NULL,
    state TEXT NOT NULL,
    attempts INTEGER NOT NULL,
    max_retries INTEGER NOT NULL,
    created_at_us INTEGER NOT NULL,
    updated_at_us INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS jobs_state_fifo ON jobs(state, created_at_us, id);

CREATE TABLE IF NOT EXISTS dead_letters (
    id TEXT PRIMARY KEY,
    command TEXT NOT NULL,
    attempts INTEGER NOT NULL,
    max_retries INTEGER NOT NULL,
    failed_reason TEXT NOT NULL,
    created_at_us INTEGER NOT NULL,
    updated_at_us INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS config (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS worker_pools (
    id TEXT PRIMARY KEY,
    pid INTEGER NOT NULL,
    workers INTEGER NOT NULL,
    started_at_us INTEGER NOT NULL,
    heartbeat_at_us INTEGER NOT NULL,
    stop_requested INTEGER NOT NULL DEFAULT 0
);
"#;

#[derive(Debug)]
pub struct Store {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        // journal_mode reports the resulting mode as a row, so it can't go through execute_batch.
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.execute_batch(SCHEMA)?;

        tracing::debug!(path = %path.display(), "Opened job store");
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    /// Database file location, `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| QueueError::StorePoisoned)
    }

    /// Run `f` inside an immediate transaction, committing only if it succeeds.
    pub(crate) fn write_tx<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

/// Run a synchronous store call on tokio's blocking pool.
///
/// Store calls may wait up to the busy timeout on a locked database, which
/// must not stall the async worker threads.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| QueueError::BlockingTask(e.to_string()))?
}

pub(crate) fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

pub(crate) fn from_micros(us: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(us).unwrap_or(DateTime::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_creates_parent_dirs_and_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("queue.db");

        let store = Store::open(&path).unwrap();
        assert!(path.exists());
        assert_eq!(store.path(), Some(path.as_path()));

        let tables: i64 = store
            .conn()
            .unwrap()
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 4);
    }

    #[test]
    fn reopen_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        drop(Store::open(&path).unwrap());
        Store::open(&path).unwrap();
    }

    #[test]
    fn failed_write_tx_rolls_back() {
        let store = Store::open_in_memory().unwrap();
        let result: Result<()> = store.write_tx(|tx| {
            tx.execute("INSERT INTO config(key, value) VALUES ('k', 'v')", [])?;
            Err(QueueError::InvalidInput("abort".to_string()))
        });
        assert!(result.is_err());

        let count: i64 = store
            .conn()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM config", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn blocking_runs_store_calls_off_the_runtime() {
        let store = std::sync::Arc::new(Store::open_in_memory().unwrap());
        let count: i64 = {
            let store = store.clone();
            blocking(move || {
                let conn = store.conn()?;
                Ok(conn.query_row("SELECT COUNT(*) FROM jobs", [], |row| row.get(0))?)
            })
            .await
            .unwrap()
        };
        assert_eq!(count, 0);

        let failed: Result<()> =
            blocking(|| Err(QueueError::InvalidInput("boom".to_string()))).await;
        assert!(matches!(failed, Err(QueueError::InvalidInput(_))));
    }

    #[test]
    fn micros_round_trip_preserves_order() {
        let a = Utc::now();
        let b = a + chrono::Duration::microseconds(1);
        assert!(to_micros(a) < to_micros(b));
        assert_eq!(to_micros(from_micros(to_micros(a))), to_micros(a));
    }
}
