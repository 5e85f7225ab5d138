//! Registry of running worker pools.
//!
//! Each pool keeps a row in the `worker_pools` table fresh while it runs. The
//! row lets other processes count active workers and ask the pool to stop.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rusqlite::params;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Result;
use crate::store::{blocking, to_micros, Store};

/// Shortest tick a [`HeartbeatSender`] will use.
pub const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1);

/// A pool's entry in the registry. Removed by [`PoolRegistration::deregister`].
#[derive(Debug)]
pub struct PoolRegistration {
    id: Uuid,
    workers: usize,
    store: Arc<Store>,
}

impl PoolRegistration {
    pub fn register(store: Arc<Store>, workers: usize) -> Result<Self> {
        let registration = Self {
            id: Uuid::new_v4(),
            workers,
            store,
        };
        registration.insert()?;
        tracing::info!(pool_id = %registration.id, workers, "Worker pool registered");
        Ok(registration)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Refresh the heartbeat. Returns true if a stop has been requested.
    pub fn beat(&self) -> Result<bool> {
        let conn = self.store.conn()?;
        let changed = conn.execute(
            "UPDATE worker_pools SET heartbeat_at_us = ?2 WHERE id = ?1",
            params![self.id.to_string(), to_micros(Utc::now())],
        )?;
        drop(conn);
        if changed == 0 {
            // Row was cleared out from under us; put it back.
            self.insert()?;
            return Ok(false);
        }

        let conn = self.store.conn()?;
        let stop_requested: bool = conn.query_row(
            "SELECT stop_requested FROM worker_pools WHERE id = ?1",
            params![self.id.to_string()],
            |row| row.get(0),
        )?;
        Ok(stop_requested)
    }

    pub fn deregister(&self) -> Result<()> {
        let conn = self.store.conn()?;
        conn.execute(
            "DELETE FROM worker_pools WHERE id = ?1",
            params![self.id.to_string()],
        )?;
        tracing::info!(pool_id = %self.id, "Worker pool deregistered");
        Ok(())
    }

    fn insert(&self) -> Result<()> {
        let now = to_micros(Utc::now());
        let conn = self.store.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO worker_pools \
             (id, pid, workers, started_at_us, heartbeat_at_us, stop_requested) \
             VALUES (?1, ?2, ?3, ?4, ?4, 0)",
            params![
                self.id.to_string(),
                std::process::id(),
                self.workers as i64,
                now
            ],
        )?;
        Ok(())
    }
}

/// Ask every live pool to stop. Returns how many pools were flagged.
///
/// Rows that have not heartbeated within `liveness_timeout` belong to pools
/// that died without deregistering; they are deleted instead of flagged.
pub fn request_stop_all(store: &Store, liveness_timeout: Duration) -> Result<usize> {
    let cutoff = liveness_cutoff(liveness_timeout);
    store.write_tx(|tx| {
        let pruned = tx.execute(
            "DELETE FROM worker_pools WHERE heartbeat_at_us < ?1",
            params![cutoff],
        )?;
        if pruned > 0 {
            tracing::info!(pruned, "Removed stale worker pool entries");
        }
        let flagged = tx.execute(
            "UPDATE worker_pools SET stop_requested = 1 \
             WHERE stop_requested = 0 AND heartbeat_at_us >= ?1",
            params![cutoff],
        )?;
        Ok(flagged)
    })
}

/// Total workers across pools that heartbeated within `liveness_timeout`.
pub fn active_workers(store: &Store, liveness_timeout: Duration) -> Result<u64> {
    let cutoff = liveness_cutoff(liveness_timeout);
    let conn = store.conn()?;
    let total: i64 = conn.query_row(
        "SELECT COALESCE(SUM(workers), 0) FROM worker_pools WHERE heartbeat_at_us >= ?1",
        params![cutoff],
        |row| row.get(0),
    )?;
    Ok(total.max(0) as u64)
}

fn liveness_cutoff(liveness_timeout: Duration) -> i64 {
    let timeout_us = i64::try_from(liveness_timeout.as_micros()).unwrap_or(i64::MAX);
    to_micros(Utc::now()).saturating_sub(timeout_us)
}

/// Periodically refreshes a pool's registry row and turns a persisted stop
/// request into cancellation of the pool's token.
pub struct HeartbeatSender {
    interval: Duration,
}

impl HeartbeatSender {
    /// Intervals below [`MIN_HEARTBEAT_INTERVAL`] are raised to it.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: interval.max(MIN_HEARTBEAT_INTERVAL),
        }
    }

    pub async fn run(&self, registration: Arc<PoolRegistration>, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    let beating = registration.clone();
                    match blocking(move || beating.beat()).await {
                        Ok(true) => {
                            tracing::info!(
                                pool_id = %registration.id(),
                                "Stop requested, draining workers"
                            );
                            token.cancel();
                            break;
                        }
                        Ok(false) => {}
                        Err(e) => {
                            tracing::warn!(
                                pool_id = %registration.id(),
                                error = %e,
                                "Heartbeat failed"
                            );
                        }
                    }
                }
            }
        }
    }
}
