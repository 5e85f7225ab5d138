use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{QueueError, Result};
use crate::scheduler::job::{DeadLetterRecord, Job, JobState};
use crate::scheduler::queue::{delete_job, get_job, upsert_job};
use crate::store::{from_micros, to_micros, Store};

pub const MAX_RETRIES_EXCEEDED: &str = "Max retries exceeded";

/// Durable store of jobs that exhausted their retries.
///
/// Moves between the job queue and this store happen in one transaction, so a
/// job is always in exactly one of the two.
#[derive(Debug, Clone)]
pub struct DeadLetterQueue {
    store: Arc<Store>,
}

impl DeadLetterQueue {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Move `job` out of the job queue and into the dead-letter queue.
    ///
    /// The record is built from the given snapshot, so callers pass the job
    /// with its final attempt already recorded. Fails with `NotFound` if the
    /// job is not in the job queue.
    pub fn archive(&self, job: &Job, failed_reason: &str) -> Result<DeadLetterRecord> {
        let record = DeadLetterRecord::new(job, failed_reason);
        self.store.write_tx(|tx| {
            if get_job(tx, &job.id)?.is_none() {
                return Err(QueueError::NotFound(job.id.clone()));
            }
            move_to_dead_letters(tx, &record)
        })?;

        log_archived(job, failed_reason);
        Ok(record)
    }

    /// Like [`DeadLetterQueue::archive`], for a job the caller claimed.
    ///
    /// The move only happens while the stored row is still that claim:
    /// `processing` with the same `created_at`. Returns `Ok(None)` and leaves
    /// both stores alone when the job was replaced or removed meanwhile.
    pub fn archive_claimed(
        &self,
        job: &Job,
        failed_reason: &str,
    ) -> Result<Option<DeadLetterRecord>> {
        let record = DeadLetterRecord::new(job, failed_reason);
        let moved = self.store.write_tx(|tx| {
            let still_claimed = get_job(tx, &job.id)?.is_some_and(|stored| {
                stored.state == JobState::Processing
                    && to_micros(stored.created_at) == to_micros(job.created_at)
            });
            if !still_claimed {
                return Ok(false);
            }
            move_to_dead_letters(tx, &record)?;
            Ok(true)
        })?;

        if !moved {
            return Ok(None);
        }
        log_archived(job, failed_reason);
        Ok(Some(record))
    }

    /// Dead-letter records, oldest job first.
    pub fn list(&self) -> Result<Vec<DeadLetterRecord>> {
        let conn = self.store.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, command, attempts, max_retries, failed_reason, created_at_us, updated_at_us \
             FROM dead_letters ORDER BY created_at_us ASC, id ASC",
        )?;
        let records = stmt
            .query_map([], record_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    pub fn get(&self, id: &str) -> Result<Option<DeadLetterRecord>> {
        let conn = self.store.conn()?;
        let record = conn
            .query_row(
                "SELECT id, command, attempts, max_retries, failed_reason, created_at_us, updated_at_us \
                 FROM dead_letters WHERE id = ?1",
                params![id],
                record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    pub fn len(&self) -> Result<u64> {
        let conn = self.store.conn()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM dead_letters", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Replay a dead job as a fresh pending job with its attempts reset.
    ///
    /// Returns `Ok(false)` when no record with `id` exists.
    pub fn requeue(&self, id: &str) -> Result<bool> {
        let requeued = self.store.write_tx(|tx| {
            let record = tx
                .query_row(
                    "SELECT id, command, attempts, max_retries, failed_reason, created_at_us, updated_at_us \
                     FROM dead_letters WHERE id = ?1",
                    params![id],
                    record_from_row,
                )
                .optional()?;
            let Some(record) = record else {
                return Ok(None);
            };

            tx.execute("DELETE FROM dead_letters WHERE id = ?1", params![id])?;
            let job = record.to_requeued_job();
            upsert_job(tx, &job)?;
            Ok(Some(job))
        })?;

        match requeued {
            Some(job) => {
                tracing::info!(job_id = %job.id, "Dead-letter job requeued");
                Ok(true)
            }
            None => {
                tracing::debug!(job_id = id, "No dead-letter record to requeue");
                Ok(false)
            }
        }
    }
}

fn move_to_dead_letters(conn: &Connection, record: &DeadLetterRecord) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO dead_letters \
         (id, command, attempts, max_retries, failed_reason, created_at_us, updated_at_us) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            record.job.id,
            record.job.command,
            record.job.attempts,
            record.job.max_retries,
            record.failed_reason,
            to_micros(record.job.created_at),
            to_micros(record.job.updated_at),
        ],
    )?;
    delete_job(conn, &record.job.id)?;
    Ok(())
}

fn log_archived(job: &Job, failed_reason: &str) {
    tracing::warn!(
        job_id = %job.id,
        attempts = job.attempts,
        reason = failed_reason,
        "Job moved to dead-letter queue"
    );
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<DeadLetterRecord> {
    Ok(DeadLetterRecord {
        job: Job {
            id: row.get(0)?,
            command: row.get(1)?,
            state: JobState::Dead,
            attempts: row.get(2)?,
            max_retries: row.get(3)?,
            created_at: from_micros(row.get(5)?),
            updated_at: from_micros(row.get(6)?),
        },
        failed_reason: row.get(4)?,
    })
}
