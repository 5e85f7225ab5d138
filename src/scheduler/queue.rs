use std::sync::Arc;

use chrono::Utc;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{QueueError, Result};
use crate::scheduler::job::{Job, JobState};
use crate::store::{from_micros, to_micros, Store};

/// Durable queue of live jobs.
///
/// Holds pending, processing, completed and failed jobs. Dead jobs never live
/// here; they are moved to the dead-letter queue instead.
#[derive(Debug, Clone)]
pub struct JobQueue {
    store: Arc<Store>,
}

impl JobQueue {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Insert a job, replacing any existing row with the same id.
    pub fn enqueue(&self, job: &Job) -> Result<()> {
        reject_dead(job.state)?;
        let conn = self.store.conn()?;
        upsert_job(&conn, job)?;
        tracing::debug!(job_id = %job.id, state = %job.state, "Job enqueued");
        Ok(())
    }

    /// Atomically take the oldest pending job and mark it processing.
    ///
    /// Pending jobs are ordered by `created_at`, then `id`. The select and the
    /// conditional update share one immediate transaction, so concurrent
    /// callers (threads or processes) never receive the same job.
    pub fn claim_next(&self) -> Result<Option<Job>> {
        self.store.write_tx(|tx| {
            let next = tx
                .query_row(
                    "SELECT id, command, state, attempts, max_retries, created_at_us, updated_at_us \
                     FROM jobs WHERE state = 'pending' \
                     ORDER BY created_at_us ASC, id ASC LIMIT 1",
                    [],
                    job_from_row,
                )
                .optional()?;
            let Some(job) = next else {
                return Ok(None);
            };

            let claimed = job.transition(JobState::Processing);
            let changed = tx.execute(
                "UPDATE jobs SET state = 'processing', updated_at_us = ?2 \
                 WHERE id = ?1 AND state = 'pending'",
                params![claimed.id, to_micros(claimed.updated_at)],
            )?;
            if changed != 1 {
                tracing::warn!(job_id = %claimed.id, "Pending job changed under claim");
                return Ok(None);
            }
            Ok(Some(claimed))
        })
    }

    /// Set the state (and optionally the attempt count) of an existing job.
    ///
    /// Attempts are never lowered: the stored value becomes the larger of the
    /// current and the given count.
    pub fn update_state(&self, id: &str, new_state: JobState, attempts: Option<u32>) -> Result<()> {
        reject_dead(new_state)?;
        let conn = self.store.conn()?;
        let changed = conn.execute(
            "UPDATE jobs SET state = ?2, \
                 attempts = MAX(attempts, COALESCE(?3, attempts)), \
                 updated_at_us = MAX(?4, created_at_us) \
             WHERE id = ?1",
            params![id, new_state.as_str(), attempts, to_micros(Utc::now())],
        )?;
        if changed == 0 {
            return Err(QueueError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Record a worker's result for a job it claimed.
    ///
    /// Only applies while the row is still the claimed one: `processing`
    /// with the claimed job's `created_at`. Returns false when the job was
    /// replaced or removed while it ran, leaving the newer row untouched.
    pub fn update_claimed(
        &self,
        claimed: &Job,
        new_state: JobState,
        attempts: Option<u32>,
    ) -> Result<bool> {
        reject_dead(new_state)?;
        let conn = self.store.conn()?;
        let changed = conn.execute(
            "UPDATE jobs SET state = ?2, \
                 attempts = MAX(attempts, COALESCE(?3, attempts)), \
                 updated_at_us = MAX(?4, created_at_us) \
             WHERE id = ?1 AND state = 'processing' AND created_at_us = ?5",
            params![
                claimed.id,
                new_state.as_str(),
                attempts,
                to_micros(Utc::now()),
                to_micros(claimed.created_at)
            ],
        )?;
        Ok(changed == 1)
    }

    /// Move a job whose backoff has elapsed back to pending.
    ///
    /// Returns false if the job is gone or is no longer the same `failed`
    /// job, e.g. because it was re-submitted while its worker was sleeping.
    pub fn promote_failed(&self, job: &Job) -> Result<bool> {
        let conn = self.store.conn()?;
        let changed = conn.execute(
            "UPDATE jobs SET state = 'pending', updated_at_us = MAX(?2, created_at_us) \
             WHERE id = ?1 AND state = 'failed' AND created_at_us = ?3",
            params![job.id, to_micros(Utc::now()), to_micros(job.created_at)],
        )?;
        Ok(changed == 1)
    }

    pub fn get(&self, id: &str) -> Result<Option<Job>> {
        let conn = self.store.conn()?;
        Ok(get_job(&conn, id)?)
    }

    /// Jobs in `state`, oldest first. For inspection only; workers claim
    /// through [`JobQueue::claim_next`].
    pub fn list_by_state(&self, state: JobState) -> Result<Vec<Job>> {
        let conn = self.store.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, command, state, attempts, max_retries, created_at_us, updated_at_us \
             FROM jobs WHERE state = ?1 ORDER BY created_at_us ASC, id ASC",
        )?;
        let jobs = stmt
            .query_map(params![state.as_str()], job_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    pub fn count_by_state(&self, state: JobState) -> Result<u64> {
        let conn = self.store.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE state = ?1",
            params![state.as_str()],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        let conn = self.store.conn()?;
        if delete_job(&conn, id)? {
            Ok(())
        } else {
            Err(QueueError::NotFound(id.to_string()))
        }
    }
}

fn reject_dead(state: JobState) -> Result<()> {
    if state == JobState::Dead {
        return Err(QueueError::InvalidState(
            "dead jobs belong in the dead-letter queue".to_string(),
        ));
    }
    Ok(())
}

pub(crate) fn upsert_job(conn: &Connection, job: &Job) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO jobs \
         (id, command, state, attempts, max_retries, created_at_us, updated_at_us) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            job.id,
            job.command,
            job.state.as_str(),
            job.attempts,
            job.max_retries,
            to_micros(job.created_at),
            to_micros(job.updated_at),
        ],
    )?;
    Ok(())
}

pub(crate) fn get_job(conn: &Connection, id: &str) -> rusqlite::Result<Option<Job>> {
    conn.query_row(
        "SELECT id, command, state, attempts, max_retries, created_at_us, updated_at_us \
         FROM jobs WHERE id = ?1",
        params![id],
        job_from_row,
    )
    .optional()
}

pub(crate) fn delete_job(conn: &Connection, id: &str) -> rusqlite::Result<bool> {
    Ok(conn.execute("DELETE FROM jobs WHERE id = ?1", params![id])? == 1)
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    let state: String = row.get(2)?;
    let state = state
        .parse::<JobState>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;
    Ok(Job {
        id: row.get(0)?,
        command: row.get(1)?,
        state,
        attempts: row.get(3)?,
        max_retries: row.get(4)?,
        created_at: from_micros(row.get(5)?),
        updated_at: from_micros(row.get(6)?),
    })
}
