use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{QueueError, Result};

pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    /// Failed with retries left, waiting out its backoff. Not terminal.
    Failed,
    Dead,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Pending,
        JobState::Processing,
        JobState::Completed,
        JobState::Failed,
        JobState::Dead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Dead => "dead",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(JobState::Pending),
            "processing" => Ok(JobState::Processing),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "dead" => Ok(JobState::Dead),
            other => Err(QueueError::InvalidState(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub command: String,
    pub state: JobState,
    pub attempts: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a pending job with no attempts. Rejects blank ids and commands.
    pub fn new(
        id: impl Into<String>,
        command: impl Into<String>,
        max_retries: u32,
    ) -> Result<Self> {
        let id = id.into();
        let command = command.into();
        if id.trim().is_empty() {
            return Err(QueueError::InvalidInput("job id must not be empty".to_string()));
        }
        if command.trim().is_empty() {
            return Err(QueueError::InvalidInput(
                "job command must not be empty".to_string(),
            ));
        }

        let created_at = now();
        Ok(Self {
            id,
            command,
            state: JobState::Pending,
            attempts: 0,
            max_retries,
            created_at,
            updated_at: created_at,
        })
    }

    pub fn transition(&self, new_state: JobState) -> Job {
        Job {
            state: new_state,
            updated_at: self.touch(),
            ..self.clone()
        }
    }

    pub fn record_attempt(&self) -> Job {
        Job {
            attempts: self.attempts.saturating_add(1),
            updated_at: self.touch(),
            ..self.clone()
        }
    }

    pub fn has_retries_left(&self) -> bool {
        self.attempts < self.max_retries
    }

    // updated_at never goes behind created_at, even if the wall clock steps back.
    fn touch(&self) -> DateTime<Utc> {
        now().max(self.created_at)
    }
}

// Microsecond precision, the same as the store keeps.
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// A job that ran out of retries, kept for inspection or manual replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    #[serde(flatten)]
    pub job: Job,
    pub failed_reason: String,
}

impl DeadLetterRecord {
    pub fn new(job: &Job, failed_reason: impl Into<String>) -> Self {
        Self {
            job: job.transition(JobState::Dead),
            failed_reason: failed_reason.into(),
        }
    }

    /// Fresh pending job carrying the original identity, with attempts reset.
    pub fn to_requeued_job(&self) -> Job {
        Job {
            id: self.job.id.clone(),
            command: self.job.command.clone(),
            state: JobState::Pending,
            attempts: 0,
            max_retries: self.job.max_retries,
            created_at: self.job.created_at,
            updated_at: now().max(self.job.created_at),
        }
    }
}

/// Job payload as accepted from callers, e.g. `{"id":"j1","command":"echo hi"}`.
#[derive(Debug, Clone, Deserialize)]
pub struct JobSubmission {
    pub id: String,
    pub command: String,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl JobSubmission {
    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Build the pending job, using `default_max_retries` when the payload
    /// doesn't set one.
    pub fn into_job(self, default_max_retries: u32) -> Result<Job> {
        Job::new(
            self.id,
            self.command,
            self.max_retries.unwrap_or(default_max_retries),
        )
    }
}
