use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigStore, EngineConfig};
use crate::error::{QueueError, Result};
use crate::scheduler::{
    DeadLetterQueue, DeadLetterRecord, Job, JobQueue, JobState, JobSubmission,
};
use crate::store::Store;
use crate::worker::heartbeat;
use crate::worker::{CommandRunner, ShellRunner, WorkerPool};

/// Job counts per state plus workers across all live pools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSummary {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub dead: u64,
    pub active_workers: u64,
}

impl StatusSummary {
    pub fn count(&self, state: JobState) -> u64 {
        match state {
            JobState::Pending => self.pending,
            JobState::Processing => self.processing,
            JobState::Completed => self.completed,
            JobState::Failed => self.failed,
            JobState::Dead => self.dead,
        }
    }
}

/// Entry point for front ends: submission, inspection, dead-letter replay
/// and worker pool control over one store.
pub struct JobEngine<R: CommandRunner = ShellRunner> {
    config: EngineConfig,
    store: Arc<Store>,
    queue: JobQueue,
    dead_letters: DeadLetterQueue,
    settings: ConfigStore,
    runner: Arc<R>,
    pool: Option<WorkerPool>,
}

impl JobEngine<ShellRunner> {
    /// Open the database at `config.db_path` and run jobs through `sh -c`.
    pub fn open(config: EngineConfig) -> Result<Self> {
        Self::with_runner(config, ShellRunner::default())
    }
}

impl<R: CommandRunner> JobEngine<R> {
    pub fn with_runner(config: EngineConfig, runner: R) -> Result<Self> {
        let store = Arc::new(Store::open(&config.db_path)?);
        Ok(Self::from_store(config, store, runner))
    }

    pub fn from_store(config: EngineConfig, store: Arc<Store>, runner: R) -> Self {
        Self {
            queue: JobQueue::new(store.clone()),
            dead_letters: DeadLetterQueue::new(store.clone()),
            settings: ConfigStore::new(store.clone()),
            runner: Arc::new(runner),
            store,
            config,
            pool: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn dead_letters(&self) -> &DeadLetterQueue {
        &self.dead_letters
    }

    pub fn settings(&self) -> &ConfigStore {
        &self.settings
    }

    /// Enqueue a new pending job. An existing job with the same id is
    /// replaced without warning.
    pub fn submit(&self, id: &str, command: &str, max_retries: Option<u32>) -> Result<Job> {
        let max_retries = max_retries.unwrap_or(self.config.default_max_retries);
        let job = Job::new(id, command, max_retries)?;
        self.queue.enqueue(&job)?;
        tracing::info!(job_id = %job.id, max_retries, "Job submitted");
        Ok(job)
    }

    /// Enqueue a job from a JSON payload such as `{"id":"j1","command":"echo hi"}`.
    pub fn submit_json(&self, raw: &str) -> Result<Job> {
        let job = JobSubmission::from_json(raw)?.into_job(self.config.default_max_retries)?;
        self.queue.enqueue(&job)?;
        tracing::info!(job_id = %job.id, max_retries = job.max_retries, "Job submitted");
        Ok(job)
    }

    /// Jobs in `state`, oldest first. Dead jobs come from the dead-letter queue.
    pub fn list(&self, state: JobState) -> Result<Vec<Job>> {
        match state {
            JobState::Dead => Ok(self
                .dead_letters
                .list()?
                .into_iter()
                .map(|record| record.job)
                .collect()),
            state => self.queue.list_by_state(state),
        }
    }

    pub fn dead_letter_list(&self) -> Result<Vec<DeadLetterRecord>> {
        self.dead_letters.list()
    }

    /// Replay a dead job. Returns false if `id` isn't in the dead-letter queue.
    pub fn dead_letter_requeue(&self, id: &str) -> Result<bool> {
        self.dead_letters.requeue(id)
    }

    pub fn start_pool(&mut self, count: usize) -> Result<()> {
        self.start_pool_with_token(count, CancellationToken::new())
    }

    /// Start `count` workers that stop when `token` is cancelled. A previous
    /// pool must be stopped with [`JobEngine::stop_pool`] first.
    pub fn start_pool_with_token(&mut self, count: usize, token: CancellationToken) -> Result<()> {
        if self.pool.is_some() {
            return Err(QueueError::PoolAlreadyRunning);
        }

        let pool = WorkerPool::start(
            count,
            self.store.clone(),
            self.runner.clone(),
            &self.config,
            token,
        )?;
        self.pool = Some(pool);
        Ok(())
    }

    /// Stop the pool and wait for in-flight jobs. No-op without a pool.
    pub async fn stop_pool(&mut self) -> Result<()> {
        match self.pool.take() {
            Some(pool) => pool.stop().await,
            None => Ok(()),
        }
    }

    /// Workers of this engine's pool that are still running.
    pub fn active_worker_count(&self) -> usize {
        self.pool
            .as_ref()
            .map(WorkerPool::active_worker_count)
            .unwrap_or(0)
    }

    /// Ask every live pool registered in the store, in any process, to stop.
    pub fn request_stop(&self) -> Result<usize> {
        heartbeat::request_stop_all(&self.store, self.config.pool_liveness_timeout)
    }

    pub fn status(&self) -> Result<StatusSummary> {
        Ok(StatusSummary {
            pending: self.queue.count_by_state(JobState::Pending)?,
            processing: self.queue.count_by_state(JobState::Processing)?,
            completed: self.queue.count_by_state(JobState::Completed)?,
            failed: self.queue.count_by_state(JobState::Failed)?,
            dead: self.dead_letters.len()?,
            active_workers: heartbeat::active_workers(
                &self.store,
                self.config.pool_liveness_timeout,
            )?,
        })
    }
}
