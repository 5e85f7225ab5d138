use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigStore, EngineConfig};
use crate::error::{QueueError, Result};
use crate::scheduler::backoff::{delay_millis, BackoffPolicy, RetryDecision};
use crate::scheduler::dead_letter::{DeadLetterQueue, MAX_RETRIES_EXCEEDED};
use crate::scheduler::{Job, JobQueue, JobState};
use crate::store::{blocking, Store};
use crate::worker::executor::CommandRunner;
use crate::worker::heartbeat::{HeartbeatSender, PoolRegistration};

/// What a worker did with the job it claimed.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed { job_id: String },
    Retried { job_id: String, attempts: u32, delay: Duration },
    DeadLettered { job_id: String, attempts: u32 },
    /// The job was re-submitted or removed while this worker ran it. The
    /// worker's result was dropped and the newer row left as it was.
    Superseded { job_id: String },
}

/// A single execution loop.
///
/// Per iteration: claim the oldest pending job, run it, then complete it,
/// schedule a retry, or dead-letter it.
pub struct Worker<R> {
    id: usize,
    queue: JobQueue,
    dead_letters: DeadLetterQueue,
    config: ConfigStore,
    runner: Arc<R>,
    poll_interval: Duration,
    backoff_unit: Duration,
}

impl<R: CommandRunner> Worker<R> {
    pub fn new(id: usize, store: Arc<Store>, runner: Arc<R>, config: &EngineConfig) -> Self {
        Self {
            id,
            queue: JobQueue::new(store.clone()),
            dead_letters: DeadLetterQueue::new(store.clone()),
            config: ConfigStore::new(store),
            runner,
            poll_interval: config.poll_interval,
            backoff_unit: config.backoff_unit,
        }
    }

    /// Loop until `token` is cancelled.
    ///
    /// Cancellation is only observed between jobs: an in-flight command or
    /// backoff sleep always runs to completion first.
    pub async fn run(self, token: CancellationToken) {
        tracing::info!(worker_id = self.id, "Worker started");

        while !token.is_cancelled() {
            match self.run_once().await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(worker_id = self.id, error = %e, "Claim failed, backing off");
                }
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        tracing::info!(worker_id = self.id, "Worker exiting gracefully");
    }

    /// Claim and fully process one job. `Ok(None)` if nothing was pending.
    ///
    /// Only a failed claim is returned as an error. Store errors after the
    /// claim are logged and the job is left as it was.
    pub async fn run_once(&self) -> Result<Option<JobOutcome>> {
        let queue = self.queue.clone();
        let Some(job) = blocking(move || queue.claim_next()).await? else {
            return Ok(None);
        };
        Ok(Some(self.process(job).await))
    }

    async fn process(&self, job: Job) -> JobOutcome {
        tracing::info!(
            worker_id = self.id,
            job_id = %job.id,
            command = %job.command,
            attempts = job.attempts,
            "Processing job"
        );

        let failure = match self.runner.execute(&job.command).await {
            Ok(result) if result.success() => None,
            Ok(result) => Some(result.failure_reason()),
            Err(e) => Some(e.to_string()),
        };

        match failure {
            None => self.complete(job).await,
            Some(reason) => self.fail(job, &reason).await,
        }
    }

    async fn complete(&self, job: Job) -> JobOutcome {
        match self.record(&job, JobState::Completed, None).await {
            Ok(true) => {
                tracing::info!(worker_id = self.id, job_id = %job.id, "Job completed");
            }
            Ok(false) => return self.superseded(job),
            Err(e) => log_lost_update(self.id, &job.id, &e),
        }
        JobOutcome::Completed { job_id: job.id }
    }

    async fn fail(&self, job: Job, reason: &str) -> JobOutcome {
        let job = job.record_attempt();
        let config = self.config.clone();
        let unit = self.backoff_unit;
        let policy = match blocking(move || config.backoff_policy(unit)).await {
            Ok(policy) => policy,
            Err(e) => {
                tracing::warn!(error = %e, "Could not read backoff config, using default");
                BackoffPolicy::from_config_value(None, self.backoff_unit)
            }
        };

        match policy.decide(&job) {
            RetryDecision::Retry(delay) => {
                tracing::warn!(
                    worker_id = self.id,
                    job_id = %job.id,
                    attempts = job.attempts,
                    delay_ms = delay_millis(delay),
                    reason,
                    "Job failed, will retry"
                );
                match self
                    .record(&job, JobState::Failed, Some(job.attempts))
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => return self.superseded(job),
                    Err(e) => {
                        log_lost_update(self.id, &job.id, &e);
                        return JobOutcome::Retried {
                            job_id: job.id,
                            attempts: job.attempts,
                            delay: Duration::ZERO,
                        };
                    }
                }

                tokio::time::sleep(delay).await;

                let queue = self.queue.clone();
                let failed = job.clone();
                match blocking(move || queue.promote_failed(&failed)).await {
                    Ok(promoted) => tracing::debug!(
                        worker_id = self.id,
                        job_id = %job.id,
                        promoted,
                        "Backoff elapsed"
                    ),
                    Err(e) => log_lost_update(self.id, &job.id, &e),
                }
                JobOutcome::Retried {
                    job_id: job.id,
                    attempts: job.attempts,
                    delay,
                }
            }
            RetryDecision::DeadLetter => {
                tracing::warn!(
                    worker_id = self.id,
                    job_id = %job.id,
                    attempts = job.attempts,
                    reason,
                    "Job failed, retries exhausted"
                );
                let dead_letters = self.dead_letters.clone();
                let exhausted = job.clone();
                let archived = blocking(move || {
                    dead_letters.archive_claimed(&exhausted, MAX_RETRIES_EXCEEDED)
                })
                .await;
                match archived {
                    Ok(Some(_)) => {}
                    Ok(None) => return self.superseded(job),
                    Err(e) => log_lost_update(self.id, &job.id, &e),
                }
                JobOutcome::DeadLettered {
                    job_id: job.id,
                    attempts: job.attempts,
                }
            }
        }
    }

    /// Write this worker's result for `job`, if the row is still its claim.
    async fn record(&self, job: &Job, state: JobState, attempts: Option<u32>) -> Result<bool> {
        let queue = self.queue.clone();
        let claimed = job.clone();
        blocking(move || queue.update_claimed(&claimed, state, attempts)).await
    }

    fn superseded(&self, job: Job) -> JobOutcome {
        tracing::warn!(
            worker_id = self.id,
            job_id = %job.id,
            "Job was replaced while running, result discarded"
        );
        JobOutcome::Superseded { job_id: job.id }
    }
}

fn log_lost_update(worker_id: usize, job_id: &str, error: &QueueError) {
    tracing::error!(worker_id, job_id, error = %error, "Failed to record job result");
}

/// A fixed set of workers sharing one store and one cancellation token.
pub struct WorkerPool {
    token: CancellationToken,
    workers: Vec<JoinHandle<()>>,
    heartbeat: JoinHandle<()>,
    registration: Arc<PoolRegistration>,
}

impl WorkerPool {
    /// Spawn `count` workers onto the current tokio runtime.
    ///
    /// Cancelling `token` (directly, through [`WorkerPool::stop`], or via a
    /// persisted stop request) makes every worker exit at its next idle point.
    pub fn start<R: CommandRunner>(
        count: usize,
        store: Arc<Store>,
        runner: Arc<R>,
        config: &EngineConfig,
        token: CancellationToken,
    ) -> Result<Self> {
        if count == 0 {
            return Err(QueueError::InvalidInput(
                "worker count must be at least 1".to_string(),
            ));
        }

        let registration = Arc::new(PoolRegistration::register(store.clone(), count)?);

        let heartbeat = {
            let registration = registration.clone();
            let token = token.clone();
            let sender = HeartbeatSender::new(config.heartbeat_interval);
            tokio::spawn(async move {
                sender.run(registration, token).await;
            })
        };

        let workers = (1..=count)
            .map(|id| {
                let worker = Worker::new(id, store.clone(), runner.clone(), config);
                tokio::spawn(worker.run(token.clone()))
            })
            .collect();

        tracing::info!(pool_id = %registration.id(), count, "Worker pool started");
        Ok(Self {
            token,
            workers,
            heartbeat,
            registration,
        })
    }

    /// Workers whose loop has not exited yet.
    pub fn active_worker_count(&self) -> usize {
        self.workers.iter().filter(|h| !h.is_finished()).count()
    }

    /// Request a stop and wait for every worker to finish its current job.
    pub async fn stop(self) -> Result<()> {
        self.token.cancel();

        for handle in self.workers {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Worker task panicked");
            }
        }
        if let Err(e) = self.heartbeat.await {
            tracing::error!(error = %e, "Heartbeat task panicked");
        }

        self.registration.deregister()?;
        tracing::info!(pool_id = %self.registration.id(), "All workers stopped");
        Ok(())
    }
}
