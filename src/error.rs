use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid job state: {0}")]
    InvalidState(String),

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Execution failed: {0}")]
    ExecutionFailure(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(#[from] rusqlite::Error),

    #[error("Store connection poisoned")]
    StorePoisoned,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed job payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Worker pool already running")]
    PoolAlreadyRunning,

    #[error("Blocking store task failed: {0}")]
    BlockingTask(String),
}

pub type Result<T> = std::result::Result<T, QueueError>;
