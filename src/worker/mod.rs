//! Worker execution engine for running jobs.
//!
//! - **Execution**: [`CommandRunner`] runs a job's command; [`ShellRunner`]
//!   spawns `sh -c <command>` and captures its output
//! - **Pool**: [`WorkerPool`] runs N independent [`Worker`] loops sharing one store
//! - **Heartbeat**: each pool registers itself in the store so other processes
//!   can count active workers and request a stop
//!
//! # Execution Flow
//!
//! 1. An idle worker claims the oldest pending job, or sleeps one poll interval
//! 2. The runner executes the command; exit code 0 is success
//! 3. Success marks the job completed
//! 4. Failure records an attempt and consults the [`BackoffPolicy`](crate::scheduler::BackoffPolicy):
//!    either the job is marked failed, the worker sleeps out the backoff and
//!    promotes it back to pending, or the job is moved to the dead-letter queue
//!
//! # Security Note
//!
//! Commands run directly through the shell with the worker's privileges.

pub mod executor;
pub mod heartbeat;
pub mod pool;

pub use executor::{CommandRunner, ExecutionResult, ShellRunner};
pub use pool::{JobOutcome, Worker, WorkerPool};
