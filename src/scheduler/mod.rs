pub mod backoff;
pub mod dead_letter;
pub mod job;
pub mod queue;

pub use backoff::{BackoffPolicy, RetryDecision};
pub use dead_letter::DeadLetterQueue;
pub use job::{DeadLetterRecord, Job, JobState, JobSubmission};
pub use queue::JobQueue;
