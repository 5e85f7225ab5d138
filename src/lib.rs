pub mod config;
pub mod engine;
pub mod error;
pub mod scheduler;
pub mod shutdown;
pub mod store;
pub mod worker;

pub use engine::{JobEngine, StatusSummary};
pub use error::{QueueError, Result};
