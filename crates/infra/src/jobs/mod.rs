//! Durable job storage.

pub mod queue;
pub mod types;

pub use queue::JobQueue;
pub use types::{Job, JobQueueError, JobStats, JobStatus, JobUpdate};
