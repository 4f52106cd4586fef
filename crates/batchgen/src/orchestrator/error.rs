//! Orchestrator error types.

use thiserror::Error;

use crate::db::DatabaseError;
use crate::job::JobStatus;
use crate::queue::QueueError;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Cannot submit an empty batch")]
    EmptyBatch,

    #[error("Batch of {size} items exceeds max_batch_size ({max})")]
    BatchTooLarge { size: usize, max: usize },

    #[error("Job '{0}' not found")]
    NotFound(String),

    #[error("Job '{job_id}' is already {status}")]
    AlreadyTerminal { job_id: String, status: JobStatus },

    #[error("Job '{0}' kept changing concurrently")]
    Conflict(String),

    /// Storage failed after the store's own retries.
    #[error("Persistence error: {0}")]
    Persistence(#[from] DatabaseError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}
