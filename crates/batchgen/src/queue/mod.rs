//! Item queue: where candidate rows (source image + authored prompt) come
//! from, where they are marked consumed once a job owns them, and where
//! rows the provider refused for good are parked.

pub mod jsonl;

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use jsonl::JsonlItemQueue;

/// A candidate row waiting to be generated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedItem {
    /// Identifies the row within its queue for `mark_consumed`.
    pub row_key: String,
    pub source_reference: String,
    pub prompt: String,
}

impl QueuedItem {
    pub fn new(
        row_key: impl Into<String>,
        source_reference: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            row_key: row_key.into(),
            source_reference: source_reference.into(),
            prompt: prompt.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue IO error for '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid queue row at line {line}: {reason}")]
    InvalidRow { line: usize, reason: String },

    #[error("Queue backend error: {0}")]
    Backend(String),
}

/// Source of queued items.
#[async_trait]
pub trait ItemQueue: Send + Sync {
    /// Returns up to `limit` rows in queue order without removing them.
    async fn next_batch(&self, limit: usize) -> Result<Vec<QueuedItem>, QueueError>;

    /// Marks rows consumed so they are not offered again.
    async fn mark_consumed(&self, items: &[QueuedItem]) -> Result<(), QueueError>;

    /// Moves rows the provider refused out of the queue, keeping `reason`
    /// with them. Parked rows are not offered again until an operator
    /// puts them back.
    async fn park(&self, items: &[QueuedItem], reason: &str) -> Result<(), QueueError>;
}
