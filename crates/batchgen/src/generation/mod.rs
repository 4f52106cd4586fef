//! Generation client: the provider-facing side of a batch job.
//!
//! A client submits an ordered batch and later reports the batch's status
//! with per-item outcomes keyed by item identity (providers may reorder
//! results). Anything a client has to clean up after a batch finishes is
//! handled in `release`.

pub mod error;
pub mod gemini;

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;

pub use error::{PollError, SubmissionError};
pub use gemini::GeminiClient;

/// One request in a batch submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmitItem {
    /// Local item id; echoed back with the item's outcome.
    pub item_id: String,
    pub prompt: String,
    pub source_reference: String,
}

/// Batch-level status as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    Expired,
}

impl ProviderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderStatus::Pending => "pending",
            ProviderStatus::Running => "running",
            ProviderStatus::Succeeded => "succeeded",
            ProviderStatus::Failed => "failed",
            ProviderStatus::Cancelled => "cancelled",
            ProviderStatus::Expired => "expired",
        }
    }

    /// The provider will not produce further output for this batch.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProviderStatus::Succeeded
                | ProviderStatus::Failed
                | ProviderStatus::Cancelled
                | ProviderStatus::Expired
        )
    }
}

impl fmt::Display for ProviderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single item in a poll response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Completed { artifact_reference: String },
    Failed { error_detail: String },
    Pending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemResult {
    pub item_id: String,
    pub outcome: ItemOutcome,
}

impl ItemResult {
    pub fn completed(item_id: impl Into<String>, artifact_reference: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            outcome: ItemOutcome::Completed {
                artifact_reference: artifact_reference.into(),
            },
        }
    }

    pub fn failed(item_id: impl Into<String>, error_detail: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            outcome: ItemOutcome::Failed {
                error_detail: error_detail.into(),
            },
        }
    }

    pub fn pending(item_id: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            outcome: ItemOutcome::Pending,
        }
    }
}

/// Everything one poll learned about a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollResponse {
    pub provider_status: ProviderStatus,
    pub items: Vec<ItemResult>,
}

/// A bulk image-generation provider.
#[async_trait]
pub trait GenerationClient: Send + Sync {
    /// Submits an ordered batch and returns the provider's job identifier.
    async fn submit(&self, items: &[SubmitItem]) -> Result<String, SubmissionError>;

    /// Fetches the status and any per-item outcomes of a submitted batch.
    async fn poll(&self, external_job_id: &str) -> Result<PollResponse, PollError>;

    /// Frees provider-side resources held for a batch that will not be
    /// polled again. Best effort; failures are logged, not returned.
    async fn release(&self, _external_job_id: &str) {}
}
