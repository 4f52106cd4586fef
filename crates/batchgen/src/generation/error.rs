//! Generation client error types.

use thiserror::Error;

/// A batch could not be handed to the provider. Terminal for that job.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmissionError {
    /// The request never got a response (connect failure, timeout).
    #[error("Submission request failed: {0}")]
    Request(String),

    /// The provider answered with a non-success status.
    #[error("Provider rejected batch (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },

    /// The provider answered but the payload was unusable.
    #[error("Invalid submission response: {0}")]
    InvalidResponse(String),

    /// One item's source image cannot be used. Nothing was submitted.
    #[error("Source of item {item_id} is unusable: {reason}")]
    InvalidSource { item_id: String, reason: String },
}

impl SubmissionError {
    /// Whether submitting the same rows again can succeed.
    ///
    /// Connection failures, 429 and 5xx are retryable. Any other rejection
    /// will repeat for the same input.
    pub fn is_retryable(&self) -> bool {
        match self {
            SubmissionError::Request(_) => true,
            SubmissionError::Rejected { status, .. } => *status == 429 || *status >= 500,
            SubmissionError::InvalidResponse(_) | SubmissionError::InvalidSource { .. } => false,
        }
    }
}

/// A status fetch failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PollError {
    /// Worth retrying after a backoff (network, timeout, 429, 5xx).
    #[error("{0}")]
    Transient(String),

    /// Retrying cannot help (unknown job, bad credentials, malformed payload).
    #[error("{0}")]
    Permanent(String),
}

impl PollError {
    pub fn is_transient(&self) -> bool {
        matches!(self, PollError::Transient(_))
    }
}
