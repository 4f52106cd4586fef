//! Batch job and item domain types.
//!
//! The state machine lives here as pure transitions on [`BatchJob`]; the
//! orchestrator decides *which* transition applies and the store persists
//! the result under an optimistic lock.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a batch job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Submitted,
    Running,
    Completed,
    Failed,
    PartiallyCompleted,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 7] = [
        JobStatus::Pending,
        JobStatus::Submitted,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::PartiallyCompleted,
        JobStatus::Cancelled,
    ];

    /// Statuses the polling loop advances.
    pub const POLLABLE: [JobStatus; 2] = [JobStatus::Submitted, JobStatus::Running];

    /// Statuses whose completed items are handed to the artifact sink.
    pub const DELIVERABLE: [JobStatus; 2] = [JobStatus::Completed, JobStatus::PartiallyCompleted];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Submitted => "submitted",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::PartiallyCompleted => "partially_completed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// No transition leaves a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed
                | JobStatus::Failed
                | JobStatus::PartiallyCompleted
                | JobStatus::Cancelled
        )
    }

    pub fn is_pollable(&self) -> bool {
        Self::POLLABLE.contains(self)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown job status '{}'", s))
    }
}

/// Status of a single item within a batch job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Completed,
    Failed,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Completed => "completed",
            ItemStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ItemStatus::Pending)
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ItemStatus::Pending),
            "completed" => Ok(ItemStatus::Completed),
            "failed" => Ok(ItemStatus::Failed),
            other => Err(format!("unknown item status '{}'", other)),
        }
    }
}

/// One external bulk-generation request covering several items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchJob {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_job_id: Option<String>,
    pub status: JobStatus,
    pub item_count: u32,
    /// Job-level error: submission failure, last poll error, cancel note.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
    /// Consecutive transient poll failures.
    pub poll_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_poll_at: Option<DateTime<Utc>>,
    /// Write counter; together with `status` it forms the optimistic-lock token.
    pub revision: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl BatchJob {
    /// A freshly built job, not yet handed to the provider.
    pub fn new(id: impl Into<String>, item_count: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            external_job_id: None,
            status: JobStatus::Pending,
            item_count,
            diagnostic: None,
            poll_failures: 0,
            next_poll_at: None,
            revision: 0,
            created_at: now,
            updated_at: now,
            submitted_at: None,
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether the backoff window (if any) has elapsed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_poll_at.map_or(true, |at| at <= now)
    }

    fn enter(&mut self, status: JobStatus, now: DateTime<Utc>) {
        self.status = status;
        self.updated_at = now;
        if status.is_terminal() && self.finished_at.is_none() {
            self.finished_at = Some(now);
        }
    }

    /// `pending -> submitted`.
    pub fn submitted(&self, external_job_id: &str, now: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        next.external_job_id = Some(external_job_id.to_string());
        next.submitted_at = Some(now);
        next.enter(JobStatus::Submitted, now);
        next
    }

    /// Any non-terminal status to `failed`, recording a job-level diagnostic.
    pub fn failed(&self, diagnostic: impl Into<String>, now: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        next.diagnostic = Some(diagnostic.into());
        next.next_poll_at = None;
        next.enter(JobStatus::Failed, now);
        next
    }

    /// Any non-terminal status to `cancelled`.
    ///
    /// A cancelled job carries no provider id; the id it had is kept in the
    /// diagnostic for the audit trail.
    pub fn cancelled(&self, now: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        next.diagnostic = Some(match next.external_job_id.take() {
            Some(external) => format!("cancelled by operator (provider job {})", external),
            None => "cancelled by operator".to_string(),
        });
        next.next_poll_at = None;
        next.enter(JobStatus::Cancelled, now);
        next
    }

    /// Result of a successful poll: new aggregate status, retry counter reset.
    pub fn polled(&self, status: JobStatus, now: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        next.poll_failures = 0;
        next.next_poll_at = None;
        next.diagnostic = None;
        next.enter(status, now);
        next
    }

    /// Transient poll failure within the retry budget: status unchanged.
    pub fn poll_deferred(
        &self,
        error: impl Into<String>,
        next_poll_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut next = self.clone();
        next.poll_failures = self.poll_failures.saturating_add(1);
        next.next_poll_at = Some(next_poll_at);
        next.diagnostic = Some(error.into());
        next.updated_at = now;
        next
    }

    /// Transient poll failure that uses up the retry budget: `failed` with
    /// the last error as diagnostic.
    pub fn poll_exhausted(&self, error: impl Into<String>, now: DateTime<Utc>) -> Self {
        let mut next = self.failed(error, now);
        next.poll_failures = self.poll_failures.saturating_add(1);
        next
    }
}

/// One unit of work (single image + prompt) within a batch job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchJobItem {
    pub id: String,
    pub job_id: String,
    pub position: u32,
    pub source_reference: String,
    pub prompt: String,
    pub status: ItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_reference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    /// Set once a failed item has been reported to operators.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub surfaced_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl BatchJobItem {
    /// A new pending item at `position` within job `job_id`.
    pub fn new(
        id: impl Into<String>,
        job_id: impl Into<String>,
        position: u32,
        source_reference: impl Into<String>,
        prompt: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            job_id: job_id.into(),
            position,
            source_reference: source_reference.into(),
            prompt: prompt.into(),
            status: ItemStatus::Pending,
            artifact_reference: None,
            error_detail: None,
            delivered_at: None,
            surfaced_at: None,
            updated_at: now,
        }
    }

    pub fn is_delivered(&self) -> bool {
        self.delivered_at.is_some()
    }
}

/// Terminal result for one item, as applied by a poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemResolution {
    Completed { artifact_reference: String },
    Failed { error_detail: String },
}

impl ItemResolution {
    pub fn status(&self) -> ItemStatus {
        match self {
            ItemResolution::Completed { .. } => ItemStatus::Completed,
            ItemResolution::Failed { .. } => ItemStatus::Failed,
        }
    }
}

/// An item update keyed by item identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemUpdate {
    pub item_id: String,
    pub resolution: ItemResolution,
}

/// Aggregates item statuses into a job status.
///
/// Returns `None` while any item is still pending, or when there are no
/// items at all: the job keeps running.
pub fn aggregate_status<I>(statuses: I) -> Option<JobStatus>
where
    I: IntoIterator<Item = ItemStatus>,
{
    let mut completed = 0usize;
    let mut failed = 0usize;

    for status in statuses {
        match status {
            ItemStatus::Pending => return None,
            ItemStatus::Completed => completed += 1,
            ItemStatus::Failed => failed += 1,
        }
    }

    match (completed, failed) {
        (0, 0) => None,
        (_, 0) => Some(JobStatus::Completed),
        (0, _) => Some(JobStatus::Failed),
        _ => Some(JobStatus::PartiallyCompleted),
    }
}
