//! Job store: typed persistence of batch jobs and their items.
//!
//! Wraps the raw `job_repo` rows with domain conversions and a bounded
//! retry for transient storage failures. This is the only writer of the
//! `batch_jobs` and `batch_job_items` tables.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::db::job_repo::{self, Expected, ItemResultRow, ItemRow, JobFilter, JobRow};
use crate::db::{Database, DatabaseError};
use crate::job::{BatchJob, BatchJobItem, ItemResolution, ItemStatus, ItemUpdate, JobStatus};

// ─── Helpers ────────────────────────────────────────────────────────────────

fn parse_timestamp(s: &str, column: &'static str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DatabaseError::InvalidValue {
            column,
            reason: format!("'{}': {}", s, e),
        })
}

fn parse_optional_timestamp(
    s: Option<&str>,
    column: &'static str,
) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    s.map(|s| parse_timestamp(s, column)).transpose()
}

fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_count(value: i64, column: &'static str) -> Result<u32, DatabaseError> {
    u32::try_from(value).map_err(|_| DatabaseError::InvalidValue {
        column,
        reason: format!("{} is out of range", value),
    })
}

fn job_from_row(row: JobRow) -> Result<BatchJob, DatabaseError> {
    let status = row
        .status
        .parse::<JobStatus>()
        .map_err(|reason| DatabaseError::InvalidValue {
            column: "batch_jobs.status",
            reason,
        })?;

    Ok(BatchJob {
        status,
        item_count: parse_count(row.item_count, "batch_jobs.item_count")?,
        poll_failures: parse_count(row.poll_failures, "batch_jobs.poll_failures")?,
        next_poll_at: parse_optional_timestamp(
            row.next_poll_at.as_deref(),
            "batch_jobs.next_poll_at",
        )?,
        created_at: parse_timestamp(&row.created_at, "batch_jobs.created_at")?,
        updated_at: parse_timestamp(&row.updated_at, "batch_jobs.updated_at")?,
        submitted_at: parse_optional_timestamp(
            row.submitted_at.as_deref(),
            "batch_jobs.submitted_at",
        )?,
        finished_at: parse_optional_timestamp(
            row.finished_at.as_deref(),
            "batch_jobs.finished_at",
        )?,
        id: row.id,
        external_job_id: row.external_job_id,
        diagnostic: row.diagnostic,
        revision: row.revision,
    })
}

fn job_to_row(job: &BatchJob) -> JobRow {
    JobRow {
        id: job.id.clone(),
        external_job_id: job.external_job_id.clone(),
        status: job.status.as_str().to_string(),
        item_count: i64::from(job.item_count),
        diagnostic: job.diagnostic.clone(),
        poll_failures: i64::from(job.poll_failures),
        next_poll_at: job.next_poll_at.map(format_timestamp),
        revision: job.revision,
        created_at: format_timestamp(job.created_at),
        updated_at: format_timestamp(job.updated_at),
        submitted_at: job.submitted_at.map(format_timestamp),
        finished_at: job.finished_at.map(format_timestamp),
    }
}

fn item_from_row(row: ItemRow) -> Result<BatchJobItem, DatabaseError> {
    let status = row
        .status
        .parse::<ItemStatus>()
        .map_err(|reason| DatabaseError::InvalidValue {
            column: "batch_job_items.status",
            reason,
        })?;

    Ok(BatchJobItem {
        status,
        position: parse_count(row.position, "batch_job_items.position")?,
        delivered_at: parse_optional_timestamp(
            row.delivered_at.as_deref(),
            "batch_job_items.delivered_at",
        )?,
        surfaced_at: parse_optional_timestamp(
            row.surfaced_at.as_deref(),
            "batch_job_items.surfaced_at",
        )?,
        updated_at: parse_timestamp(&row.updated_at, "batch_job_items.updated_at")?,
        id: row.id,
        job_id: row.job_id,
        source_reference: row.source_reference,
        prompt: row.prompt,
        artifact_reference: row.artifact_reference,
        error_detail: row.error_detail,
    })
}

fn item_to_row(item: &BatchJobItem) -> ItemRow {
    ItemRow {
        id: item.id.clone(),
        job_id: item.job_id.clone(),
        position: i64::from(item.position),
        source_reference: item.source_reference.clone(),
        prompt: item.prompt.clone(),
        status: item.status.as_str().to_string(),
        artifact_reference: item.artifact_reference.clone(),
        error_detail: item.error_detail.clone(),
        delivered_at: item.delivered_at.map(format_timestamp),
        surfaced_at: item.surfaced_at.map(format_timestamp),
        updated_at: format_timestamp(item.updated_at),
    }
}

fn update_to_row(update: &ItemUpdate) -> ItemResultRow {
    let (artifact_reference, error_detail) = match &update.resolution {
        ItemResolution::Completed { artifact_reference } => (Some(artifact_reference.clone()), None),
        ItemResolution::Failed { error_detail } => (None, Some(error_detail.clone())),
    };
    ItemResultRow {
        id: update.item_id.clone(),
        status: update.resolution.status().as_str().to_string(),
        artifact_reference,
        error_detail,
    }
}

fn status_strs(statuses: &[JobStatus]) -> Vec<&'static str> {
    statuses.iter().map(JobStatus::as_str).collect()
}

// ─── Public types ───────────────────────────────────────────────────────────

/// A job together with its items, read consistently.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub job: BatchJob,
    pub items: Vec<BatchJobItem>,
}

/// Filter for listing jobs.
#[derive(Debug, Default, Clone)]
pub struct JobListFilter {
    pub status: Option<JobStatus>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// A page of jobs plus the total number of matches.
#[derive(Debug, Clone, Serialize)]
pub struct JobPage {
    pub jobs: Vec<BatchJob>,
    pub total: u64,
}

/// A distinct item error and how many items failed with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorCount {
    pub error_detail: String,
    pub count: u64,
}

/// Aggregate counts across all jobs.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Statistics {
    pub jobs_by_status: BTreeMap<String, u64>,
    pub items_by_status: BTreeMap<String, u64>,
    pub total_jobs: u64,
    pub total_items: u64,
    pub delivered_items: u64,
    pub errors: Vec<ErrorCount>,
}

// ─── JobStore ───────────────────────────────────────────────────────────────

/// Durable store for batch jobs and items.
#[derive(Clone)]
pub struct JobStore {
    db: Database,
    retry_attempts: u32,
}

impl JobStore {
    /// Creates a store that retries retryable storage errors up to
    /// `retry_attempts` times per operation.
    pub fn new(db: Database, retry_attempts: u32) -> Self {
        Self { db, retry_attempts }
    }

    /// Runs `op`, retrying while the error is retryable and attempts remain.
    ///
    /// No sleep between attempts: the connection's `busy_timeout` already
    /// waits out lock contention.
    fn with_retry<T, F>(&self, what: &str, mut op: F) -> Result<T, DatabaseError>
    where
        F: FnMut() -> Result<T, DatabaseError>,
    {
        let mut attempt = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.retry_attempts => {
                    attempt += 1;
                    log::warn!(
                        "{} failed (attempt {}/{}), retrying: {}",
                        what,
                        attempt,
                        self.retry_attempts,
                        e
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Persists a new job and its items atomically.
    pub fn create_job(&self, job: &BatchJob, items: &[BatchJobItem]) -> Result<(), DatabaseError> {
        let job_row = job_to_row(job);
        let item_rows: Vec<ItemRow> = items.iter().map(item_to_row).collect();
        self.with_retry("create job", || {
            job_repo::insert_job_with_items(&self.db, &job_row, &item_rows)
        })
    }

    pub fn job(&self, id: &str) -> Result<Option<BatchJob>, DatabaseError> {
        self.with_retry("read job", || job_repo::find_job(&self.db, id))?
            .map(job_from_row)
            .transpose()
    }

    /// Reads a job with its items ordered by position.
    pub fn job_with_items(&self, id: &str) -> Result<Option<JobSnapshot>, DatabaseError> {
        let Some((job, items)) =
            self.with_retry("read job", || job_repo::find_job_with_items(&self.db, id))?
        else {
            return Ok(None);
        };

        Ok(Some(JobSnapshot {
            job: job_from_row(job)?,
            items: items
                .into_iter()
                .map(item_from_row)
                .collect::<Result<Vec<_>, _>>()?,
        }))
    }

    pub fn jobs_by_status(&self, statuses: &[JobStatus]) -> Result<Vec<BatchJob>, DatabaseError> {
        let statuses = status_strs(statuses);
        self.with_retry("read jobs by status", || {
            job_repo::find_jobs_by_status(&self.db, &statuses)
        })?
        .into_iter()
        .map(job_from_row)
        .collect()
    }

    /// Lists jobs newest first.
    pub fn list(&self, filter: &JobListFilter) -> Result<JobPage, DatabaseError> {
        let repo_filter = JobFilter {
            status: filter.status.map(|s| s.as_str().to_string()),
            limit: filter.limit,
            offset: filter.offset,
        };
        let (rows, total) = self.with_retry("list jobs", || job_repo::query(&self.db, &repo_filter))?;
        Ok(JobPage {
            jobs: rows
                .into_iter()
                .map(job_from_row)
                .collect::<Result<Vec<_>, _>>()?,
            total,
        })
    }

    /// Writes `updated` and applies `items`, provided the stored job still
    /// matches `expected`'s status and revision.
    ///
    /// Returns `false` when the job changed underneath the caller; nothing
    /// is written in that case.
    pub fn commit(
        &self,
        expected: &BatchJob,
        updated: &BatchJob,
        items: &[ItemUpdate],
    ) -> Result<bool, DatabaseError> {
        let row = job_to_row(updated);
        let guard = Expected {
            status: expected.status.as_str(),
            revision: expected.revision,
        };
        let results: Vec<ItemResultRow> = items.iter().map(update_to_row).collect();
        self.with_retry("commit job", || {
            job_repo::update_job_guarded(&self.db, &row, &guard, &results)
        })
    }

    /// Completed items of completed or partially completed jobs that have
    /// not reached the artifact sink.
    pub fn undelivered_items(&self) -> Result<Vec<BatchJobItem>, DatabaseError> {
        let statuses = status_strs(&JobStatus::DELIVERABLE);
        self.with_retry("read undelivered items", || {
            job_repo::find_undelivered_items(&self.db, &statuses)
        })?
        .into_iter()
        .map(item_from_row)
        .collect()
    }

    /// Failed items of finished jobs not yet reported to operators.
    pub fn unsurfaced_failed_items(&self) -> Result<Vec<BatchJobItem>, DatabaseError> {
        let statuses = status_strs(&[JobStatus::PartiallyCompleted, JobStatus::Failed]);
        self.with_retry("read failed items", || {
            job_repo::find_unsurfaced_failed_items(&self.db, &statuses)
        })?
        .into_iter()
        .map(item_from_row)
        .collect()
    }

    /// Sets the delivery flag. Returns `false` if it was already set.
    pub fn mark_delivered(&self, item_id: &str, now: DateTime<Utc>) -> Result<bool, DatabaseError> {
        let at = format_timestamp(now);
        self.with_retry("mark delivered", || {
            job_repo::mark_delivered(&self.db, item_id, &at)
        })
    }

    pub fn mark_surfaced(&self, item_id: &str, now: DateTime<Utc>) -> Result<bool, DatabaseError> {
        let at = format_timestamp(now);
        self.with_retry("mark surfaced", || {
            job_repo::mark_surfaced(&self.db, item_id, &at)
        })
    }

    pub fn statistics(&self) -> Result<Statistics, DatabaseError> {
        let jobs = self.with_retry("count jobs", || job_repo::count_jobs_by_status(&self.db))?;
        let items = self.with_retry("count items", || job_repo::count_items_by_status(&self.db))?;
        let errors = self.with_retry("count item errors", || job_repo::count_item_errors(&self.db))?;
        let delivered_items =
            self.with_retry("count delivered", || job_repo::count_delivered_items(&self.db))?;

        let mut stats = Statistics {
            delivered_items,
            errors: errors
                .into_iter()
                .map(|(error_detail, count)| ErrorCount {
                    error_detail,
                    count,
                })
                .collect(),
            ..Default::default()
        };
        for (status, count) in jobs {
            stats.total_jobs += count;
            stats.jobs_by_status.insert(status, count);
        }
        for (status, count) in items {
            stats.total_items += count;
            stats.items_by_status.insert(status, count);
        }
        Ok(stats)
    }
}
