//! Orchestrator: turns queued items into provider batch jobs and advances
//! them through their lifecycle.
//!
//! ```text
//! pending   --submit ok------> submitted --first poll--> running
//! pending   --submit error---> failed
//! running   --items resolved-> completed | partially_completed | failed
//! running   --poll errors----> running (backoff) | failed (budget spent)
//! any non-terminal --cancel--> cancelled
//! ```
//!
//! A first poll that already resolves every item commits `running` and
//! then the final status, so each write follows an edge above.
//!
//! Every write goes through [`JobStore::commit`], guarded by the job's
//! `(status, revision)` as read before the provider call. No lock is held
//! while talking to the provider.
//!
//! Queue rows of a batch the provider refused for good are parked instead
//! of being offered again; retryable refusals leave them queued.

pub mod backoff;
pub mod error;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use error::OrchestratorError;

use crate::config::OrchestratorConfig;
use crate::generation::{
    GenerationClient, ItemOutcome, PollError, PollResponse, ProviderStatus, SubmissionError,
    SubmitItem,
};
use crate::job::{
    aggregate_status, BatchJob, BatchJobItem, ItemResolution, ItemStatus, ItemUpdate, JobStatus,
};
use crate::queue::{ItemQueue, QueuedItem};
use crate::store::{JobListFilter, JobPage, JobStore, Statistics};

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Diagnostic for jobs found `pending` at startup.
pub const INTERRUPTED_DIAGNOSTIC: &str = "interrupted before submission was recorded";

/// Detail for items a succeeded batch returned nothing for.
pub const MISSING_OUTPUT_DETAIL: &str = "no output returned for item";

/// Re-reads allowed when a cancel races another writer.
const CANCEL_ATTEMPTS: u32 = 3;

/// What a single poll did to a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PollOutcome {
    /// Nothing new from the provider.
    Unchanged,
    Advanced {
        from: JobStatus,
        to: JobStatus,
        resolved_items: usize,
    },
    /// Transient error within budget; retried at `next_poll_at`.
    Deferred {
        failures: u32,
        next_poll_at: DateTime<Utc>,
    },
    Failed {
        diagnostic: String,
    },
    /// The job changed between read and commit; the result was discarded.
    Conflict,
}

impl PollOutcome {
    /// The job reached a terminal status with this poll.
    pub fn finished(&self) -> bool {
        match self {
            PollOutcome::Advanced { to, .. } => to.is_terminal(),
            PollOutcome::Failed { .. } => true,
            _ => false,
        }
    }
}

/// One submission: the stored job, its item ids in queue order and, when
/// the provider refused the batch, why.
struct Attempt {
    job: BatchJob,
    item_ids: Vec<String>,
    error: Option<SubmissionError>,
}

/// Summary of one polling tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub polled: usize,
    /// Pollable jobs still inside their backoff window.
    pub not_due: usize,
    pub advanced: usize,
    pub deferred: usize,
    pub failed: usize,
    pub conflicts: usize,
    pub errors: usize,
}

impl TickReport {
    fn record(&mut self, job_id: &str, outcome: &Result<PollOutcome>) {
        self.polled += 1;
        match outcome {
            Ok(PollOutcome::Unchanged) => {}
            Ok(PollOutcome::Advanced { .. }) => self.advanced += 1,
            Ok(PollOutcome::Deferred { .. }) => self.deferred += 1,
            Ok(PollOutcome::Failed { .. }) => self.failed += 1,
            Ok(PollOutcome::Conflict) => self.conflicts += 1,
            Err(e) => {
                error!("Polling job {} aborted: {}", job_id, e);
                self.errors += 1;
            }
        }
    }
}

/// Per-status item counts for a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ItemCounts {
    pub pending: usize,
    pub completed: usize,
    pub failed: usize,
    pub delivered: usize,
}

/// Operator view of one job.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub job: BatchJob,
    pub counts: ItemCounts,
    pub items: Vec<BatchJobItem>,
}

/// Maps a poll response onto item updates.
///
/// Only items still pending locally are updated, so re-applying a
/// response is a no-op. Results for unknown items are ignored. Once the
/// provider reports a terminal batch, items it left unresolved fail.
fn resolve_items(items: &[BatchJobItem], response: &PollResponse) -> Vec<ItemUpdate> {
    let known: HashSet<&str> = items.iter().map(|i| i.id.as_str()).collect();
    let mut pending: HashSet<&str> = items
        .iter()
        .filter(|i| i.status == ItemStatus::Pending)
        .map(|i| i.id.as_str())
        .collect();

    let mut updates = Vec::new();
    for result in &response.items {
        if !known.contains(result.item_id.as_str()) {
            warn!("Ignoring provider result for unknown item {}", result.item_id);
            continue;
        }
        let resolution = match &result.outcome {
            ItemOutcome::Completed { artifact_reference } => ItemResolution::Completed {
                artifact_reference: artifact_reference.clone(),
            },
            ItemOutcome::Failed { error_detail } => ItemResolution::Failed {
                error_detail: error_detail.clone(),
            },
            ItemOutcome::Pending => continue,
        };
        if pending.remove(result.item_id.as_str()) {
            updates.push(ItemUpdate {
                item_id: result.item_id.clone(),
                resolution,
            });
        }
    }

    if response.provider_status.is_terminal() && !pending.is_empty() {
        let detail = match response.provider_status {
            ProviderStatus::Succeeded => MISSING_OUTPUT_DETAIL.to_string(),
            other => format!("provider reported batch {}", other),
        };
        for item in items.iter().filter(|i| pending.contains(i.id.as_str())) {
            updates.push(ItemUpdate {
                item_id: item.id.clone(),
                resolution: ItemResolution::Failed {
                    error_detail: detail.clone(),
                },
            });
        }
    }

    updates
}

/// Drives batch jobs from submission to a terminal status.
pub struct Orchestrator {
    config: OrchestratorConfig,
    store: JobStore,
    client: Arc<dyn GenerationClient>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        store: JobStore,
        client: Arc<dyn GenerationClient>,
    ) -> Self {
        Self {
            config,
            store,
            client,
        }
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    fn current(&self, job_id: &str) -> Result<BatchJob> {
        self.store
            .job(job_id)?
            .ok_or_else(|| OrchestratorError::NotFound(job_id.to_string()))
    }

    /// Creates a job for `items` and submits it.
    ///
    /// The job and its items are persisted before the provider is called.
    /// A provider rejection is not an error of this call: the returned job
    /// is `failed` with the reason as diagnostic and its items stay
    /// `pending`.
    pub async fn submit_batch(&self, items: &[QueuedItem]) -> Result<BatchJob> {
        Ok(self.attempt(items).await?.job)
    }

    async fn attempt(&self, items: &[QueuedItem]) -> Result<Attempt> {
        if items.is_empty() {
            return Err(OrchestratorError::EmptyBatch);
        }
        let too_large = || OrchestratorError::BatchTooLarge {
            size: items.len(),
            max: self.config.max_batch_size,
        };
        if items.len() > self.config.max_batch_size {
            return Err(too_large());
        }
        let item_count = u32::try_from(items.len()).map_err(|_| too_large())?;

        let now = Utc::now();
        let job = BatchJob::new(Uuid::new_v4().to_string(), item_count, now);
        let job_items: Vec<BatchJobItem> = items
            .iter()
            .zip(0u32..)
            .map(|(queued, position)| {
                BatchJobItem::new(
                    Uuid::new_v4().to_string(),
                    job.id.as_str(),
                    position,
                    queued.source_reference.as_str(),
                    queued.prompt.as_str(),
                    now,
                )
            })
            .collect();

        self.store.create_job(&job, &job_items)?;
        info!("Created job {} with {} items", job.id, item_count);

        let request: Vec<SubmitItem> = job_items
            .iter()
            .map(|item| SubmitItem {
                item_id: item.id.clone(),
                prompt: item.prompt.clone(),
                source_reference: item.source_reference.clone(),
            })
            .collect();

        let submitted = self
            .client
            .submit(&request)
            .instrument(info_span!("submit", job_id = %job.id))
            .await;

        let item_ids: Vec<String> = job_items.into_iter().map(|item| item.id).collect();
        match submitted {
            Ok(external_job_id) => Ok(Attempt {
                job: self.record_submission(&job, &external_job_id)?,
                item_ids,
                error: None,
            }),
            Err(e) => {
                warn!("Submission of job {} failed: {}", job.id, e);
                let failed = job.failed(e.to_string(), Utc::now());
                if !self.store.commit(&job, &failed, &[])? {
                    warn!("Job {} changed while its submission failed", job.id);
                }
                Ok(Attempt {
                    job: self.current(&job.id)?,
                    item_ids,
                    error: Some(e),
                })
            }
        }
    }

    fn record_submission(&self, job: &BatchJob, external_job_id: &str) -> Result<BatchJob> {
        let submitted = job.submitted(external_job_id, Utc::now());
        match self.store.commit(job, &submitted, &[]) {
            Ok(true) => {
                info!("Job {} submitted as {}", job.id, external_job_id);
            }
            Ok(false) => {
                // Cancelled while the request was in flight.
                warn!(
                    "Job {} changed during submission; provider job {} is orphaned",
                    job.id, external_job_id
                );
            }
            Err(e) => {
                error!(
                    "Provider accepted job {} as {} but recording it failed: {}",
                    job.id, external_job_id, e
                );
                return Err(e.into());
            }
        }
        self.current(&job.id)
    }

    /// Submits the next batch from `queue`, at most `max_batch_size` rows.
    ///
    /// Rows are marked consumed only once the job is recorded as
    /// submitted. After a refusal that would repeat for the same input the
    /// rows at fault are parked: just the named row for an unusable
    /// source, otherwise the whole batch. Returns `None` when the queue is
    /// empty.
    pub async fn submit_from_queue(&self, queue: &dyn ItemQueue) -> Result<Option<BatchJob>> {
        let items = queue.next_batch(self.config.max_batch_size).await?;
        if items.is_empty() {
            debug!("Queue is empty, nothing to submit");
            return Ok(None);
        }

        let attempt = self.attempt(&items).await?;
        let job = attempt.job;
        match attempt.error {
            None if job.external_job_id.is_some() => {
                if let Err(e) = queue.mark_consumed(&items).await {
                    error!(
                        "Job {} was submitted but its {} queue rows were not marked consumed: {}",
                        job.id,
                        items.len(),
                        e
                    );
                    return Err(e.into());
                }
            }
            None => {}
            Some(e) if e.is_retryable() => {
                info!("Rows of job {} stay queued for another attempt", job.id);
            }
            Some(e) => {
                let at_fault = match &e {
                    SubmissionError::InvalidSource { item_id, .. } => attempt
                        .item_ids
                        .iter()
                        .position(|id| id == item_id)
                        .map(|position| vec![items[position].clone()]),
                    _ => None,
                };
                let parked = at_fault.unwrap_or(items);
                warn!(
                    "Parking {} queue rows of job {} refused by the provider",
                    parked.len(),
                    job.id
                );
                queue.park(&parked, &e.to_string()).await?;
            }
        }
        Ok(Some(job))
    }

    /// Polls every submitted or running job whose backoff has elapsed.
    ///
    /// Jobs are polled concurrently, up to `poll_concurrency` at a time.
    /// Failures of individual jobs are counted in the report; only a
    /// failure to list the jobs fails the tick.
    pub async fn tick(&self) -> Result<TickReport> {
        async {
            let now = Utc::now();
            let jobs = self.store.jobs_by_status(&JobStatus::POLLABLE)?;
            let (due, not_due): (Vec<BatchJob>, Vec<BatchJob>) =
                jobs.into_iter().partition(|job| job.is_due(now));

            let mut report = TickReport {
                not_due: not_due.len(),
                ..Default::default()
            };

            let outcomes: Vec<(String, Result<PollOutcome>)> = stream::iter(due)
                .map(|job| async move {
                    let job_id = job.id.clone();
                    (job_id, self.poll_job(job).await)
                })
                .buffer_unordered(self.config.poll_concurrency.max(1))
                .collect()
                .await;

            for (job_id, outcome) in &outcomes {
                report.record(job_id, outcome);
            }

            if report.polled > 0 {
                info!(
                    "Tick polled {} jobs: {} advanced, {} deferred, {} failed, {} conflicts, {} errors",
                    report.polled,
                    report.advanced,
                    report.deferred,
                    report.failed,
                    report.conflicts,
                    report.errors
                );
            }
            Ok::<_, OrchestratorError>(report)
        }
        .instrument(info_span!("tick"))
        .await
    }

    async fn poll_job(&self, job: BatchJob) -> Result<PollOutcome> {
        let span = info_span!("poll_job", job_id = %job.id);
        async {
            let Some(external_job_id) = job.external_job_id.clone() else {
                let diagnostic = "job has no provider id to poll".to_string();
                let failed = job.failed(diagnostic.clone(), Utc::now());
                return self.commit_outcome(&job, &failed, &[], PollOutcome::Failed { diagnostic });
            };

            let outcome = match self.client.poll(&external_job_id).await {
                Ok(response) => self.apply_response(&job, &response),
                Err(PollError::Transient(message)) => self.defer(&job, message),
                Err(PollError::Permanent(message)) => {
                    warn!("Job {} failed permanently: {}", job.id, message);
                    let failed = job.failed(message.clone(), Utc::now());
                    self.commit_outcome(
                        &job,
                        &failed,
                        &[],
                        PollOutcome::Failed {
                            diagnostic: message,
                        },
                    )
                }
            };

            if matches!(&outcome, Ok(o) if o.finished()) {
                self.client.release(&external_job_id).await;
            }
            outcome
        }
        .instrument(span)
        .await
    }

    fn commit_outcome(
        &self,
        expected: &BatchJob,
        updated: &BatchJob,
        items: &[ItemUpdate],
        outcome: PollOutcome,
    ) -> Result<PollOutcome> {
        if self.store.commit(expected, updated, items)? {
            Ok(outcome)
        } else {
            info!(
                "Job {} changed while polling, discarding this result",
                expected.id
            );
            Ok(PollOutcome::Conflict)
        }
    }

    fn defer(&self, job: &BatchJob, message: String) -> Result<PollOutcome> {
        let now = Utc::now();
        let failures = job.poll_failures.saturating_add(1);

        if failures >= self.config.poll_retry_budget {
            warn!(
                "Job {} failed after {} consecutive poll errors: {}",
                job.id, failures, message
            );
            let failed = job.poll_exhausted(message.clone(), now);
            return self.commit_outcome(
                job,
                &failed,
                &[],
                PollOutcome::Failed {
                    diagnostic: message,
                },
            );
        }

        let delay = backoff::retry_delay(
            job.poll_failures,
            self.config.backoff_base(),
            self.config.backoff_max(),
        );
        let next_poll_at =
            now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());

        warn!(
            "Poll of job {} failed ({}/{}), retrying after {:?}: {}",
            job.id, failures, self.config.poll_retry_budget, delay, message
        );
        let deferred = job.poll_deferred(message, next_poll_at, now);
        self.commit_outcome(
            job,
            &deferred,
            &[],
            PollOutcome::Deferred {
                failures,
                next_poll_at,
            },
        )
    }

    fn apply_response(&self, job: &BatchJob, response: &PollResponse) -> Result<PollOutcome> {
        let items = self.store.job_with_items(&job.id)?.map(|s| s.items).ok_or_else(|| {
            OrchestratorError::NotFound(job.id.clone())
        })?;

        let updates = resolve_items(&items, response);

        let mut statuses: HashMap<&str, ItemStatus> =
            items.iter().map(|i| (i.id.as_str(), i.status)).collect();
        for update in &updates {
            statuses.insert(update.item_id.as_str(), update.resolution.status());
        }
        let next_status = aggregate_status(statuses.values().copied()).unwrap_or(JobStatus::Running);

        let unchanged = updates.is_empty()
            && next_status == job.status
            && job.poll_failures == 0
            && job.diagnostic.is_none();
        if unchanged {
            debug!(
                "Job {} unchanged (provider {})",
                job.id, response.provider_status
            );
            return Ok(PollOutcome::Unchanged);
        }

        let now = Utc::now();
        let mut expected = job.clone();
        if job.status == JobStatus::Submitted && next_status.is_terminal() {
            let running = job.polled(JobStatus::Running, now);
            if !self.store.commit(job, &running, &[])? {
                info!("Job {} changed while polling, discarding this result", job.id);
                return Ok(PollOutcome::Conflict);
            }
            // Every commit bumps the revision by one.
            expected = running;
            expected.revision += 1;
        }

        let next = expected.polled(next_status, now);
        if next_status.is_terminal() {
            info!(
                "Job {} finished as {} (provider {})",
                job.id, next_status, response.provider_status
            );
        }
        self.commit_outcome(
            &expected,
            &next,
            &updates,
            PollOutcome::Advanced {
                from: job.status,
                to: next_status,
                resolved_items: updates.len(),
            },
        )
    }

    /// Cancels a non-terminal job. Later ticks skip it; the provider batch
    /// itself is left alone.
    pub fn cancel(&self, job_id: &str) -> Result<BatchJob> {
        for _ in 0..CANCEL_ATTEMPTS {
            let job = self.current(job_id)?;
            if job.is_terminal() {
                return Err(OrchestratorError::AlreadyTerminal {
                    job_id: job.id,
                    status: job.status,
                });
            }

            let cancelled = job.cancelled(Utc::now());
            if self.store.commit(&job, &cancelled, &[])? {
                info!("Job {} cancelled (was {})", job.id, job.status);
                return self.current(job_id);
            }
            debug!("Job {} changed during cancel, re-reading", job_id);
        }
        Err(OrchestratorError::Conflict(job_id.to_string()))
    }

    /// Fails jobs left `pending` by an interrupted process.
    ///
    /// Call at startup, before any submission in this process. Items stay
    /// `pending`; their queue rows were never consumed.
    pub fn recover_interrupted(&self) -> Result<usize> {
        let stale = self.store.jobs_by_status(&[JobStatus::Pending])?;
        let mut recovered = 0;
        for job in stale {
            let failed = job.failed(INTERRUPTED_DIAGNOSTIC, Utc::now());
            if self.store.commit(&job, &failed, &[])? {
                warn!("Job {} was {}; marked failed", job.id, INTERRUPTED_DIAGNOSTIC);
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    /// Job status with item summaries.
    pub fn job_status(&self, job_id: &str) -> Result<JobReport> {
        let snapshot = self
            .store
            .job_with_items(job_id)?
            .ok_or_else(|| OrchestratorError::NotFound(job_id.to_string()))?;

        let mut counts = ItemCounts::default();
        for item in &snapshot.items {
            match item.status {
                ItemStatus::Pending => counts.pending += 1,
                ItemStatus::Completed => counts.completed += 1,
                ItemStatus::Failed => counts.failed += 1,
            }
            if item.is_delivered() {
                counts.delivered += 1;
            }
        }

        Ok(JobReport {
            job: snapshot.job,
            counts,
            items: snapshot.items,
        })
    }

    pub fn list(&self, filter: &JobListFilter) -> Result<JobPage> {
        Ok(self.store.list(filter)?)
    }

    pub fn statistics(&self) -> Result<Statistics> {
        Ok(self.store.statistics()?)
    }
}
