//! In-memory stand-ins for the provider, the item queue and the sink.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use batchgen::generation::{
    GenerationClient, ItemResult, PollError, PollResponse, ProviderStatus, SubmissionError,
    SubmitItem,
};
use batchgen::queue::{ItemQueue, QueueError, QueuedItem};
use batchgen::sink::{ArtifactSink, Delivery, SinkError};

type PollHook = Box<dyn FnOnce() + Send>;

/// Generation client that replays scripted responses.
///
/// Unscripted submissions succeed as `ext-1`, `ext-2`, ...; unscripted
/// polls report a running batch with no item output. Batches containing a
/// source marked with `refuse_source` fail with `InvalidSource`.
#[derive(Default)]
pub struct ScriptedClient {
    submit_script: Mutex<VecDeque<Result<String, SubmissionError>>>,
    refused_sources: Mutex<Vec<String>>,
    releases: Mutex<Vec<String>>,
    poll_script: Mutex<HashMap<String, VecDeque<Result<PollResponse, PollError>>>>,
    before_poll: Mutex<Option<PollHook>>,
    submissions: Mutex<Vec<Vec<SubmitItem>>>,
    polls: Mutex<Vec<String>>,
    next_external: AtomicUsize,
}

impl ScriptedClient {
    pub fn push_submit(&self, result: Result<String, SubmissionError>) {
        self.submit_script.lock().unwrap().push_back(result);
    }

    pub fn push_poll(&self, external_job_id: &str, result: Result<PollResponse, PollError>) {
        self.poll_script
            .lock()
            .unwrap()
            .entry(external_job_id.to_string())
            .or_default()
            .push_back(result);
    }

    /// Runs `hook` once, right before the next poll returns.
    pub fn before_next_poll(&self, hook: impl FnOnce() + Send + 'static) {
        *self.before_poll.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn refuse_source(&self, source_reference: &str) {
        self.refused_sources
            .lock()
            .unwrap()
            .push(source_reference.to_string());
    }

    pub fn releases(&self) -> Vec<String> {
        self.releases.lock().unwrap().clone()
    }

    pub fn submissions(&self) -> Vec<Vec<SubmitItem>> {
        self.submissions.lock().unwrap().clone()
    }

    pub fn polls(&self) -> Vec<String> {
        self.polls.lock().unwrap().clone()
    }
}

#[async_trait]
impl GenerationClient for ScriptedClient {
    async fn submit(&self, items: &[SubmitItem]) -> Result<String, SubmissionError> {
        self.submissions.lock().unwrap().push(items.to_vec());
        let refused = self.refused_sources.lock().unwrap().clone();
        if let Some(item) = items
            .iter()
            .find(|item| refused.contains(&item.source_reference))
        {
            return Err(SubmissionError::InvalidSource {
                item_id: item.item_id.clone(),
                reason: "file not found".to_string(),
            });
        }
        if let Some(result) = self.submit_script.lock().unwrap().pop_front() {
            return result;
        }
        let n = self.next_external.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("ext-{}", n))
    }

    async fn poll(&self, external_job_id: &str) -> Result<PollResponse, PollError> {
        self.polls.lock().unwrap().push(external_job_id.to_string());

        let hook = self.before_poll.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }

        let scripted = self
            .poll_script
            .lock()
            .unwrap()
            .get_mut(external_job_id)
            .and_then(|queue| queue.pop_front());
        scripted.unwrap_or_else(|| Ok(response(ProviderStatus::Running, vec![])))
    }

    async fn release(&self, external_job_id: &str) {
        self.releases
            .lock()
            .unwrap()
            .push(external_job_id.to_string());
    }
}

pub fn response(provider_status: ProviderStatus, items: Vec<ItemResult>) -> PollResponse {
    PollResponse {
        provider_status,
        items,
    }
}

/// Item queue over a vector.
#[derive(Default)]
pub struct MemoryQueue {
    rows: Mutex<Vec<QueuedItem>>,
    parked: Mutex<Vec<(QueuedItem, String)>>,
}

impl MemoryQueue {
    /// A queue of `n` rows keyed `row-0`, `row-1`, ...
    pub fn with_rows(n: usize) -> Self {
        let rows = (0..n)
            .map(|i| {
                QueuedItem::new(
                    format!("row-{}", i),
                    format!("gs://bucket/source-{}.jpg", i),
                    format!("prompt {}", i),
                )
            })
            .collect();
        Self {
            rows: Mutex::new(rows),
            parked: Mutex::new(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    /// Parked rows with the reason they were parked for.
    pub fn parked(&self) -> Vec<(QueuedItem, String)> {
        self.parked.lock().unwrap().clone()
    }
}

#[async_trait]
impl ItemQueue for MemoryQueue {
    async fn next_batch(&self, limit: usize) -> Result<Vec<QueuedItem>, QueueError> {
        Ok(self.rows.lock().unwrap().iter().take(limit).cloned().collect())
    }

    async fn mark_consumed(&self, items: &[QueuedItem]) -> Result<(), QueueError> {
        self.rows
            .lock()
            .unwrap()
            .retain(|row| !items.iter().any(|item| item.row_key == row.row_key));
        Ok(())
    }

    async fn park(&self, items: &[QueuedItem], reason: &str) -> Result<(), QueueError> {
        self.rows
            .lock()
            .unwrap()
            .retain(|row| !items.iter().any(|item| item.row_key == row.row_key));
        self.parked
            .lock()
            .unwrap()
            .extend(items.iter().map(|item| (item.clone(), reason.to_string())));
        Ok(())
    }
}

/// Sink that records deliveries, optionally rejecting them.
#[derive(Default)]
pub struct RecordingSink {
    deliveries: Mutex<Vec<Delivery>>,
    reject: AtomicBool,
}

impl RecordingSink {
    pub fn set_rejecting(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().unwrap().clone()
    }
}

#[async_trait]
impl ArtifactSink for RecordingSink {
    async fn deliver(&self, delivery: &Delivery) -> Result<(), SinkError> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(SinkError::Rejected("moderation store offline".to_string()));
        }
        self.deliveries.lock().unwrap().push(delivery.clone());
        Ok(())
    }
}
