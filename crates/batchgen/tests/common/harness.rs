//! Test harness for isolated orchestration tests.
//!
//! Wires an `Orchestrator` and a `Reconciler` to a file-backed SQLite
//! database in a temp directory, the scripted client and a recording
//! sink. `restart` reopens the same database with fresh components.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;

use batchgen::config::OrchestratorConfig;
use batchgen::job::{BatchJob, BatchJobItem};
use batchgen::orchestrator::Orchestrator;
use batchgen::reconciler::Reconciler;
use batchgen::{Database, JobStore};

use super::fakes::{RecordingSink, ScriptedClient};

pub struct TestHarness {
    temp_dir: TempDir,
    pub db_path: PathBuf,
    pub config: OrchestratorConfig,
    pub store: JobStore,
    pub client: Arc<ScriptedClient>,
    pub sink: Arc<RecordingSink>,
    pub orchestrator: Orchestrator,
    pub reconciler: Reconciler,
}

impl TestHarness {
    /// Defaults with zero backoff so retried jobs are due on the next tick.
    pub fn new() -> Self {
        Self::with_config(OrchestratorConfig {
            backoff_base_ms: 0,
            backoff_max_ms: 0,
            ..OrchestratorConfig::default()
        })
    }

    pub fn with_config(config: OrchestratorConfig) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let db_path = temp_dir.path().join("data").join("batchgen.db");
        let client = Arc::new(ScriptedClient::default());
        let sink = Arc::new(RecordingSink::default());
        let (store, orchestrator, reconciler) = wire(&db_path, &config, &client, &sink);

        Self {
            temp_dir,
            db_path,
            config,
            store,
            client,
            sink,
            orchestrator,
            reconciler,
        }
    }

    /// Simulates a process restart: same database, client and sink, new
    /// store, orchestrator and reconciler.
    pub fn restart(&mut self) {
        let (store, orchestrator, reconciler) =
            wire(&self.db_path, &self.config, &self.client, &self.sink);
        self.store = store;
        self.orchestrator = orchestrator;
        self.reconciler = reconciler;
    }

    pub fn job(&self, job_id: &str) -> BatchJob {
        self.store
            .job(job_id)
            .expect("Failed to read job")
            .expect("Job not found")
    }

    /// Items of `job_id` in submission order.
    pub fn items(&self, job_id: &str) -> Vec<BatchJobItem> {
        self.store
            .job_with_items(job_id)
            .expect("Failed to read items")
            .expect("Job not found")
            .items
    }

    pub fn item_ids(&self, job_id: &str) -> Vec<String> {
        self.items(job_id).into_iter().map(|item| item.id).collect()
    }
}

fn wire(
    db_path: &Path,
    config: &OrchestratorConfig,
    client: &Arc<ScriptedClient>,
    sink: &Arc<RecordingSink>,
) -> (JobStore, Orchestrator, Reconciler) {
    let db = Database::open(db_path).expect("Failed to open database");
    let store = JobStore::new(db, config.persistence_retry_attempts);
    let orchestrator = Orchestrator::new(config.clone(), store.clone(), client.clone());
    let reconciler = Reconciler::new(store.clone(), sink.clone());
    (store, orchestrator, reconciler)
}
