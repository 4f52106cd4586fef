pub mod config;
pub mod db;
pub mod error;
pub mod generation;
pub mod job;
pub mod logging;
pub mod orchestrator;
pub mod queue;
pub mod reconciler;
pub mod scheduler;
pub mod secrets;
pub mod sink;
pub mod store;

pub use config::{load_config, load_config_or_default, Config};
pub use db::{Database, DatabaseError};
pub use error::{BatchgenError, ConfigError, Result};
pub use generation::{GeminiClient, GenerationClient, PollError, SubmissionError};
pub use job::{BatchJob, BatchJobItem, ItemStatus, JobStatus};
pub use orchestrator::{Orchestrator, OrchestratorError, PollOutcome, TickReport};
pub use queue::{ItemQueue, JsonlItemQueue, QueueError, QueuedItem};
pub use reconciler::{ReconcileReport, Reconciler};
pub use scheduler::Scheduler;
pub use secrets::{resolve_secret, SecretError};
pub use sink::{ArtifactSink, DirectorySink, SinkError};
pub use store::{JobStore, Statistics};
