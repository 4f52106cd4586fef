use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::secrets::expand_home;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub sink: SinkConfig,
}

impl Config {
    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(expand_home(&self.database_path))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            database_path: default_database_path(),
            orchestrator: OrchestratorConfig::default(),
            provider: ProviderConfig::default(),
            queue: QueueConfig::default(),
            sink: SinkConfig::default(),
        }
    }
}

fn default_database_path() -> String {
    "~/.batchgen/data/batchgen.db".to_string()
}

/// Batching, polling and retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Consecutive transient poll failures tolerated before a job fails.
    #[serde(default = "default_poll_retry_budget")]
    pub poll_retry_budget: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_persistence_retry_attempts")]
    pub persistence_retry_attempts: u32,
    /// Jobs polled concurrently within one tick.
    #[serde(default = "default_poll_concurrency")]
    pub poll_concurrency: usize,
}

fn default_max_batch_size() -> usize {
    50
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_poll_retry_budget() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    2_000
}

fn default_backoff_max_ms() -> u64 {
    300_000
}

fn default_persistence_retry_attempts() -> u32 {
    3
}

fn default_poll_concurrency() -> usize {
    8
}

impl OrchestratorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            poll_interval_secs: default_poll_interval_secs(),
            poll_retry_budget: default_poll_retry_budget(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            persistence_retry_attempts: default_persistence_retry_attempts(),
            poll_concurrency: default_poll_concurrency(),
        }
    }
}

/// Gemini batch API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Files API media upload endpoint, used for local source images.
    #[serde(default = "default_upload_url")]
    pub upload_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_key_file: Option<String>,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: Option<String>,
    /// Appended to every authored prompt when building the request.
    #[serde(default = "default_prompt_suffix")]
    pub prompt_suffix: String,
    #[serde(default = "default_aspect_ratio")]
    pub aspect_ratio: String,
    #[serde(default = "default_image_size")]
    pub image_size: String,
    /// Where decoded output images are written.
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_base_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}

fn default_upload_url() -> String {
    "https://generativelanguage.googleapis.com/upload/v1beta/files".to_string()
}

fn default_model() -> String {
    "gemini-3-pro-image-preview".to_string()
}

fn default_api_key_env() -> Option<String> {
    Some("GEMINI_API_KEY".to_string())
}

fn default_prompt_suffix() -> String {
    "The photo must look like it was taken by a professional photographer with quality \
     lighting on professional equipment. The object is real; do not distort its geometry."
        .to_string()
}

fn default_aspect_ratio() -> String {
    "3:2".to_string()
}

fn default_image_size() -> String {
    "2K".to_string()
}

fn default_artifact_dir() -> String {
    "~/.batchgen/artifacts".to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}

impl ProviderConfig {
    pub fn artifact_dir(&self) -> PathBuf {
        PathBuf::from(expand_home(&self.artifact_dir))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            upload_url: default_upload_url(),
            model: default_model(),
            api_key: None,
            api_key_file: None,
            api_key_env: default_api_key_env(),
            prompt_suffix: default_prompt_suffix(),
            aspect_ratio: default_aspect_ratio(),
            image_size: default_image_size(),
            artifact_dir: default_artifact_dir(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// JSON-lines item queue location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_path")]
    pub path: String,
}

fn default_queue_path() -> String {
    "~/.batchgen/queue.jsonl".to_string()
}

impl QueueConfig {
    pub fn path(&self) -> PathBuf {
        PathBuf::from(expand_home(&self.path))
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            path: default_queue_path(),
        }
    }
}

/// Moderation directory that receives delivered artifacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    #[serde(default = "default_sink_directory")]
    pub directory: String,
}

fn default_sink_directory() -> String {
    "~/.batchgen/moderation".to_string()
}

impl SinkConfig {
    pub fn directory(&self) -> PathBuf {
        PathBuf::from(expand_home(&self.directory))
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            directory: default_sink_directory(),
        }
    }
}
