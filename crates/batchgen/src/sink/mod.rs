//! Artifact sink: the downstream consumer of completed items.

pub mod directory;

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

pub use directory::DirectorySink;

/// One completed item handed downstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Delivery {
    /// Stable across redeliveries; sinks may use it to stay idempotent.
    pub item_id: String,
    pub source_reference: String,
    pub artifact_reference: String,
}

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Artifact '{path}' is not readable: {source}")]
    ArtifactUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Sink rejected delivery: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait ArtifactSink: Send + Sync {
    async fn deliver(&self, delivery: &Delivery) -> Result<(), SinkError>;
}
