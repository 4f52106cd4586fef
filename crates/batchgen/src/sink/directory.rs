//! Moderation directory sink.
//!
//! Copies each artifact to `<directory>/<item_id>.<ext>` and writes a
//! `<item_id>.json` sidecar naming the source row. Re-delivering an item
//! overwrites the same two files.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::{ArtifactSink, Delivery, SinkError};

pub struct DirectorySink {
    directory: PathBuf,
}

impl DirectorySink {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn target_for(&self, delivery: &Delivery) -> PathBuf {
        let file_name = match Path::new(&delivery.artifact_reference).extension() {
            Some(ext) => format!("{}.{}", delivery.item_id, ext.to_string_lossy()),
            None => delivery.item_id.clone(),
        };
        self.directory.join(file_name)
    }
}

#[async_trait]
impl ArtifactSink for DirectorySink {
    async fn deliver(&self, delivery: &Delivery) -> Result<(), SinkError> {
        let source = Path::new(&delivery.artifact_reference);
        let bytes = tokio::fs::read(source)
            .await
            .map_err(|e| SinkError::ArtifactUnreadable {
                path: source.to_path_buf(),
                source: e,
            })?;

        tokio::fs::create_dir_all(&self.directory)
            .await
            .map_err(|e| SinkError::Write {
                path: self.directory.clone(),
                source: e,
            })?;

        let target = self.target_for(delivery);
        tokio::fs::write(&target, bytes)
            .await
            .map_err(|e| SinkError::Write {
                path: target.clone(),
                source: e,
            })?;

        let sidecar = self.directory.join(format!("{}.json", delivery.item_id));
        let metadata = serde_json::to_vec_pretty(delivery)
            .map_err(|e| SinkError::Rejected(e.to_string()))?;
        tokio::fs::write(&sidecar, metadata)
            .await
            .map_err(|e| SinkError::Write {
                path: sidecar.clone(),
                source: e,
            })?;

        log::info!(
            "Delivered {} (source {}) to {}",
            delivery.item_id,
            delivery.source_reference,
            target.display()
        );
        Ok(())
    }
}
