//! JSON-lines file queue.
//!
//! One object per line: `{"source_reference": "...", "prompt": "...", "id": "..."}`.
//! `id` is optional; rows without one are keyed by their content.
//! Consuming rows rewrites the file without them. Parked rows move to
//! `<stem>.rejected.jsonl` next to the queue, each with a
//! `rejected_reason`; deleting that field and moving the line back
//! re-queues it.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;

use super::{ItemQueue, QueueError, QueuedItem};

#[derive(Debug, Deserialize)]
struct QueueRow {
    #[serde(default)]
    id: Option<String>,
    source_reference: String,
    prompt: String,
}

impl QueueRow {
    fn row_key(&self) -> String {
        match &self.id {
            Some(id) => id.clone(),
            None => format!("{}\u{1f}{}", self.source_reference, self.prompt),
        }
    }
}

/// A queue backed by a JSON-lines file.
pub struct JsonlItemQueue {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process.
    lock: Mutex<()>,
}

impl JsonlItemQueue {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Where parked rows are appended.
    pub fn rejected_path(&self) -> PathBuf {
        self.path.with_extension("rejected.jsonl")
    }

    fn io_error(&self, source: std::io::Error) -> QueueError {
        QueueError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// Reads raw lines; a missing file is an empty queue.
    async fn read_lines(&self) -> Result<Vec<String>, QueueError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(content.lines().map(str::to_string).collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(self.io_error(e)),
        }
    }

    /// Replaces the queue file with `lines`.
    async fn rewrite(&self, lines: &[&str]) -> Result<(), QueueError> {
        // Write-then-rename so a crash never leaves a half-written queue.
        let tmp = self.path.with_extension("jsonl.tmp");
        tokio::fs::write(&tmp, join_lines(lines))
            .await
            .map_err(|e| self.io_error(e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| self.io_error(e))
    }
}

/// Splits `lines` into rows to keep and rows claimed by `items`. Each item
/// claims exactly one matching row.
fn split_rows<'a>(
    lines: &'a [String],
    items: &[QueuedItem],
) -> Result<(Vec<&'a str>, Vec<&'a str>), QueueError> {
    let mut claims: HashMap<&str, usize> = HashMap::new();
    for item in items {
        *claims.entry(item.row_key.as_str()).or_default() += 1;
    }

    let mut kept = Vec::with_capacity(lines.len());
    let mut claimed = Vec::with_capacity(items.len());
    for (index, line) in lines.iter().enumerate() {
        if let Some(row) = parse_line(line, index + 1)? {
            if let Some(remaining) = claims.get_mut(row.row_key().as_str()) {
                if *remaining > 0 {
                    *remaining -= 1;
                    claimed.push(line.as_str());
                    continue;
                }
            }
        }
        kept.push(line.as_str());
    }
    Ok((kept, claimed))
}

fn join_lines<S: Borrow<str>>(lines: &[S]) -> String {
    let mut content = lines.join("\n");
    if !content.is_empty() {
        content.push('\n');
    }
    content
}

fn parse_line(line: &str, number: usize) -> Result<Option<QueueRow>, QueueError> {
    if line.trim().is_empty() {
        return Ok(None);
    }
    let row: QueueRow = serde_json::from_str(line).map_err(|e| QueueError::InvalidRow {
        line: number,
        reason: e.to_string(),
    })?;
    if row.source_reference.trim().is_empty() {
        return Err(QueueError::InvalidRow {
            line: number,
            reason: "source_reference is empty".to_string(),
        });
    }
    Ok(Some(row))
}

#[async_trait]
impl ItemQueue for JsonlItemQueue {
    async fn next_batch(&self, limit: usize) -> Result<Vec<QueuedItem>, QueueError> {
        let _guard = self.lock.lock().await;
        let lines = self.read_lines().await?;

        let mut items = Vec::new();
        for (index, line) in lines.iter().enumerate() {
            if items.len() >= limit {
                break;
            }
            if let Some(row) = parse_line(line, index + 1)? {
                items.push(QueuedItem {
                    row_key: row.row_key(),
                    source_reference: row.source_reference,
                    prompt: row.prompt,
                });
            }
        }
        Ok(items)
    }

    async fn mark_consumed(&self, items: &[QueuedItem]) -> Result<(), QueueError> {
        if items.is_empty() {
            return Ok(());
        }

        let _guard = self.lock.lock().await;
        let lines = self.read_lines().await?;
        let (kept, _) = split_rows(&lines, items)?;
        self.rewrite(&kept).await?;

        log::debug!(
            "Marked {} rows consumed in {}",
            items.len(),
            self.path.display()
        );
        Ok(())
    }

    async fn park(&self, items: &[QueuedItem], reason: &str) -> Result<(), QueueError> {
        if items.is_empty() {
            return Ok(());
        }

        let _guard = self.lock.lock().await;
        let lines = self.read_lines().await?;
        let (kept, claimed) = split_rows(&lines, items)?;

        let mut parked = Vec::with_capacity(claimed.len());
        for line in &claimed {
            let mut row: Value =
                serde_json::from_str(line).map_err(|e| QueueError::Backend(e.to_string()))?;
            if let Some(fields) = row.as_object_mut() {
                fields.insert("rejected_reason".to_string(), Value::from(reason));
            }
            parked.push(row.to_string());
        }

        // Append before removing: a crash in between duplicates a row
        // instead of losing it.
        let rejected = self.rejected_path();
        let mut content = match tokio::fs::read_to_string(&rejected).await {
            Ok(existing) => existing,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(self.io_error(e)),
        };
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(&join_lines(&parked));
        tokio::fs::write(&rejected, content)
            .await
            .map_err(|e| self.io_error(e))?;

        self.rewrite(&kept).await?;

        log::warn!(
            "Parked {} rows in {}: {}",
            claimed.len(),
            rejected.display(),
            reason
        );
        Ok(())
    }
}
