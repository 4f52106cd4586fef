//! Gemini Batch API client.
//!
//! Submits inlined `generateContent` requests through
//! `models/{model}:batchGenerateContent` and reads results back from the
//! batch operation. Each request carries its item id in `metadata.key`.
//!
//! Local source images are uploaded through the Files API first. The
//! uploaded file names are kept in a manifest under
//! `artifact_dir/.uploads/` until `release` deletes them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use log::{debug, info, warn};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use uuid::Uuid;

use super::{
    GenerationClient, ItemResult, PollError, PollResponse, ProviderStatus, SubmissionError,
    SubmitItem,
};
use crate::config::ProviderConfig;
use crate::secrets::expand_home;

/// Connect timeout for provider requests.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum length of a response body quoted in errors and logs.
const MAX_ERROR_BODY_LENGTH: usize = 200;

/// MIME type assumed when the source reference has no recognizable extension.
const FALLBACK_SOURCE_MIME: &str = "image/jpeg";

/// Detail recorded for a response that carries neither an image nor an error.
pub const NO_IMAGE_DETAIL: &str = "image was not generated";

/// Sources under this prefix already live in the Files API.
const FILES_API_PREFIX: &str = "files/";

/// Directory under `artifact_dir` holding one upload manifest per batch.
const UPLOAD_MANIFEST_DIR: &str = ".uploads";

/// Length of a hyphenated UUID, the only form item ids take.
const ITEM_KEY_LENGTH: usize = 36;

/// Where the inlined responses may sit in a batch operation.
const INLINED_RESPONSE_POINTERS: &[&str] = &[
    "/response/inlinedResponses/inlinedResponses",
    "/response/inlinedResponses",
    "/metadata/output/inlinedResponses/inlinedResponses",
    "/metadata/output/inlinedResponses",
];

fn truncate_body(body: &str) -> String {
    if body.len() > MAX_ERROR_BODY_LENGTH {
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated)", &body[..end])
    } else {
        body.to_string()
    }
}

/// Maps a `BATCH_STATE_*` / `JOB_STATE_*` name to a provider status.
fn map_state(state: &str) -> ProviderStatus {
    let name = state
        .strip_prefix("BATCH_STATE_")
        .or_else(|| state.strip_prefix("JOB_STATE_"))
        .unwrap_or(state);
    match name {
        "PENDING" | "QUEUED" => ProviderStatus::Pending,
        "RUNNING" | "PAUSED" | "CANCELLING" | "UPDATING" => ProviderStatus::Running,
        "SUCCEEDED" => ProviderStatus::Succeeded,
        "FAILED" => ProviderStatus::Failed,
        "CANCELLED" => ProviderStatus::Cancelled,
        "EXPIRED" => ProviderStatus::Expired,
        other => {
            warn!("Unknown batch state '{}', treating as running", other);
            ProviderStatus::Running
        }
    }
}

fn extension_for(mime: &str) -> &'static str {
    match mime {
        "image/png" => "png",
        "image/jpeg" | "image/jpg" => "jpg",
        "image/webp" => "webp",
        other => mime_guess::get_mime_extensions_str(other)
            .and_then(|exts| exts.first().copied())
            .unwrap_or("bin"),
    }
}

/// Whether a provider-echoed key can be one of our item ids. Keys are
/// used as artifact file names, so nothing else gets through.
fn is_item_key(key: &str) -> bool {
    key.len() == ITEM_KEY_LENGTH && Uuid::parse_str(key).is_ok()
}

/// Where a source image lives, as far as the provider is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SourceLocation {
    /// Addressable by the provider as is (`gs://`, `https://`, `files/...`).
    Remote,
    /// A file on this machine, uploaded before submission.
    Local(PathBuf),
}

pub(crate) fn locate_source(reference: &str) -> SourceLocation {
    if reference.contains("://") || reference.starts_with(FILES_API_PREFIX) {
        SourceLocation::Remote
    } else {
        SourceLocation::Local(PathBuf::from(expand_home(reference)))
    }
}

/// A source image uploaded through the Files API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct UploadedFile {
    /// Resource name (`files/...`), used to delete the upload.
    pub name: String,
    pub uri: String,
    pub mime_type: String,
}

fn invalid_source(item: &SubmitItem, reason: String) -> SubmissionError {
    SubmissionError::InvalidSource {
        item_id: item.item_id.clone(),
        reason,
    }
}

fn parse_uploaded_file(text: &str, mime_type: &str) -> Result<UploadedFile, SubmissionError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| SubmissionError::InvalidResponse(format!("malformed upload response: {}", e)))?;
    let file = value.get("file").unwrap_or(&value);
    let field = |key: &str| {
        file.get(key)
            .and_then(Value::as_str)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    match (field("name"), field("uri")) {
        (Some(name), Some(uri)) => Ok(UploadedFile {
            name,
            uri,
            mime_type: field("mimeType").unwrap_or_else(|| mime_type.to_string()),
        }),
        _ => Err(SubmissionError::InvalidResponse(format!(
            "upload response has no file name or uri: {}",
            truncate_body(text)
        ))),
    }
}

/// Manifest file name for a batch; provider ids contain `/`.
fn manifest_file_name(external_job_id: &str) -> String {
    let stem: String = external_job_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    format!("{}.json", stem)
}

fn error_message(error: &Value) -> String {
    error
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| error.to_string())
}

/// An output image found in a response, still base64-encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct InlineImage {
    pub mime_type: String,
    pub data: String,
}

/// What a single inlined response said about its item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ParsedOutcome {
    Image(InlineImage),
    Failed(String),
}

/// Why an output image could not be stored.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ArtifactError {
    /// The payload itself is bad; the item fails.
    Decode(String),
    /// Local storage failed; the poll is retried.
    Io(String),
}

/// A batch operation decoded, before any artifact is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ParsedBatch {
    pub status: ProviderStatus,
    pub items: Vec<(String, ParsedOutcome)>,
}

fn find_inline_image(response: &Value) -> Option<InlineImage> {
    let candidates = response.get("candidates")?.as_array()?;
    candidates
        .iter()
        .filter_map(|c| c.pointer("/content/parts").and_then(Value::as_array))
        .flatten()
        .find_map(|part| {
            let inline = part.get("inlineData").or_else(|| part.get("inline_data"))?;
            let data = inline.get("data")?.as_str()?;
            let mime_type = inline
                .get("mimeType")
                .or_else(|| inline.get("mime_type"))
                .and_then(Value::as_str)
                .unwrap_or("image/png");
            Some(InlineImage {
                mime_type: mime_type.to_string(),
                data: data.to_string(),
            })
        })
}

/// Decodes a batch operation. Malformed operations are permanent errors;
/// malformed individual entries are skipped with a warning.
pub(crate) fn parse_operation(operation: &Value) -> Result<ParsedBatch, PollError> {
    let state = operation
        .pointer("/metadata/state")
        .or_else(|| operation.get("state"))
        .and_then(Value::as_str);

    let status = match state {
        Some(state) => map_state(state),
        None if operation.get("error").is_some() => ProviderStatus::Failed,
        None => {
            return Err(PollError::Permanent(format!(
                "batch operation has no state: {}",
                truncate_body(&operation.to_string())
            )))
        }
    };

    let entries = INLINED_RESPONSE_POINTERS
        .iter()
        .find_map(|p| operation.pointer(p).and_then(Value::as_array));

    let mut items = Vec::new();
    for entry in entries.into_iter().flatten() {
        let key = entry
            .pointer("/metadata/key")
            .or_else(|| entry.get("key"))
            .and_then(Value::as_str);
        let Some(key) = key else {
            warn!("Skipping inlined response without a key");
            continue;
        };
        if !is_item_key(key) {
            warn!("Skipping inlined response with foreign key '{}'", truncate_body(key));
            continue;
        }

        let outcome = if let Some(error) = entry.get("error") {
            ParsedOutcome::Failed(error_message(error))
        } else {
            match entry.get("response").and_then(find_inline_image) {
                Some(image) => ParsedOutcome::Image(image),
                None => ParsedOutcome::Failed(NO_IMAGE_DETAIL.to_string()),
            }
        };
        items.push((key.to_string(), outcome));
    }

    Ok(ParsedBatch { status, items })
}

/// Client for the Gemini Batch API.
pub struct GeminiClient {
    client: Client,
    api_key: SecretString,
    base_url: String,
    upload_url: String,
    model: String,
    prompt_suffix: String,
    aspect_ratio: String,
    image_size: String,
    artifact_dir: PathBuf,
}

impl GeminiClient {
    pub fn new(config: &ProviderConfig, api_key: SecretString) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            client,
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            upload_url: config.upload_url.clone(),
            model: config.model.clone(),
            prompt_suffix: config.prompt_suffix.clone(),
            aspect_ratio: config.aspect_ratio.clone(),
            image_size: config.image_size.clone(),
            artifact_dir: config.artifact_dir(),
        })
    }

    fn full_prompt(&self, prompt: &str) -> String {
        if self.prompt_suffix.is_empty() {
            prompt.to_string()
        } else {
            format!("{}. {}", prompt, self.prompt_suffix)
        }
    }

    /// Builds the `batchGenerateContent` request body. Items found in
    /// `uploads` reference their uploaded copy.
    pub(crate) fn build_request(
        &self,
        display_name: &str,
        items: &[SubmitItem],
        uploads: &HashMap<String, UploadedFile>,
    ) -> Value {
        let requests: Vec<Value> = items
            .iter()
            .map(|item| {
                let (file_uri, mime_type) = match uploads.get(&item.item_id) {
                    Some(file) => (file.uri.as_str(), file.mime_type.as_str()),
                    None => (
                        item.source_reference.as_str(),
                        mime_guess::from_path(&item.source_reference)
                            .first_raw()
                            .unwrap_or(FALLBACK_SOURCE_MIME),
                    ),
                };
                json!({
                    "request": {
                        "contents": [{
                            "role": "user",
                            "parts": [
                                { "text": self.full_prompt(&item.prompt) },
                                {
                                    "file_data": {
                                        "file_uri": file_uri,
                                        "mime_type": mime_type,
                                    }
                                }
                            ]
                        }],
                        "generation_config": {
                            "responseModalities": ["TEXT", "IMAGE"],
                            "image_config": {
                                "aspect_ratio": self.aspect_ratio,
                                "image_size": self.image_size,
                            }
                        }
                    },
                    "metadata": { "key": item.item_id }
                })
            })
            .collect();

        json!({
            "batch": {
                "display_name": display_name,
                "input_config": {
                    "requests": { "requests": requests }
                }
            }
        })
    }

    /// Decodes an inline image and writes it to `artifact_dir/<item_id>.<ext>`.
    async fn write_artifact(
        &self,
        item_id: &str,
        image: &InlineImage,
    ) -> Result<PathBuf, ArtifactError> {
        if !is_item_key(item_id) {
            return Err(ArtifactError::Decode(format!(
                "'{}' is not an item id",
                truncate_body(item_id)
            )));
        }
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(image.data.as_bytes())
            .map_err(|e| ArtifactError::Decode(format!("invalid image data: {}", e)))?;

        write_file(
            &self.artifact_dir,
            &format!("{}.{}", item_id, extension_for(&image.mime_type)),
            &bytes,
        )
        .await
        .map_err(ArtifactError::Io)
    }

    /// Uploads every local source and returns the uploads keyed by item id.
    ///
    /// All local paths are checked before the first upload. When an upload
    /// fails, the files uploaded so far are deleted again.
    async fn upload_local_sources(
        &self,
        items: &[SubmitItem],
    ) -> Result<HashMap<String, UploadedFile>, SubmissionError> {
        let mut local = Vec::new();
        for item in items {
            if let SourceLocation::Local(path) = locate_source(&item.source_reference) {
                match tokio::fs::metadata(&path).await {
                    Ok(meta) if meta.is_file() => local.push((item, path)),
                    Ok(_) => {
                        return Err(invalid_source(
                            item,
                            format!("'{}' is not a file", path.display()),
                        ))
                    }
                    Err(e) => {
                        return Err(invalid_source(
                            item,
                            format!("cannot read '{}': {}", path.display(), e),
                        ))
                    }
                }
            }
        }

        let mut uploads = HashMap::with_capacity(local.len());
        for (item, path) in local {
            match self.upload_file(item, &path).await {
                Ok(file) => {
                    uploads.insert(item.item_id.clone(), file);
                }
                Err(e) => {
                    self.delete_uploads(&uploads).await;
                    return Err(e);
                }
            }
        }
        Ok(uploads)
    }

    async fn upload_file(
        &self,
        item: &SubmitItem,
        path: &Path,
    ) -> Result<UploadedFile, SubmissionError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| invalid_source(item, format!("cannot read '{}': {}", path.display(), e)))?;
        let mime_type = mime_guess::from_path(path)
            .first_raw()
            .unwrap_or(FALLBACK_SOURCE_MIME);

        let response = self
            .client
            .post(format!("{}?uploadType=media", self.upload_url))
            .header("x-goog-api-key", self.api_key.expose_secret())
            .header(CONTENT_TYPE, mime_type)
            .body(bytes)
            .send()
            .await
            .map_err(|e| {
                SubmissionError::Request(format!("upload of '{}' failed: {}", path.display(), e))
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| SubmissionError::Request(e.to_string()))?;

        match status {
            s if s.is_success() => {}
            StatusCode::BAD_REQUEST
            | StatusCode::PAYLOAD_TOO_LARGE
            | StatusCode::UNSUPPORTED_MEDIA_TYPE => {
                return Err(invalid_source(
                    item,
                    format!("upload refused (HTTP {}): {}", status.as_u16(), truncate_body(&text)),
                ))
            }
            _ => {
                return Err(SubmissionError::Rejected {
                    status: status.as_u16(),
                    body: truncate_body(&text),
                })
            }
        }

        let file = parse_uploaded_file(&text, mime_type)?;
        debug!("Uploaded {} as {}", path.display(), file.name);
        Ok(file)
    }

    async fn create_batch(&self, display_name: &str, body: &Value) -> Result<String, SubmissionError> {
        let url = format!(
            "{}/models/{}:batchGenerateContent",
            self.base_url, self.model
        );

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", self.api_key.expose_secret())
            .json(body)
            .send()
            .await
            .map_err(|e| SubmissionError::Request(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| SubmissionError::Request(e.to_string()))?;

        if !status.is_success() {
            return Err(SubmissionError::Rejected {
                status: status.as_u16(),
                body: truncate_body(&text),
            });
        }

        let operation: Value = serde_json::from_str(&text)
            .map_err(|e| SubmissionError::InvalidResponse(e.to_string()))?;
        let name = operation
            .get("name")
            .and_then(Value::as_str)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| {
                SubmissionError::InvalidResponse(format!(
                    "missing batch name in {}",
                    truncate_body(&text)
                ))
            })?;

        info!("Batch {} accepted by provider as {}", display_name, name);
        Ok(name.to_string())
    }

    fn manifest_dir(&self) -> PathBuf {
        self.artifact_dir.join(UPLOAD_MANIFEST_DIR)
    }

    /// Records a submitted batch's uploads so `release` can delete them,
    /// from this process or a later one.
    async fn save_manifest(&self, external_job_id: &str, uploads: &HashMap<String, UploadedFile>) {
        let names: Vec<&str> = uploads.values().map(|f| f.name.as_str()).collect();
        let written = match serde_json::to_vec(&names) {
            Ok(bytes) => write_file(
                &self.manifest_dir(),
                &manifest_file_name(external_job_id),
                &bytes,
            )
            .await
            .map(|_| ()),
            Err(e) => Err(e.to_string()),
        };
        if let Err(e) = written {
            warn!(
                "Uploads of batch {} will not be cleaned up: {}",
                external_job_id, e
            );
        }
    }

    async fn delete_uploads(&self, uploads: &HashMap<String, UploadedFile>) {
        let names: Vec<String> = uploads.values().map(|f| f.name.clone()).collect();
        self.delete_files(&names).await;
    }

    async fn delete_files(&self, names: &[String]) {
        for name in names {
            let url = format!("{}/{}", self.base_url, name);
            match self
                .client
                .delete(&url)
                .header("x-goog-api-key", self.api_key.expose_secret())
                .send()
                .await
            {
                Ok(r) if r.status().is_success() || r.status() == StatusCode::NOT_FOUND => {
                    debug!("Deleted uploaded file {}", name);
                }
                Ok(r) => warn!(
                    "Failed to delete uploaded file {}: HTTP {}",
                    name,
                    r.status().as_u16()
                ),
                Err(e) => warn!("Failed to delete uploaded file {}: {}", name, e),
            }
        }
    }
}

async fn write_file(dir: &Path, file_name: &str, bytes: &[u8]) -> Result<PathBuf, String> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| format!("failed to create '{}': {}", dir.display(), e))?;
    let path = dir.join(file_name);
    tokio::fs::write(&path, bytes)
        .await
        .map_err(|e| format!("failed to write '{}': {}", path.display(), e))?;
    Ok(path)
}

#[async_trait]
impl GenerationClient for GeminiClient {
    async fn submit(&self, items: &[SubmitItem]) -> Result<String, SubmissionError> {
        let display_name = format!("batchgen-{}", Uuid::new_v4());
        let uploads = self.upload_local_sources(items).await?;
        let body = self.build_request(&display_name, items, &uploads);

        debug!(
            "Submitting {} requests as {} ({} uploaded sources)",
            items.len(),
            display_name,
            uploads.len()
        );

        match self.create_batch(&display_name, &body).await {
            Ok(name) => {
                if !uploads.is_empty() {
                    self.save_manifest(&name, &uploads).await;
                }
                Ok(name)
            }
            Err(e) => {
                self.delete_uploads(&uploads).await;
                Err(e)
            }
        }
    }

    async fn poll(&self, external_job_id: &str) -> Result<PollResponse, PollError> {
        let url = format!("{}/{}", self.base_url, external_job_id);

        let response = self
            .client
            .get(&url)
            .header("x-goog-api-key", self.api_key.expose_secret())
            .send()
            .await
            .map_err(|e| PollError::Transient(format!("request failed: {}", e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| PollError::Transient(format!("failed to read response: {}", e)))?;

        if !status.is_success() {
            let message = format!("HTTP {}: {}", status.as_u16(), truncate_body(&text));
            return Err(
                if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                    PollError::Transient(message)
                } else {
                    PollError::Permanent(message)
                },
            );
        }

        let operation: Value = serde_json::from_str(&text)
            .map_err(|e| PollError::Permanent(format!("malformed batch operation: {}", e)))?;
        let parsed = parse_operation(&operation)?;

        let mut items = Vec::with_capacity(parsed.items.len());
        for (item_id, outcome) in parsed.items {
            let result = match outcome {
                ParsedOutcome::Failed(detail) => ItemResult::failed(item_id, detail),
                ParsedOutcome::Image(image) => match self.write_artifact(&item_id, &image).await {
                    Ok(path) => ItemResult::completed(item_id, path.to_string_lossy()),
                    Err(ArtifactError::Decode(detail)) => ItemResult::failed(item_id, detail),
                    Err(ArtifactError::Io(e)) => return Err(PollError::Transient(e)),
                },
            };
            items.push(result);
        }

        Ok(PollResponse {
            provider_status: parsed.status,
            items,
        })
    }

    async fn release(&self, external_job_id: &str) {
        let path = self.manifest_dir().join(manifest_file_name(external_job_id));
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                warn!("Failed to read upload manifest '{}': {}", path.display(), e);
                return;
            }
        };
        let names: Vec<String> = match serde_json::from_slice(&bytes) {
            Ok(names) => names,
            Err(e) => {
                warn!("Ignoring corrupt upload manifest '{}': {}", path.display(), e);
                return;
            }
        };

        self.delete_files(&names).await;
        if let Err(e) = tokio::fs::remove_file(&path).await {
            warn!("Failed to remove upload manifest '{}': {}", path.display(), e);
        }
        info!(
            "Released {} uploaded sources of batch {}",
            names.len(),
            external_job_id
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const ITEM_A: &str = "9b2f6a0e-3c4d-4e5f-8a6b-7c8d9e0f1a2b";
    const ITEM_B: &str = "1d5e8c3a-0b7f-4a2e-9c6d-2f4b8e1a3c5d";
    const ITEM_C: &str = "6a7b8c9d-0e1f-4a2b-8c3d-4e5f6a7b8c9d";

    fn client(artifact_dir: &Path) -> GeminiClient {
        let config = ProviderConfig {
            base_url: "http://localhost:9/v1beta/".to_string(),
            artifact_dir: artifact_dir.to_string_lossy().into_owned(),
            prompt_suffix: "Studio lighting".to_string(),
            ..Default::default()
        };
        GeminiClient::new(&config, SecretString::from("test-key".to_string())).unwrap()
    }

    fn mock_client(server: &MockServer, artifact_dir: &Path) -> GeminiClient {
        let config = ProviderConfig {
            base_url: format!("{}/v1beta", server.uri()),
            upload_url: format!("{}/upload/v1beta/files", server.uri()),
            artifact_dir: artifact_dir.to_string_lossy().into_owned(),
            ..Default::default()
        };
        GeminiClient::new(&config, SecretString::from("test-key".to_string())).unwrap()
    }

    fn batch_path() -> String {
        format!(
            "/v1beta/models/{}:batchGenerateContent",
            ProviderConfig::default().model
        )
    }

    fn file_uri(body: &Value, index: usize) -> &Value {
        body.pointer(&format!(
            "/batch/input_config/requests/requests/{}/request/contents/0/parts/1/file_data/file_uri",
            index
        ))
        .unwrap()
    }

    fn item(id: &str, source: &str) -> SubmitItem {
        SubmitItem {
            item_id: id.to_string(),
            prompt: "A walnut desk".to_string(),
            source_reference: source.to_string(),
        }
    }

    #[test]
    fn test_build_request_shape() {
        let dir = tempfile::tempdir().unwrap();
        let client = client(dir.path());
        let body = client.build_request(
            "batchgen-test",
            &[
                item("i1", "https://files.example/desk.png"),
                item("i2", "files/abc"),
            ],
            &HashMap::new(),
        );

        assert_eq!(body["batch"]["display_name"], "batchgen-test");
        let requests = body
            .pointer("/batch/input_config/requests/requests")
            .unwrap()
            .as_array()
            .unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0]["metadata"]["key"], "i1");

        let parts = requests[0].pointer("/request/contents/0/parts").unwrap();
        assert_eq!(parts[0]["text"], "A walnut desk. Studio lighting");
        assert_eq!(parts[1]["file_data"]["mime_type"], "image/png");
        assert_eq!(
            parts[1]["file_data"]["file_uri"],
            "https://files.example/desk.png"
        );
        assert_eq!(
            requests[1].pointer("/request/contents/0/parts/1/file_data/mime_type"),
            Some(&json!("image/jpeg"))
        );

        let config = requests[0].pointer("/request/generation_config").unwrap();
        assert_eq!(config["responseModalities"], json!(["TEXT", "IMAGE"]));
        assert_eq!(config["image_config"]["aspect_ratio"], "3:2");
        assert_eq!(config["image_config"]["image_size"], "2K");
    }

    #[test]
    fn test_map_state() {
        assert_eq!(map_state("BATCH_STATE_PENDING"), ProviderStatus::Pending);
        assert_eq!(map_state("BATCH_STATE_RUNNING"), ProviderStatus::Running);
        assert_eq!(map_state("JOB_STATE_SUCCEEDED"), ProviderStatus::Succeeded);
        assert_eq!(map_state("JOB_STATE_FAILED"), ProviderStatus::Failed);
        assert_eq!(map_state("BATCH_STATE_CANCELLED"), ProviderStatus::Cancelled);
        assert_eq!(map_state("BATCH_STATE_EXPIRED"), ProviderStatus::Expired);
        assert_eq!(map_state("BATCH_STATE_SOMETHING_NEW"), ProviderStatus::Running);
    }

    #[test]
    fn test_parse_running_operation_has_no_items() {
        let op = json!({
            "name": "batches/123",
            "metadata": { "state": "BATCH_STATE_RUNNING" }
        });
        let parsed = parse_operation(&op).unwrap();
        assert_eq!(parsed.status, ProviderStatus::Running);
        assert!(parsed.items.is_empty());
    }

    #[test]
    fn test_parse_succeeded_operation() {
        let op = json!({
            "name": "batches/123",
            "metadata": { "state": "BATCH_STATE_SUCCEEDED" },
            "done": true,
            "response": {
                "inlinedResponses": {
                    "inlinedResponses": [
                        {
                            "metadata": { "key": ITEM_B },
                            "response": {
                                "candidates": [{
                                    "content": { "parts": [
                                        { "text": "Here you go" },
                                        { "inlineData": { "mimeType": "image/png", "data": "aGVsbG8=" } }
                                    ]}
                                }]
                            }
                        },
                        {
                            "metadata": { "key": ITEM_A },
                            "error": { "code": 3, "message": "prompt blocked" }
                        },
                        {
                            "metadata": { "key": ITEM_C },
                            "response": { "candidates": [{ "content": { "parts": [{ "text": "no" }] } }] }
                        },
                        {
                            "metadata": { "key": "../escaped" },
                            "error": { "message": "not ours" }
                        },
                        { "response": {} }
                    ]
                }
            }
        });

        let parsed = parse_operation(&op).unwrap();
        assert_eq!(parsed.status, ProviderStatus::Succeeded);
        assert_eq!(parsed.items.len(), 3);
        assert_eq!(
            parsed.items[0],
            (
                ITEM_B.to_string(),
                ParsedOutcome::Image(InlineImage {
                    mime_type: "image/png".to_string(),
                    data: "aGVsbG8=".to_string()
                })
            )
        );
        assert_eq!(
            parsed.items[1],
            (
                ITEM_A.to_string(),
                ParsedOutcome::Failed("prompt blocked".to_string())
            )
        );
        assert_eq!(
            parsed.items[2],
            (
                ITEM_C.to_string(),
                ParsedOutcome::Failed(NO_IMAGE_DETAIL.to_string())
            )
        );
    }

    #[test]
    fn test_parse_operation_without_state_is_permanent() {
        let err = parse_operation(&json!({ "name": "batches/1" })).unwrap_err();
        assert!(!err.is_transient());

        let failed = parse_operation(&json!({ "error": { "message": "boom" } })).unwrap();
        assert_eq!(failed.status, ProviderStatus::Failed);
    }

    #[test]
    fn test_extension_for() {
        assert_eq!(extension_for("image/png"), "png");
        assert_eq!(extension_for("image/jpeg"), "jpg");
        assert_eq!(extension_for("application/x-unknown-thing"), "bin");
    }

    #[test]
    fn test_truncate_body() {
        let long = "x".repeat(500);
        let truncated = truncate_body(&long);
        assert!(truncated.ends_with("... (truncated)"));
        assert!(truncated.len() < 250);
        assert_eq!(truncate_body("short"), "short");
    }

    #[test]
    fn test_write_artifact_decodes_base64() {
        let dir = tempfile::tempdir().unwrap();
        let client = client(&dir.path().join("artifacts"));
        let rt = tokio::runtime::Runtime::new().unwrap();

        let image = InlineImage {
            mime_type: "image/png".to_string(),
            data: "aGVsbG8=".to_string(),
        };
        let path = rt.block_on(client.write_artifact(ITEM_A, &image)).unwrap();
        assert_eq!(
            path,
            dir.path().join("artifacts").join(format!("{}.png", ITEM_A))
        );
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");

        let bad = InlineImage {
            mime_type: "image/png".to_string(),
            data: "!!!".to_string(),
        };
        let err = rt.block_on(client.write_artifact(ITEM_B, &bad)).unwrap_err();
        assert!(matches!(err, ArtifactError::Decode(_)));
    }

    #[test]
    fn test_write_artifact_refuses_path_keys() {
        let dir = tempfile::tempdir().unwrap();
        let client = client(&dir.path().join("artifacts"));
        let rt = tokio::runtime::Runtime::new().unwrap();

        let image = InlineImage {
            mime_type: "image/png".to_string(),
            data: "aGVsbG8=".to_string(),
        };
        let err = rt
            .block_on(client.write_artifact("../escaped", &image))
            .unwrap_err();
        assert!(matches!(err, ArtifactError::Decode(_)));
        assert!(!dir.path().join("escaped.png").exists());
    }

    #[test]
    fn test_item_keys_must_be_uuids() {
        assert!(is_item_key(ITEM_A));
        assert!(!is_item_key("../escaped"));
        assert!(!is_item_key("i1"));
        assert!(!is_item_key(&ITEM_A.replace('-', "")));
        assert!(!is_item_key(&format!("{{{}}}", ITEM_A)));
    }

    #[test]
    fn test_locate_source() {
        assert_eq!(locate_source("gs://bucket/a.jpg"), SourceLocation::Remote);
        assert_eq!(
            locate_source("https://cdn.example/a.jpg"),
            SourceLocation::Remote
        );
        assert_eq!(locate_source("files/abc123"), SourceLocation::Remote);
        assert_eq!(
            locate_source("/srv/photos/a.jpg"),
            SourceLocation::Local(PathBuf::from("/srv/photos/a.jpg"))
        );
        assert_eq!(
            locate_source("photos/a.jpg"),
            SourceLocation::Local(PathBuf::from("photos/a.jpg"))
        );
    }

    #[test]
    fn test_build_request_uses_uploaded_uri() {
        let dir = tempfile::tempdir().unwrap();
        let client = client(dir.path());
        let mut uploads = HashMap::new();
        uploads.insert(
            ITEM_A.to_string(),
            UploadedFile {
                name: "files/up-1".to_string(),
                uri: "https://files.example/up-1".to_string(),
                mime_type: "image/webp".to_string(),
            },
        );

        let body = client.build_request(
            "batchgen-test",
            &[
                item(ITEM_A, "/srv/photos/desk.webp"),
                item(ITEM_B, "gs://bucket/chair.jpg"),
            ],
            &uploads,
        );

        assert_eq!(file_uri(&body, 0), "https://files.example/up-1");
        assert_eq!(
            body.pointer("/batch/input_config/requests/requests/0/request/contents/0/parts/1/file_data/mime_type"),
            Some(&json!("image/webp"))
        );
        assert_eq!(file_uri(&body, 1), "gs://bucket/chair.jpg");
    }

    #[tokio::test]
    async fn test_submit_uploads_local_sources() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/upload/v1beta/files"))
            .and(query_param("uploadType", "media"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "file": {
                    "name": "files/up-1",
                    "uri": "https://files.example/up-1",
                    "mimeType": "image/png"
                }
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(batch_path()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "name": "batches/42" })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/v1beta/files/up-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("desk.png");
        std::fs::write(&source, b"png-bytes").unwrap();
        let client = mock_client(&server, &dir.path().join("artifacts"));

        let name = client
            .submit(&[
                item(ITEM_A, &source.to_string_lossy()),
                item(ITEM_B, "gs://bucket/chair.jpg"),
            ])
            .await
            .unwrap();
        assert_eq!(name, "batches/42");

        let received = server.received_requests().await.unwrap();
        let upload = received
            .iter()
            .find(|r| r.url.path() == "/upload/v1beta/files")
            .unwrap();
        assert_eq!(upload.body, b"png-bytes");
        let batch = received
            .iter()
            .find(|r| r.url.path() == batch_path())
            .unwrap();
        let body: Value = serde_json::from_slice(&batch.body).unwrap();
        assert_eq!(file_uri(&body, 0), "https://files.example/up-1");
        assert_eq!(file_uri(&body, 1), "gs://bucket/chair.jpg");

        let manifest = dir
            .path()
            .join("artifacts")
            .join(".uploads")
            .join("batches_42.json");
        assert!(manifest.exists());

        client.release("batches/42").await;
        assert!(!manifest.exists());
        // Nothing left to delete the second time.
        client.release("batches/42").await;
    }

    #[tokio::test]
    async fn test_refused_upload_deletes_earlier_uploads() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/upload/v1beta/files"))
            .and(body_string("second"))
            .respond_with(ResponseTemplate::new(400).set_body_string("unsupported image"))
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/upload/v1beta/files"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "file": { "name": "files/up-1", "uri": "https://files.example/up-1" }
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(batch_path()))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/v1beta/files/up-1"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first.png");
        let second = dir.path().join("second.png");
        std::fs::write(&first, "first").unwrap();
        std::fs::write(&second, "second").unwrap();
        let client = mock_client(&server, &dir.path().join("artifacts"));

        let err = client
            .submit(&[
                item(ITEM_A, &first.to_string_lossy()),
                item(ITEM_B, &second.to_string_lossy()),
            ])
            .await
            .unwrap_err();
        match err {
            SubmissionError::InvalidSource { item_id, reason } => {
                assert_eq!(item_id, ITEM_B);
                assert!(reason.contains("HTTP 400"));
            }
            other => panic!("expected InvalidSource, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_submit_missing_local_source_is_invalid_source() {
        let dir = tempfile::tempdir().unwrap();
        let client = client(dir.path());
        let missing = dir.path().join("missing.png");

        let err = client
            .submit(&[
                item(ITEM_A, "gs://bucket/a.jpg"),
                item(ITEM_B, &missing.to_string_lossy()),
            ])
            .await
            .unwrap_err();
        assert!(
            matches!(err, SubmissionError::InvalidSource { ref item_id, .. } if item_id == ITEM_B)
        );
    }

    #[tokio::test]
    async fn test_poll_never_writes_foreign_keys() {
        let server = MockServer::start().await;
        let image = |key: &str| {
            json!({
                "metadata": { "key": key },
                "response": { "candidates": [{ "content": { "parts": [
                    { "inlineData": { "mimeType": "image/png", "data": "aGVsbG8=" } }
                ]}}]}
            })
        };
        Mock::given(method("GET"))
            .and(path("/v1beta/batches/7"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "batches/7",
                "metadata": { "state": "BATCH_STATE_SUCCEEDED" },
                "response": { "inlinedResponses": { "inlinedResponses": [
                    image("../escaped"),
                    image(ITEM_A)
                ]}}
            })))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let artifacts = dir.path().join("artifacts");
        let client = mock_client(&server, &artifacts);

        let response = client.poll("batches/7").await.unwrap();
        assert_eq!(response.provider_status, ProviderStatus::Succeeded);
        assert_eq!(
            response.items,
            vec![ItemResult::completed(
                ITEM_A,
                artifacts.join(format!("{}.png", ITEM_A)).to_string_lossy()
            )]
        );
        assert!(!dir.path().join("escaped.png").exists());
    }

    #[test]
    fn test_poll_unreachable_host_is_transient() {
        let dir = tempfile::tempdir().unwrap();
        let client = client(dir.path());
        let rt = tokio::runtime::Runtime::new().unwrap();
        let err = rt.block_on(client.poll("batches/1")).unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_submit_unreachable_host_is_request_error() {
        let dir = tempfile::tempdir().unwrap();
        let client = client(dir.path());
        let rt = tokio::runtime::Runtime::new().unwrap();
        let err = rt
            .block_on(client.submit(&[item("i1", "files/a")]))
            .unwrap_err();
        assert!(matches!(err, SubmissionError::Request(_)));
    }
}
