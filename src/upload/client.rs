use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

use crate::error::UploadError;

/// Result artifacts the assistant produces for a finished session.
pub const RESULT_TYPES: &[&str] = &["transcript", "summary", "tasks", "decisions"];

#[derive(Debug, Deserialize)]
pub struct ChunkUploadResponse {
    pub message: String,
    pub session_id: String,
    pub chunk_index: u32,
    pub is_last_chunk: bool,
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    status: String,
}

/// HTTP client for the assistant endpoint.
///
/// All calls use bounded connect/request timeouts; a timeout surfaces as
/// a transport error and follows the normal retry path.
#[derive(Debug, Clone)]
pub struct AssistantClient {
    base_url: String,
    http: reqwest::Client,
}

impl AssistantClient {
    pub fn new(
        base_url: &str,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// POST /{session_id}/upload-chunk?chunk_index={n}&is_last_chunk={bool}
    /// with multipart field `chunk` = chunk file bytes.
    pub async fn upload_chunk(
        &self,
        session_id: &str,
        chunk_index: u32,
        is_last_chunk: bool,
        path: &Path,
    ) -> Result<ChunkUploadResponse, UploadError> {
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                UploadError::FileMissing(path.to_path_buf())
            } else {
                UploadError::FileRead(e)
            }
        })?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "chunk.wav".to_string());

        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("audio/wav")?;
        let form = reqwest::multipart::Form::new().part("chunk", part);

        let url = format!("{}/{}/upload-chunk", self.base_url, session_id);
        debug!(
            "Uploading chunk {} of session {} (last={})",
            chunk_index, session_id, is_last_chunk
        );

        let response = self
            .http
            .post(&url)
            .query(&[
                ("chunk_index", chunk_index.to_string()),
                ("is_last_chunk", is_last_chunk.to_string()),
            ])
            .multipart(form)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(UploadError::Rejected { status, body });
        }

        Ok(response.json().await?)
    }

    /// POST /{session_id}/analyse — trigger server-side processing.
    /// Prompts, when given, are a map of prompt-label to prompt-text.
    pub async fn analyse(
        &self,
        session_id: &str,
        prompts: Option<&HashMap<String, String>>,
    ) -> Result<()> {
        let url = format!("{}/{}/analyse", self.base_url, session_id);
        let mut request = self.http.post(&url);
        if let Some(prompts) = prompts {
            request = request.json(prompts);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to notify analyse for session {session_id}"))?;

        anyhow::ensure!(
            response.status().is_success(),
            "analyse for session {} rejected with status {}",
            session_id,
            response.status()
        );
        Ok(())
    }

    /// GET /{session_id}/status — map of result-type to readiness.
    pub async fn status(&self, session_id: &str) -> Result<HashMap<String, bool>> {
        let url = format!("{}/{}/status", self.base_url, session_id);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to query status for session {session_id}"))?
            .error_for_status()
            .with_context(|| format!("Status query rejected for session {session_id}"))?;

        Ok(response.json().await?)
    }

    /// GET /{session_id}/download?type={result_type} — raw text content
    /// of one result artifact.
    pub async fn download_result(&self, session_id: &str, result_type: &str) -> Result<String> {
        let url = format!("{}/{}/download", self.base_url, session_id);
        let response = self
            .http
            .get(&url)
            .query(&[("type", result_type)])
            .send()
            .await
            .with_context(|| format!("Failed to download {result_type} for {session_id}"))?
            .error_for_status()
            .with_context(|| format!("Download of {result_type} rejected for {session_id}"))?;

        Ok(response.text().await?)
    }

    /// GET /health — liveness probe.
    pub async fn health(&self) -> Result<()> {
        let url = format!("{}/health", self.base_url);
        let response: HealthResponse = self
            .http
            .get(&url)
            .send()
            .await
            .context("Failed to reach assistant endpoint")?
            .error_for_status()
            .context("Health probe rejected")?
            .json()
            .await?;

        anyhow::ensure!(
            response.status == "ok",
            "assistant endpoint unhealthy: {}",
            response.status
        );
        Ok(())
    }
}
