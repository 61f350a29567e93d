use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::stats::SessionStats;
use crate::audio::{
    wav_duration_ms, AudioBackend, AudioCapturer, CaptureConfig, CaptureEvent, CaptureState,
};
use crate::config::Config;
use crate::store::{ChunkStore, SessionRecord, UploadStatus};
use crate::upload::{AssistantClient, UploadCoordinator, RESULT_TYPES};

/// Ties the capture lifecycle to the upload lifecycle and to the remote
/// analysis trigger. One recording session is active at a time; the
/// upload queue outlives it.
pub struct SessionController {
    capture_config: CaptureConfig,
    automatic_max_retries: u32,
    store: Arc<ChunkStore>,
    coordinator: Arc<UploadCoordinator>,
    client: Arc<AssistantClient>,
    active: Mutex<Option<ActiveSession>>,
}

struct ActiveSession {
    session_id: String,
    capturer: AudioCapturer,
    pump: JoinHandle<()>,
}

impl SessionController {
    pub fn new(
        config: &Config,
        store: Arc<ChunkStore>,
        coordinator: Arc<UploadCoordinator>,
        client: Arc<AssistantClient>,
    ) -> Self {
        Self {
            capture_config: CaptureConfig {
                recordings_path: config.audio.recordings_path.clone().into(),
                sample_rate: config.audio.sample_rate,
                channels: config.audio.channels,
                max_chunk_ms: config.audio.chunk_duration_secs * 1000,
            },
            automatic_max_retries: config.upload.automatic_max_retries,
            store,
            coordinator,
            client,
            active: Mutex::new(None),
        }
    }

    /// Create a session record, start capture, and wire chunk events
    /// into the upload coordinator. Returns the new session id.
    pub async fn start_session(&self, backend: Box<dyn AudioBackend>) -> Result<String> {
        let mut active = self.active.lock().await;
        anyhow::ensure!(active.is_none(), "a recording session is already active");

        let session_id = uuid::Uuid::new_v4().to_string();
        self.store.insert_session(&SessionRecord {
            id: session_id.clone(),
            started_at: Utc::now(),
            ended_at: None,
            is_uploaded: false,
        })?;

        let mut capturer = AudioCapturer::new(self.capture_config.clone(), backend);
        let mut events = match capturer.start(&session_id).await {
            Ok(events) => events,
            Err(e) => {
                // No recording ever existed; drop the fresh session row.
                let _ = self.store.delete_session(&session_id);
                return Err(e).context("Failed to start audio capture");
            }
        };

        let coordinator = Arc::clone(&self.coordinator);
        let pump_session = session_id.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    CaptureEvent::ChunkFinished { chunk, is_last } => {
                        coordinator.submit(&chunk, is_last);
                    }
                    CaptureEvent::ChunkStarted(chunk) => {
                        debug!(
                            "Chunk {} started for session {}",
                            chunk.index, chunk.session_id
                        );
                    }
                    // Raw sample batches feed live metering only.
                    CaptureEvent::Samples(_) => {}
                }
            }
            debug!("Event pump finished for session {}", pump_session);
        });

        info!("Recording session started: {}", session_id);
        *active = Some(ActiveSession {
            session_id: session_id.clone(),
            capturer,
            pump,
        });

        Ok(session_id)
    }

    /// Stop capture, wait until the final chunk is queued, then notify
    /// the remote endpoint that the session finished. The notification
    /// is fire-and-forget; delivery gating on "all chunks uploaded"
    /// lives in the coordinator's ordering gate.
    pub async fn stop_session(&self) -> Result<SessionStats> {
        let Some(mut session) = self.active.lock().await.take() else {
            anyhow::bail!("no recording session is active");
        };

        let last_chunk = session.capturer.stop().await?;
        debug!(
            "Capture stopped for session {} (last chunk: {:?})",
            session.session_id, last_chunk
        );

        // The event channel closed with the capture loop; once the pump
        // exits, every finalized chunk has been queued.
        if let Err(e) = session.pump.await {
            error!("Event pump panicked: {}", e);
        }

        self.store.end_session(&session.session_id, Utc::now())?;

        let client = Arc::clone(&self.client);
        let session_id = session.session_id.clone();
        tokio::spawn(async move {
            if let Err(e) = client.analyse(&session_id, None).await {
                warn!(
                    "Session finish notification failed for {} (queue still delivers): {}",
                    session_id, e
                );
            }
        });

        info!("Recording session stopped: {}", session.session_id);
        self.session_stats(&session.session_id).await
    }

    /// Finalize and enqueue the current chunk as a normal chunk; capture
    /// stays suspended until `resume_session`.
    pub async fn pause_session(&self) -> Result<()> {
        let active = self.active.lock().await;
        let session = active
            .as_ref()
            .context("no recording session is active")?;
        session.capturer.pause().await?;
        info!("Recording session paused: {}", session.session_id);
        Ok(())
    }

    pub async fn resume_session(&self) -> Result<()> {
        let active = self.active.lock().await;
        let session = active
            .as_ref()
            .context("no recording session is active")?;
        session.capturer.resume().await?;
        info!("Recording session resumed: {}", session.session_id);
        Ok(())
    }

    /// Cumulative active capture duration of the live session.
    pub async fn recorded_time(&self) -> u64 {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|s| s.capturer.recorded_time())
            .unwrap_or(0)
    }

    pub async fn capture_state(&self) -> CaptureState {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|s| s.capturer.state())
            .unwrap_or(CaptureState::Idle)
    }

    pub async fn active_session_id(&self) -> Option<String> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|s| s.session_id.clone())
    }

    /// Crash recovery: release stale claims and re-run the drain, then
    /// retry failures under the automatic (effectively unbounded) limit.
    pub async fn recover(&self) -> Result<()> {
        let released = self.store.reset_in_progress()?;
        if released > 0 {
            info!("Released {} stale upload claims", released);
        }

        let drained = self.coordinator.drain_pending().await?;
        let retried = self.coordinator.retry_failed(self.automatic_max_retries).await?;
        debug!(
            "Recovery sweep: {} uploaded, {} failed, {} deferred",
            drained.completed + retried.completed,
            drained.failed + retried.failed,
            drained.deferred + retried.deferred
        );
        Ok(())
    }

    /// Stats for any session, live or historical. Duration is the sum of
    /// finalized chunk durations, never `ended_at - started_at`.
    pub async fn session_stats(&self, session_id: &str) -> Result<SessionStats> {
        let session = self
            .store
            .session(session_id)?
            .with_context(|| format!("unknown session: {session_id}"))?;

        let records = self.store.records_for_session(session_id)?;

        let mut duration_ms = 0u64;
        let mut completed = 0usize;
        let mut pending = 0usize;
        let mut failed = 0usize;
        for record in &records {
            match record.status {
                UploadStatus::Completed => completed += 1,
                UploadStatus::Pending | UploadStatus::InProgress => pending += 1,
                UploadStatus::Failed => failed += 1,
            }
            if record.file_path.exists() {
                duration_ms += wav_duration_ms(&record.file_path).unwrap_or(0);
            }
        }

        let is_recording = self
            .active
            .lock()
            .await
            .as_ref()
            .map(|s| s.session_id == session_id)
            .unwrap_or(false);

        Ok(SessionStats {
            session_id: session.id,
            is_recording,
            started_at: session.started_at,
            ended_at: session.ended_at,
            duration_ms,
            chunk_count: records.len(),
            chunks_completed: completed,
            chunks_pending: pending,
            chunks_failed: failed,
            is_uploaded: session.is_uploaded,
        })
    }

    /// Fetch result artifacts, serving from the local cache first and
    /// downloading (then caching) anything missing. With `local_only`,
    /// only cached content is returned.
    pub async fn fetch_results(
        &self,
        session_id: &str,
        result_types: &[String],
        local_only: bool,
    ) -> Result<Vec<(String, String)>> {
        let mut results = Vec::new();
        let mut missing = Vec::new();

        for result_type in result_types {
            match self.store.cached_result(session_id, result_type)? {
                Some(content) => results.push((result_type.clone(), content)),
                None => missing.push(result_type.clone()),
            }
        }

        if local_only || missing.is_empty() {
            return Ok(results);
        }

        for result_type in missing {
            match self.client.download_result(session_id, &result_type).await {
                Ok(content) => {
                    self.store.store_result(session_id, &result_type, &content)?;
                    results.push((result_type, content));
                }
                Err(e) => {
                    warn!(
                        "Failed to download {} for session {}: {}",
                        result_type, session_id, e
                    );
                }
            }
        }

        Ok(results)
    }

    /// Readiness of each result type on the server.
    pub async fn processing_status(&self, session_id: &str) -> Result<HashMap<String, bool>> {
        self.client.status(session_id).await
    }

    /// Default result types produced by the assistant.
    pub fn default_result_types() -> Vec<String> {
        RESULT_TYPES.iter().map(|s| s.to_string()).collect()
    }

    /// User-initiated deletion; cascades to queue records, cached
    /// results, and chunk files.
    pub fn delete_session(&self, session_id: &str) -> Result<()> {
        self.store.delete_session(session_id)
    }

    pub fn sessions(&self) -> Result<Vec<SessionRecord>> {
        self.store.sessions()
    }
}
