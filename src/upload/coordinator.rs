use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::client::AssistantClient;
use crate::audio::Chunk;
use crate::config::UploadConfig;
use crate::error::UploadError;
use crate::store::{ChunkStore, UploadStatus};

/// Outcome of a single upload pass over one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Uploaded and marked Completed.
    Completed,
    /// Last-chunk upload postponed because an earlier chunk of the
    /// session is not Completed yet. Not a failure: the record stays
    /// Pending and no retry is consumed.
    Deferred,
    /// Transport or server failure; retry count incremented.
    Failed,
    /// Backing file gone; record deleted, never retried.
    FileMissing,
    /// Record absent, already handled, or claimed by another worker.
    Skipped,
}

/// Counts from one drain or retry sweep.
#[derive(Debug, Clone, Copy, Default)]
pub struct SweepSummary {
    pub completed: usize,
    pub failed: usize,
    pub deferred: usize,
}

impl SweepSummary {
    fn add(&mut self, outcome: UploadOutcome) {
        match outcome {
            UploadOutcome::Completed => self.completed += 1,
            UploadOutcome::Failed => self.failed += 1,
            UploadOutcome::Deferred => self.deferred += 1,
            UploadOutcome::FileMissing | UploadOutcome::Skipped => {}
        }
    }
}

/// Drains the chunk store against the assistant endpoint, respecting
/// per-session ordering and driving retry.
pub struct UploadCoordinator {
    store: Arc<ChunkStore>,
    client: Arc<AssistantClient>,
    sweep_interval: Duration,
    max_sweep_interval: Duration,
}

impl UploadCoordinator {
    pub fn new(
        store: Arc<ChunkStore>,
        client: Arc<AssistantClient>,
        config: &UploadConfig,
    ) -> Self {
        Self {
            store,
            client,
            sweep_interval: Duration::from_secs(config.sweep_interval_secs),
            max_sweep_interval: Duration::from_secs(config.max_sweep_interval_secs),
        }
    }

    /// Enqueue a finalized chunk, then attempt one upload pass in the
    /// background. Never surfaces errors to the caller; the store is the
    /// observable outcome.
    pub fn submit(self: &Arc<Self>, chunk: &Chunk, is_last_chunk: bool) {
        let record_id = match self.store.enqueue(chunk, is_last_chunk) {
            Ok(id) => id,
            Err(e) => {
                error!(
                    "Failed to enqueue chunk {} of session {}: {}",
                    chunk.index, chunk.session_id, e
                );
                return;
            }
        };

        debug!(
            "Queued chunk {} of session {} (last={})",
            chunk.index, chunk.session_id, is_last_chunk
        );

        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = coordinator.process_record(record_id).await {
                error!("Upload pass for record {} errored: {}", record_id, e);
            }
        });
    }

    /// Attempt every Pending record in creation order. Run at process
    /// start and from the periodic sweeper.
    pub async fn drain_pending(&self) -> Result<SweepSummary> {
        let mut summary = SweepSummary::default();
        for record in self.store.pending_records()? {
            summary.add(self.process_record(record.id).await?);
        }
        Ok(summary)
    }

    /// Re-attempt every Failed record whose retry count is below the
    /// threshold. Records at or above it stay Failed and are surfaced
    /// through `ChunkStore::permanently_failed`.
    pub async fn retry_failed(&self, max_retries: u32) -> Result<SweepSummary> {
        let mut summary = SweepSummary::default();
        for record in self.store.failed_records(max_retries)? {
            self.store.reset_pending(record.id)?;
            summary.add(self.process_record(record.id).await?);
        }
        Ok(summary)
    }

    /// One drain plus one retry pass; returns the number of failures.
    pub async fn sweep(&self, max_retries: u32) -> Result<usize> {
        let drained = self.drain_pending().await?;
        let retried = self.retry_failed(max_retries).await?;
        Ok(drained.failed + retried.failed)
    }

    /// Periodic background sweeper. The delay between sweeps grows
    /// linearly while failures persist (bounded by the configured
    /// maximum) and resets once a sweep is clean.
    pub fn spawn_sweeper(self: &Arc<Self>, max_retries: u32) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let min = coordinator.sweep_interval;
            let max = coordinator.max_sweep_interval.max(min);
            let mut delay = min;

            loop {
                tokio::time::sleep(delay).await;
                let failures = match coordinator.sweep(max_retries).await {
                    Ok(n) => n,
                    Err(e) => {
                        error!("Upload sweep errored: {}", e);
                        1
                    }
                };
                delay = if failures > 0 {
                    (delay + min).min(max)
                } else {
                    min
                };
            }
        })
    }

    /// One upload pass over one record.
    ///
    /// The ordering gate is re-evaluated on every attempt: a last-chunk
    /// record is deferred while any lower-indexed record of its session
    /// is not Completed, so the terminal notification to the endpoint
    /// never overtakes earlier chunks.
    pub async fn process_record(&self, record_id: i64) -> Result<UploadOutcome> {
        let Some(record) = self.store.record(record_id)? else {
            return Ok(UploadOutcome::Skipped);
        };

        if record.status != UploadStatus::Pending {
            return Ok(UploadOutcome::Skipped);
        }

        if record.is_last_chunk {
            let blocked = self
                .store
                .records_for_session(&record.session_id)?
                .iter()
                .any(|r| {
                    r.chunk_index < record.chunk_index && r.status != UploadStatus::Completed
                });
            if blocked {
                debug!(
                    "Deferring last chunk {} of session {}: earlier chunks incomplete",
                    record.chunk_index, record.session_id
                );
                return Ok(UploadOutcome::Deferred);
            }
        }

        // Claim-then-act: only one worker may move a record to InProgress.
        if !self.store.claim(record_id)? {
            return Ok(UploadOutcome::Skipped);
        }

        if !record.file_path.exists() {
            warn!(
                "Chunk file {:?} is gone; dropping record {} of session {}",
                record.file_path, record.chunk_index, record.session_id
            );
            self.store.delete_record(record_id)?;
            return Ok(UploadOutcome::FileMissing);
        }

        match self
            .client
            .upload_chunk(
                &record.session_id,
                record.chunk_index,
                record.is_last_chunk,
                &record.file_path,
            )
            .await
        {
            Ok(response) => {
                self.store.mark_completed(record_id)?;
                if record.is_last_chunk {
                    self.store.mark_session_uploaded(&record.session_id)?;
                    info!("Session {} fully uploaded", record.session_id);
                }
                debug!(
                    "Uploaded chunk {} of session {}: {}",
                    response.chunk_index, response.session_id, response.message
                );
                Ok(UploadOutcome::Completed)
            }
            Err(UploadError::FileMissing(path)) => {
                warn!(
                    "Chunk file {:?} vanished mid-upload; dropping record {}",
                    path, record_id
                );
                self.store.delete_record(record_id)?;
                Ok(UploadOutcome::FileMissing)
            }
            Err(e) => {
                warn!(
                    "Upload of chunk {} for session {} failed (attempt {}): {}",
                    record.chunk_index,
                    record.session_id,
                    record.retry_count + 1,
                    e
                );
                self.store.mark_failed(record_id)?;
                Ok(UploadOutcome::Failed)
            }
        }
    }
}
