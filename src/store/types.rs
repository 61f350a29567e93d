use std::path::PathBuf;

use chrono::{DateTime, Utc};

/// Status of a queued chunk upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStatus {
    Pending,
    InProgress,
    Failed,
    Completed,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Pending => "pending",
            UploadStatus::InProgress => "in_progress",
            UploadStatus::Failed => "failed",
            UploadStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(UploadStatus::Pending),
            "in_progress" => Some(UploadStatus::InProgress),
            "failed" => Some(UploadStatus::Failed),
            "completed" => Some(UploadStatus::Completed),
            _ => None,
        }
    }
}

/// One durable upload unit: a finalized chunk awaiting delivery.
///
/// The record and the file it points at are a single unit; a missing
/// file is a handled condition that removes the record.
#[derive(Debug, Clone)]
pub struct ChunkUploadRecord {
    pub id: i64,
    pub session_id: String,
    pub chunk_index: u32,
    pub is_last_chunk: bool,
    pub file_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
    pub status: UploadStatus,
}

/// A recording session as persisted.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Set when the session's last chunk completes its upload.
    pub is_uploaded: bool,
}

/// A cached result artifact downloaded from the assistant endpoint.
#[derive(Debug, Clone)]
pub struct CachedResult {
    pub session_id: String,
    pub result_type: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}
