use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Statistics about a recording session, derived from the store and the
/// chunk files on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStats {
    pub session_id: String,

    /// Whether this session is the controller's active recording
    pub is_recording: bool,

    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,

    /// Recorded duration in milliseconds, summed over finalized chunk
    /// files. Pauses produce gaps between chunks and do not count.
    pub duration_ms: u64,

    /// Queue status breakdown for the session's chunks
    pub chunk_count: usize,
    pub chunks_completed: usize,
    pub chunks_pending: usize,
    pub chunks_failed: usize,

    /// Set once the last chunk's upload completed
    pub is_uploaded: bool,
}

impl SessionStats {
    pub fn formatted_duration(&self) -> String {
        let total_secs = self.duration_ms / 1000;
        let seconds = total_secs % 60;
        let minutes = (total_secs / 60) % 60;
        let hours = total_secs / 3600;
        if hours > 0 {
            format!("{hours:02}:{minutes:02}:{seconds:02}")
        } else {
            format!("{minutes:02}:{seconds:02}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(duration_ms: u64) -> SessionStats {
        SessionStats {
            session_id: "s".to_string(),
            is_recording: false,
            started_at: Utc::now(),
            ended_at: None,
            duration_ms,
            chunk_count: 0,
            chunks_completed: 0,
            chunks_pending: 0,
            chunks_failed: 0,
            is_uploaded: false,
        }
    }

    #[test]
    fn duration_formats_with_and_without_hours() {
        assert_eq!(stats(83_000).formatted_duration(), "01:23");
        assert_eq!(stats(3_723_000).formatted_duration(), "01:02:03");
    }
}
