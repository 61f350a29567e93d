use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, warn};

use super::types::{CachedResult, ChunkUploadRecord, SessionRecord, UploadStatus};
use crate::audio::Chunk;

/// Durable, crash-safe record of every chunk produced and its upload
/// state. The single shared mutable resource of the upload pipeline;
/// every status transition is one atomic SQL statement.
pub struct ChunkStore {
    conn: Mutex<Connection>,
}

impl ChunkStore {
    /// Open (or create) the store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create store directory {:?}", parent))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open chunk store at {:?}", path))?;
        Self::init(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.execute("PRAGMA foreign_keys = ON", [])?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS recording_sessions (
                id TEXT PRIMARY KEY,
                started_at TEXT NOT NULL,
                ended_at TEXT,
                is_uploaded INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS chunk_upload_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                is_last_chunk INTEGER NOT NULL DEFAULT 0,
                file_path TEXT NOT NULL,
                created_at TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'pending',
                UNIQUE(session_id, chunk_index)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS recording_results (
                session_id TEXT NOT NULL,
                result_type TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (session_id, result_type)
            )",
            [],
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ========================================================================
    // Upload queue
    // ========================================================================

    /// Insert a Pending record for a finalized chunk, replacing any
    /// existing record for the same (session, index). Idempotent under
    /// retry-from-crash.
    pub fn enqueue(&self, chunk: &Chunk, is_last_chunk: bool) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO chunk_upload_queue
                 (session_id, chunk_index, is_last_chunk, file_path, created_at, retry_count, status)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, 'pending')",
            params![
                chunk.session_id,
                chunk.index,
                is_last_chunk,
                chunk.file_path.to_string_lossy().into_owned(),
                Utc::now(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Oldest Pending record by creation order (FIFO), or None.
    pub fn next_pending(&self) -> Result<Option<ChunkUploadRecord>> {
        let conn = self.conn.lock().unwrap();
        let record = conn
            .query_row(
                &format!(
                    "{SELECT_RECORD} WHERE status = 'pending'
                     ORDER BY created_at ASC, id ASC LIMIT 1"
                ),
                [],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// All Pending records in creation order.
    pub fn pending_records(&self) -> Result<Vec<ChunkUploadRecord>> {
        self.query_records(
            &format!(
                "{SELECT_RECORD} WHERE status = 'pending'
                 ORDER BY created_at ASC, id ASC"
            ),
            [],
        )
    }

    /// Failed records still below the retry threshold.
    pub fn failed_records(&self, max_retries: u32) -> Result<Vec<ChunkUploadRecord>> {
        self.query_records(
            &format!(
                "{SELECT_RECORD} WHERE status = 'failed' AND retry_count < ?1
                 ORDER BY created_at ASC, id ASC"
            ),
            params![max_retries],
        )
    }

    /// Failed records at or above the retry threshold; surfaced to the
    /// caller for manual retry, never dropped silently.
    pub fn permanently_failed(&self, max_retries: u32) -> Result<Vec<ChunkUploadRecord>> {
        self.query_records(
            &format!(
                "{SELECT_RECORD} WHERE status = 'failed' AND retry_count >= ?1
                 ORDER BY created_at ASC, id ASC"
            ),
            params![max_retries],
        )
    }

    /// Full queue history for a session, ordered by chunk index.
    pub fn records_for_session(&self, session_id: &str) -> Result<Vec<ChunkUploadRecord>> {
        self.query_records(
            &format!("{SELECT_RECORD} WHERE session_id = ?1 ORDER BY chunk_index ASC"),
            params![session_id],
        )
    }

    pub fn record(&self, id: i64) -> Result<Option<ChunkUploadRecord>> {
        let conn = self.conn.lock().unwrap();
        let record = conn
            .query_row(
                &format!("{SELECT_RECORD} WHERE id = ?1"),
                params![id],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Atomically claim a Pending record for upload. At most one caller
    /// wins; everyone else sees `false`.
    pub fn claim(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE chunk_upload_queue SET status = 'in_progress'
             WHERE id = ?1 AND status = 'pending'",
            params![id],
        )?;
        Ok(changed == 1)
    }

    pub fn mark_completed(&self, id: i64) -> Result<()> {
        self.set_status(id, UploadStatus::Completed)
    }

    /// Record a failed attempt: one retry-count increment, status Failed.
    pub fn mark_failed(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE chunk_upload_queue
             SET retry_count = retry_count + 1, status = 'failed'
             WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    /// Reset a record to Pending for another attempt.
    pub fn reset_pending(&self, id: i64) -> Result<()> {
        self.set_status(id, UploadStatus::Pending)
    }

    /// Number of records currently in the given status.
    pub fn count_with_status(&self, status: UploadStatus) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM chunk_upload_queue WHERE status = ?1",
            params![status.as_str()],
            |row| row.get::<_, u64>(0),
        )?;
        Ok(count)
    }

    /// Release stale claims left behind by a crashed process. Run at
    /// startup, before the first drain: no worker can legitimately hold
    /// an InProgress claim across a restart.
    pub fn reset_in_progress(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE chunk_upload_queue SET status = 'pending'
             WHERE status = 'in_progress'",
            [],
        )?;
        Ok(changed)
    }

    pub fn delete_record(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM chunk_upload_queue WHERE id = ?1", params![id])?;
        Ok(())
    }

    fn set_status(&self, id: i64, status: UploadStatus) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE chunk_upload_queue SET status = ?2 WHERE id = ?1",
            params![id, status.as_str()],
        )?;
        Ok(())
    }

    fn query_records<P: rusqlite::Params>(
        &self,
        sql: &str,
        params: P,
    ) -> Result<Vec<ChunkUploadRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(sql)?;
        let records = stmt
            .query_map(params, row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    pub fn insert_session(&self, session: &SessionRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO recording_sessions (id, started_at, ended_at, is_uploaded)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                session.id,
                session.started_at,
                session.ended_at,
                session.is_uploaded,
            ],
        )?;
        Ok(())
    }

    pub fn end_session(&self, session_id: &str, ended_at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE recording_sessions SET ended_at = ?2 WHERE id = ?1",
            params![session_id, ended_at],
        )?;
        Ok(())
    }

    pub fn mark_session_uploaded(&self, session_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE recording_sessions SET is_uploaded = 1 WHERE id = ?1",
            params![session_id],
        )?;
        Ok(())
    }

    pub fn session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let conn = self.conn.lock().unwrap();
        let session = conn
            .query_row(
                "SELECT id, started_at, ended_at, is_uploaded
                 FROM recording_sessions WHERE id = ?1",
                params![session_id],
                row_to_session,
            )
            .optional()?;
        Ok(session)
    }

    pub fn sessions(&self) -> Result<Vec<SessionRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, started_at, ended_at, is_uploaded
             FROM recording_sessions ORDER BY started_at DESC",
        )?;
        let sessions = stmt
            .query_map([], row_to_session)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(sessions)
    }

    /// User-initiated deletion: removes the session, its queue records,
    /// cached results, and chunk files on disk (best effort).
    pub fn delete_session(&self, session_id: &str) -> Result<()> {
        let file_paths: Vec<String> = {
            let conn = self.conn.lock().unwrap();
            let mut stmt =
                conn.prepare("SELECT file_path FROM chunk_upload_queue WHERE session_id = ?1")?;
            let paths = stmt
                .query_map(params![session_id], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            conn.execute(
                "DELETE FROM chunk_upload_queue WHERE session_id = ?1",
                params![session_id],
            )?;
            conn.execute(
                "DELETE FROM recording_results WHERE session_id = ?1",
                params![session_id],
            )?;
            conn.execute(
                "DELETE FROM recording_sessions WHERE id = ?1",
                params![session_id],
            )?;
            paths
        };

        for path in file_paths {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove chunk file {}: {}", path, e);
                }
            }
        }

        debug!("Deleted session {}", session_id);
        Ok(())
    }

    // ========================================================================
    // Cached results
    // ========================================================================

    pub fn store_result(&self, session_id: &str, result_type: &str, content: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO recording_results
                 (session_id, result_type, content, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![session_id, result_type, content, Utc::now()],
        )?;
        Ok(())
    }

    pub fn cached_result(&self, session_id: &str, result_type: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let content = conn
            .query_row(
                "SELECT content FROM recording_results
                 WHERE session_id = ?1 AND result_type = ?2",
                params![session_id, result_type],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(content)
    }

    pub fn results_for_session(&self, session_id: &str) -> Result<Vec<CachedResult>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT session_id, result_type, content, created_at
             FROM recording_results WHERE session_id = ?1 ORDER BY result_type ASC",
        )?;
        let results = stmt
            .query_map(params![session_id], |row| {
                Ok(CachedResult {
                    session_id: row.get(0)?,
                    result_type: row.get(1)?,
                    content: row.get(2)?,
                    created_at: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(results)
    }
}

const SELECT_RECORD: &str = "SELECT id, session_id, chunk_index, is_last_chunk, file_path,
         created_at, retry_count, status
     FROM chunk_upload_queue";

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<ChunkUploadRecord> {
    let status_str = row.get::<_, String>(7)?;
    let status = UploadStatus::parse(&status_str).ok_or_else(|| {
        rusqlite::Error::InvalidParameterName(format!("unknown upload status: {status_str}"))
    })?;

    Ok(ChunkUploadRecord {
        id: row.get(0)?,
        session_id: row.get(1)?,
        chunk_index: row.get(2)?,
        is_last_chunk: row.get(3)?,
        file_path: row.get::<_, String>(4)?.into(),
        created_at: row.get(5)?,
        retry_count: row.get(6)?,
        status,
    })
}

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<SessionRecord> {
    Ok(SessionRecord {
        id: row.get(0)?,
        started_at: row.get(1)?,
        ended_at: row.get(2)?,
        is_uploaded: row.get(3)?,
    })
}
