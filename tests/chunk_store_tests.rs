// Integration tests for the durable upload queue: REPLACE idempotence,
// FIFO ordering, atomic claims, retry accounting, and cascade deletion.

use anyhow::Result;
use chrono::Utc;
use loqa_recorder::audio::Chunk;
use loqa_recorder::store::{ChunkStore, SessionRecord, UploadStatus};
use tempfile::TempDir;

fn chunk(session_id: &str, index: u32, file_path: &std::path::Path) -> Chunk {
    Chunk {
        session_id: session_id.to_string(),
        index,
        started_at: Utc::now(),
        ended_at: Some(Utc::now()),
        file_path: file_path.to_path_buf(),
    }
}

fn session(id: &str) -> SessionRecord {
    SessionRecord {
        id: id.to_string(),
        started_at: Utc::now(),
        ended_at: None,
        is_uploaded: false,
    }
}

#[test]
fn enqueue_is_idempotent_per_session_and_index() -> Result<()> {
    let store = ChunkStore::open_in_memory()?;
    let dir = TempDir::new()?;
    let path = dir.path().join("chunk-000.wav");

    store.enqueue(&chunk("s1", 0, &path), false)?;
    store.enqueue(&chunk("s1", 0, &path), false)?;

    let records = store.records_for_session("s1")?;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].chunk_index, 0);
    assert!(!records[0].is_last_chunk);

    // Re-announcing the same chunk with the last flag replaces the
    // record rather than duplicating it.
    store.enqueue(&chunk("s1", 0, &path), true)?;
    let records = store.records_for_session("s1")?;
    assert_eq!(records.len(), 1);
    assert!(records[0].is_last_chunk);
    assert_eq!(records[0].status, UploadStatus::Pending);

    Ok(())
}

#[test]
fn next_pending_returns_oldest_first() -> Result<()> {
    let store = ChunkStore::open_in_memory()?;
    let dir = TempDir::new()?;

    for i in 0..3u32 {
        let path = dir.path().join(format!("chunk-{i:03}.wav"));
        store.enqueue(&chunk("s1", i, &path), false)?;
    }

    let first = store.next_pending()?.expect("queue is not empty");
    assert_eq!(first.chunk_index, 0);

    store.claim(first.id)?;
    store.mark_completed(first.id)?;

    let second = store.next_pending()?.expect("two records remain");
    assert_eq!(second.chunk_index, 1);

    Ok(())
}

#[test]
fn claim_is_atomic_and_single_winner() -> Result<()> {
    let store = ChunkStore::open_in_memory()?;
    let dir = TempDir::new()?;
    let id = store.enqueue(&chunk("s1", 0, &dir.path().join("c.wav")), false)?;

    assert!(store.claim(id)?);
    assert!(!store.claim(id)?, "second claim must lose");

    let record = store.record(id)?.unwrap();
    assert_eq!(record.status, UploadStatus::InProgress);

    // A completed record can never be claimed again.
    store.mark_completed(id)?;
    assert!(!store.claim(id)?);

    Ok(())
}

#[test]
fn retry_accounting_is_monotonic() -> Result<()> {
    let store = ChunkStore::open_in_memory()?;
    let dir = TempDir::new()?;
    let id = store.enqueue(&chunk("s1", 0, &dir.path().join("c.wav")), false)?;

    store.claim(id)?;
    store.mark_failed(id)?;
    assert_eq!(store.record(id)?.unwrap().retry_count, 1);

    store.reset_pending(id)?;
    store.claim(id)?;
    store.mark_failed(id)?;
    assert_eq!(store.record(id)?.unwrap().retry_count, 2);

    // Below the ceiling it is retryable, at the ceiling it is permanent.
    assert_eq!(store.failed_records(3)?.len(), 1);
    assert!(store.failed_records(2)?.is_empty());
    assert_eq!(store.permanently_failed(2)?.len(), 1);

    Ok(())
}

#[test]
fn stale_claims_are_released_on_recovery() -> Result<()> {
    let store = ChunkStore::open_in_memory()?;
    let dir = TempDir::new()?;
    let id = store.enqueue(&chunk("s1", 0, &dir.path().join("c.wav")), false)?;

    store.claim(id)?;
    assert_eq!(store.count_with_status(UploadStatus::InProgress)?, 1);

    assert_eq!(store.reset_in_progress()?, 1);
    assert_eq!(store.count_with_status(UploadStatus::Pending)?, 1);
    assert!(store.claim(id)?);

    Ok(())
}

#[test]
fn queue_survives_reopen() -> Result<()> {
    let dir = TempDir::new()?;
    let db_path = dir.path().join("queue.db");

    {
        let store = ChunkStore::open(&db_path)?;
        store.insert_session(&session("s1"))?;
        store.enqueue(&chunk("s1", 0, &dir.path().join("c.wav")), true)?;
    }

    let store = ChunkStore::open(&db_path)?;
    let records = store.records_for_session("s1")?;
    assert_eq!(records.len(), 1);
    assert!(records[0].is_last_chunk);
    assert_eq!(records[0].status, UploadStatus::Pending);
    assert!(store.session("s1")?.is_some());

    Ok(())
}

#[test]
fn delete_session_cascades_to_records_results_and_files() -> Result<()> {
    let store = ChunkStore::open_in_memory()?;
    let dir = TempDir::new()?;

    let path = dir.path().join("chunk-000.wav");
    std::fs::write(&path, b"fake chunk bytes")?;

    store.insert_session(&session("s1"))?;
    store.enqueue(&chunk("s1", 0, &path), true)?;
    store.store_result("s1", "transcript", "hello")?;

    store.delete_session("s1")?;

    assert!(store.session("s1")?.is_none());
    assert!(store.records_for_session("s1")?.is_empty());
    assert!(store.cached_result("s1", "transcript")?.is_none());
    assert!(!path.exists());

    Ok(())
}

#[test]
fn result_cache_round_trip() -> Result<()> {
    let store = ChunkStore::open_in_memory()?;

    assert!(store.cached_result("s1", "summary")?.is_none());
    store.store_result("s1", "summary", "short summary")?;
    assert_eq!(
        store.cached_result("s1", "summary")?.as_deref(),
        Some("short summary")
    );

    // Re-storing replaces the cached content.
    store.store_result("s1", "summary", "revised summary")?;
    let results = store.results_for_session("s1")?;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].content, "revised summary");

    Ok(())
}

#[test]
fn session_lifecycle_flags() -> Result<()> {
    let store = ChunkStore::open_in_memory()?;

    store.insert_session(&session("s1"))?;
    let loaded = store.session("s1")?.unwrap();
    assert!(loaded.ended_at.is_none());
    assert!(!loaded.is_uploaded);

    store.end_session("s1", Utc::now())?;
    store.mark_session_uploaded("s1")?;

    let loaded = store.session("s1")?.unwrap();
    assert!(loaded.ended_at.is_some());
    assert!(loaded.is_uploaded);

    Ok(())
}
