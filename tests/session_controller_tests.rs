// End-to-end tests: capture through the session controller, durable
// queue, upload coordinator, and the mock assistant endpoint.

mod support;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use loqa_recorder::audio::{AudioBackendConfig, ScriptedBackend};
use loqa_recorder::config::Config;
use loqa_recorder::session::SessionController;
use loqa_recorder::store::{ChunkStore, UploadStatus};
use loqa_recorder::upload::{AssistantClient, UploadCoordinator};
use support::MockAssistant;
use tempfile::TempDir;

struct Harness {
    mock: MockAssistant,
    store: Arc<ChunkStore>,
    controller: SessionController,
    _sweeper: tokio::task::JoinHandle<()>,
    _dir: TempDir,
}

async fn harness() -> Result<Harness> {
    let mock = MockAssistant::spawn().await;
    let dir = TempDir::new()?;

    let mut config = Config::default();
    config.server.base_url = mock.base_url.clone();
    config.audio.recordings_path = dir
        .path()
        .join("recordings")
        .to_string_lossy()
        .into_owned();
    config.storage.db_path = dir.path().join("queue.db").to_string_lossy().into_owned();
    // Deferred last chunks are picked up by the next sweep; keep the
    // sweeper fast so tests observe it.
    config.upload.sweep_interval_secs = 1;
    config.upload.max_sweep_interval_secs = 2;

    let store = Arc::new(ChunkStore::open(&config.storage.db_path)?);
    let client = Arc::new(AssistantClient::new(
        &config.server.base_url,
        Duration::from_secs(5),
        Duration::from_secs(5),
    )?);
    let coordinator = Arc::new(UploadCoordinator::new(
        Arc::clone(&store),
        Arc::clone(&client),
        &config.upload,
    ));
    let controller = SessionController::new(
        &config,
        Arc::clone(&store),
        Arc::clone(&coordinator),
        client,
    );

    let sweeper = coordinator.spawn_sweeper(config.upload.sweeper_max_retries);

    Ok(Harness {
        mock,
        store,
        controller,
        _sweeper: sweeper,
        _dir: dir,
    })
}

fn scripted() -> (Box<ScriptedBackend>, loqa_recorder::audio::ScriptHandle) {
    let (backend, handle) = ScriptedBackend::new(AudioBackendConfig {
        target_sample_rate: 16000,
        target_channels: 1,
        buffer_duration_ms: 100,
    });
    (Box::new(backend), handle)
}

async fn wait_recorded(controller: &SessionController, at_least_ms: u64) {
    for _ in 0..100 {
        if controller.recorded_time().await >= at_least_ms {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("capture never consumed {at_least_ms}ms of audio");
}

#[tokio::test]
async fn full_session_uploads_every_chunk_and_notifies_finish() -> Result<()> {
    let h = harness().await?;
    let (backend, mut handle) = scripted();

    let session_id = h.controller.start_session(backend).await?;

    handle.push_silence(100).await;
    handle.push_silence(100).await;
    wait_recorded(&h.controller, 200).await;

    // The pause finalizes and enqueues chunk 0 as a normal chunk.
    h.controller.pause_session().await?;
    h.controller.resume_session().await?;

    handle.push_silence(100).await;
    wait_recorded(&h.controller, 300).await;

    let stats = h.controller.stop_session().await?;

    assert_eq!(stats.session_id, session_id);
    assert_eq!(stats.chunk_count, 2);
    // Duration sums finalized chunks, not wall clock across the pause.
    assert_eq!(stats.duration_ms, 300);
    assert!(stats.ended_at.is_some());

    // All chunks deliver; the last one flips the session's upload flag.
    let store = Arc::clone(&h.store);
    let sid = session_id.clone();
    let uploaded = support::eventually(5_000, move || {
        store
            .session(&sid)
            .ok()
            .flatten()
            .map(|s| s.is_uploaded)
            .unwrap_or(false)
    })
    .await;
    assert!(uploaded, "session should finish uploading");

    for record in h.store.records_for_session(&session_id)? {
        assert_eq!(record.status, UploadStatus::Completed);
    }

    let uploads = h.mock.successful_uploads();
    assert_eq!(uploads.len(), 2);
    assert!(uploads.last().unwrap().is_last_chunk);

    // The finish notification is fire-and-forget but does arrive.
    let mock = h.mock.clone();
    let sid = session_id.clone();
    let notified =
        support::eventually(5_000, move || mock.analysed_sessions().contains(&sid)).await;
    assert!(notified, "analyse notification should reach the endpoint");

    Ok(())
}

#[tokio::test]
async fn only_one_session_at_a_time() -> Result<()> {
    let h = harness().await?;

    let (backend, _handle) = scripted();
    h.controller.start_session(backend).await?;

    let (second, _handle2) = scripted();
    assert!(h.controller.start_session(second).await.is_err());

    h.controller.stop_session().await?;
    assert!(h.controller.stop_session().await.is_err());

    Ok(())
}

#[tokio::test]
async fn failed_capture_start_leaves_no_session_behind() -> Result<()> {
    use loqa_recorder::audio::{AudioBackend, AudioFrame};
    use loqa_recorder::error::CaptureError;
    use tokio::sync::mpsc;

    struct DeadBackend;

    #[async_trait::async_trait]
    impl AudioBackend for DeadBackend {
        async fn start(&mut self) -> Result<mpsc::Receiver<AudioFrame>, CaptureError> {
            Err(CaptureError::DeviceUnavailable {
                reason: "microphone permission missing".to_string(),
            })
        }

        async fn stop(&mut self) -> Result<()> {
            Ok(())
        }

        fn is_capturing(&self) -> bool {
            false
        }

        fn name(&self) -> &str {
            "dead"
        }
    }

    let h = harness().await?;
    assert!(h.controller.start_session(Box::new(DeadBackend)).await.is_err());
    assert!(h.controller.sessions()?.is_empty());

    Ok(())
}

#[tokio::test]
async fn recovery_drains_queue_left_by_a_crash() -> Result<()> {
    use loqa_recorder::audio::{AudioFrame, ChunkWriter};

    let h = harness().await?;

    // The crash aftermath: a finalized chunk whose upload claim was
    // never released. The sweeper ignores InProgress records, so only
    // recovery can bring it back.
    let chunk_dir = h._dir.path().join("orphans");
    std::fs::create_dir_all(&chunk_dir)?;
    let mut writer = ChunkWriter::create(&chunk_dir, "crashed-session", 0, 16000, 1)?;
    writer.write_frame(&AudioFrame {
        samples: vec![3i16; 1600],
        sample_rate: 16000,
        channels: 1,
        timestamp_ms: 0,
    })?;
    let chunk = writer.finish()?;

    let id = h.store.enqueue(&chunk, false)?;
    h.store.claim(id)?;
    assert_eq!(h.store.count_with_status(UploadStatus::InProgress)?, 1);

    h.controller.recover().await?;

    // recover() and the sweeper may race for the released record; the
    // atomic claim guarantees a single winner either way.
    let store = Arc::clone(&h.store);
    let delivered = support::eventually(5_000, move || {
        store
            .record(id)
            .ok()
            .flatten()
            .map(|r| r.status == UploadStatus::Completed)
            .unwrap_or(false)
    })
    .await;

    assert!(delivered, "stale claim should be released and delivered");
    assert_eq!(h.store.count_with_status(UploadStatus::InProgress)?, 0);
    assert_eq!(h.mock.successful_uploads().len(), 1);

    Ok(())
}

#[tokio::test]
async fn results_are_fetched_once_and_cached() -> Result<()> {
    let h = harness().await?;
    h.mock.set_result("s1", "transcript", "hello world");

    let types = vec!["transcript".to_string(), "summary".to_string()];

    // Only the ready artifact comes back; the missing one is skipped.
    let results = h.controller.fetch_results("s1", &types, false).await?;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0], ("transcript".to_string(), "hello world".to_string()));

    // Cached content is served without the server.
    let cached = h.controller.fetch_results("s1", &types, true).await?;
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0].1, "hello world");

    let status = h.controller.processing_status("s1").await?;
    assert_eq!(status.get("transcript"), Some(&true));

    Ok(())
}

#[tokio::test]
async fn session_stats_track_queue_state() -> Result<()> {
    let h = harness().await?;
    let (backend, mut handle) = scripted();

    let session_id = h.controller.start_session(backend).await?;
    assert!(h.controller.session_stats(&session_id).await?.is_recording);

    handle.push_silence(100).await;
    wait_recorded(&h.controller, 100).await;
    let stats = h.controller.stop_session().await?;

    assert!(!h.controller.session_stats(&session_id).await?.is_recording);
    assert_eq!(stats.chunk_count, 1);
    assert_eq!(stats.duration_ms, 100);

    Ok(())
}
