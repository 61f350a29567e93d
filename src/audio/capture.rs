use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::backend::{AudioBackend, AudioFrame};
use super::chunk::{Chunk, ChunkWriter};
use crate::error::CaptureError;

/// Capture lifecycle. `Stopped` is terminal; a new session requires a
/// new capturer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Initialized,
    Recording,
    Paused,
    Stopped,
}

/// Events emitted by the capture loop.
///
/// `Samples` is best-effort (live metering); chunk events are reliable
/// and drive the upload pipeline.
#[derive(Debug, Clone)]
pub enum CaptureEvent {
    Samples(Vec<i16>),
    ChunkStarted(Chunk),
    ChunkFinished { chunk: Chunk, is_last: bool },
}

/// Capture parameters, usually derived from `[audio]` config.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub recordings_path: PathBuf,
    pub sample_rate: u32,
    pub channels: u16,
    /// Maximum active duration of one chunk before rotating files.
    pub max_chunk_ms: u64,
}

enum Command {
    Pause(oneshot::Sender<()>),
    Resume(oneshot::Sender<()>),
    Stop(oneshot::Sender<Option<PathBuf>>),
}

/// Owns the audio device for one recording session and materializes the
/// sample stream as a sequence of self-contained chunk files.
pub struct AudioCapturer {
    config: CaptureConfig,
    backend: Option<Box<dyn AudioBackend>>,
    state: Arc<Mutex<CaptureState>>,
    recorded_ms: Arc<AtomicU64>,
    last_chunk_path: Arc<Mutex<Option<PathBuf>>>,
    cmd_tx: Option<mpsc::Sender<Command>>,
    task: Option<JoinHandle<()>>,
}

impl AudioCapturer {
    pub fn new(config: CaptureConfig, backend: Box<dyn AudioBackend>) -> Self {
        Self {
            config,
            backend: Some(backend),
            state: Arc::new(Mutex::new(CaptureState::Idle)),
            recorded_ms: Arc::new(AtomicU64::new(0)),
            last_chunk_path: Arc::new(Mutex::new(None)),
            cmd_tx: None,
            task: None,
        }
    }

    /// Begin capture for the given session.
    ///
    /// Returns the event stream. Fails with `DeviceUnavailable` if the
    /// audio input cannot be opened, and with `AlreadyStarted` if called
    /// twice; a capturer drives exactly one session.
    pub async fn start(
        &mut self,
        session_id: &str,
    ) -> Result<mpsc::Receiver<CaptureEvent>, CaptureError> {
        if self.state() != CaptureState::Idle {
            return Err(CaptureError::AlreadyStarted(session_id.to_string()));
        }

        let backend = self
            .backend
            .as_mut()
            .ok_or(CaptureError::InvalidState("backend already released"))?;

        let session_dir = self.config.recordings_path.join(session_id);
        std::fs::create_dir_all(&session_dir)?;

        let frames = backend.start().await?;
        self.set_state(CaptureState::Initialized);

        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let (event_tx, event_rx) = mpsc::channel(256);

        let capture_loop = CaptureLoop {
            config: self.config.clone(),
            session_id: session_id.to_string(),
            session_dir,
            frames,
            cmd_rx,
            events: event_tx,
            state: Arc::clone(&self.state),
            recorded_ms: Arc::clone(&self.recorded_ms),
            last_chunk_path: Arc::clone(&self.last_chunk_path),
            current: None,
            last_finished: None,
            next_index: 0,
        };

        info!("Capture starting for session {}", session_id);
        self.cmd_tx = Some(cmd_tx);
        self.task = Some(tokio::spawn(capture_loop.run()));

        Ok(event_rx)
    }

    /// Suspend sample consumption without closing the device. The open
    /// chunk is finalized, so no chunk spans a pause boundary.
    pub async fn pause(&self) -> Result<(), CaptureError> {
        match self.state() {
            CaptureState::Paused => return Ok(()),
            CaptureState::Recording => {}
            _ => return Err(CaptureError::InvalidState("pause requires active capture")),
        }
        self.send_ack(Command::Pause).await
    }

    /// Resume after a pause; a fresh chunk begins with the next frame.
    pub async fn resume(&self) -> Result<(), CaptureError> {
        match self.state() {
            CaptureState::Recording => return Ok(()),
            CaptureState::Paused => {}
            _ => return Err(CaptureError::InvalidState("resume requires a paused capture")),
        }
        self.send_ack(Command::Resume).await
    }

    /// Finalize the open chunk as the session's last chunk, release the
    /// device, and return the path of the last chunk file (None if
    /// nothing was captured). Safe to call repeatedly.
    pub async fn stop(&mut self) -> Result<Option<PathBuf>, CaptureError> {
        if let Some(cmd_tx) = self.cmd_tx.take() {
            let (ack_tx, ack_rx) = oneshot::channel();
            if cmd_tx.send(Command::Stop(ack_tx)).await.is_ok() {
                // The loop may have already exited on device loss.
                let _ = ack_rx.await;
            }
        }

        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("Capture loop panicked: {}", e);
            }
        }

        if let Some(mut backend) = self.backend.take() {
            if let Err(e) = backend.stop().await {
                warn!("Failed to release audio backend: {}", e);
            }
        }

        self.set_state(CaptureState::Stopped);
        Ok(self.last_chunk_path.lock().unwrap().clone())
    }

    /// Cumulative active (non-paused) capture duration in milliseconds.
    pub fn recorded_time(&self) -> u64 {
        self.recorded_ms.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> CaptureState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: CaptureState) {
        *self.state.lock().unwrap() = state;
    }

    async fn send_ack(
        &self,
        make: impl FnOnce(oneshot::Sender<()>) -> Command,
    ) -> Result<(), CaptureError> {
        let cmd_tx = self
            .cmd_tx
            .as_ref()
            .ok_or(CaptureError::InvalidState("capture not started"))?;
        let (ack_tx, ack_rx) = oneshot::channel();
        cmd_tx
            .send(make(ack_tx))
            .await
            .map_err(|_| CaptureError::InvalidState("capture loop stopped"))?;
        ack_rx
            .await
            .map_err(|_| CaptureError::InvalidState("capture loop stopped"))
    }
}

struct CaptureLoop {
    config: CaptureConfig,
    session_id: String,
    session_dir: PathBuf,
    frames: mpsc::Receiver<AudioFrame>,
    cmd_rx: mpsc::Receiver<Command>,
    events: mpsc::Sender<CaptureEvent>,
    state: Arc<Mutex<CaptureState>>,
    recorded_ms: Arc<AtomicU64>,
    last_chunk_path: Arc<Mutex<Option<PathBuf>>>,
    current: Option<ChunkWriter>,
    /// Most recently finalized chunk; re-announced as last when the
    /// session stops while no chunk is open (e.g. right after a pause).
    last_finished: Option<Chunk>,
    next_index: u32,
}

impl CaptureLoop {
    async fn run(mut self) {
        self.set_state(CaptureState::Recording);

        loop {
            tokio::select! {
                biased;

                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::Pause(ack)) => {
                        self.finalize_current(false).await;
                        self.set_state(CaptureState::Paused);
                        let _ = ack.send(());
                    }
                    Some(Command::Resume(ack)) => {
                        // Anything captured while paused is discarded
                        // before new audio is accepted.
                        while self.frames.try_recv().is_ok() {}
                        self.set_state(CaptureState::Recording);
                        let _ = ack.send(());
                    }
                    Some(Command::Stop(ack)) => {
                        self.finish_last().await;
                        self.set_state(CaptureState::Stopped);
                        let _ = ack.send(self.last_chunk_path.lock().unwrap().clone());
                        break;
                    }
                    None => {
                        // Capturer dropped without stop; finalize what we have.
                        self.finish_last().await;
                        self.set_state(CaptureState::Stopped);
                        break;
                    }
                },

                frame = self.frames.recv() => match frame {
                    Some(frame) => {
                        if *self.state.lock().unwrap() == CaptureState::Recording {
                            self.write_frame(frame).await;
                        }
                        // Paused: the device stays open, samples are discarded.
                    }
                    None => {
                        warn!(
                            "Audio device lost for session {}; capture stops",
                            self.session_id
                        );
                        self.finalize_current(false).await;
                        self.set_state(CaptureState::Stopped);
                        break;
                    }
                },
            }
        }

        info!("Capture loop finished for session {}", self.session_id);
    }

    async fn write_frame(&mut self, frame: AudioFrame) {
        self.recorded_ms.fetch_add(frame.duration_ms(), Ordering::SeqCst);

        if self.current.is_none() {
            self.open_chunk().await;
        }

        let Some(writer) = self.current.as_mut() else {
            // Chunk creation failed; the frame is dropped and the index
            // was consumed, preserving a strictly increasing sequence.
            return;
        };

        match writer.write_frame(&frame) {
            Ok(()) => {
                let _ = self
                    .events
                    .try_send(CaptureEvent::Samples(frame.samples));

                if writer.active_ms() >= self.config.max_chunk_ms {
                    self.finalize_current(false).await;
                }
            }
            Err(e) => {
                error!(
                    "Failed to write chunk {} for session {}: {}; skipping chunk",
                    writer.chunk().index,
                    self.session_id,
                    e
                );
                if let Some(writer) = self.current.take() {
                    writer.abandon();
                }
            }
        }
    }

    async fn open_chunk(&mut self) {
        let index = self.next_index;
        self.next_index += 1;

        match ChunkWriter::create(
            &self.session_dir,
            &self.session_id,
            index,
            self.config.sample_rate,
            self.config.channels,
        ) {
            Ok(writer) => {
                let chunk = writer.chunk().clone();
                self.current = Some(writer);
                let _ = self.events.send(CaptureEvent::ChunkStarted(chunk)).await;
            }
            Err(e) => {
                error!(
                    "Failed to open chunk {} for session {}: {}; skipping chunk",
                    index, self.session_id, e
                );
            }
        }
    }

    async fn finalize_current(&mut self, is_last: bool) {
        let Some(writer) = self.current.take() else {
            return;
        };

        match writer.finish() {
            Ok(chunk) => {
                info!(
                    "Chunk {} finished for session {} ({}ms)",
                    chunk.index,
                    self.session_id,
                    chunk
                        .ended_at
                        .map(|end| (end - chunk.started_at).num_milliseconds())
                        .unwrap_or_default()
                );
                *self.last_chunk_path.lock().unwrap() = Some(chunk.file_path.clone());
                self.last_finished = Some(chunk.clone());
                let _ = self
                    .events
                    .send(CaptureEvent::ChunkFinished { chunk, is_last })
                    .await;
            }
            Err(e) => {
                error!(
                    "Failed to finalize chunk for session {}: {}",
                    self.session_id, e
                );
            }
        }
    }

    /// Emit the session's last chunk on stop. When no chunk is open (the
    /// session was paused), the most recent finalized chunk is
    /// re-announced with the last flag; the queue's REPLACE semantics
    /// keep exactly one record per index.
    async fn finish_last(&mut self) {
        if self.current.is_some() {
            self.finalize_current(true).await;
        } else if let Some(chunk) = self.last_finished.clone() {
            let _ = self
                .events
                .send(CaptureEvent::ChunkFinished {
                    chunk,
                    is_last: true,
                })
                .await;
        }
    }

    fn set_state(&self, state: CaptureState) {
        *self.state.lock().unwrap() = state;
    }
}
