use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::CaptureError;

/// Audio sample data (16-bit PCM, interleaved)
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Raw audio samples (i16 PCM, interleaved)
    pub samples: Vec<i16>,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of channels
    pub channels: u16,
    /// Timestamp in milliseconds since capture started
    pub timestamp_ms: u64,
}

impl AudioFrame {
    /// Playback duration of this frame in milliseconds.
    pub fn duration_ms(&self) -> u64 {
        if self.samples.is_empty() || self.sample_rate == 0 {
            return 0;
        }
        let per_channel = self.samples.len() as u64 / self.channels.max(1) as u64;
        per_channel * 1000 / self.sample_rate as u64
    }
}

/// Configuration for audio backends
#[derive(Debug, Clone)]
pub struct AudioBackendConfig {
    /// Target sample rate (decimated from the device rate if needed)
    pub target_sample_rate: u32,
    /// Target channel count (1 = mono)
    pub target_channels: u16,
    /// Buffer size in milliseconds (affects latency)
    pub buffer_duration_ms: u64,
}

impl Default for AudioBackendConfig {
    fn default() -> Self {
        Self {
            target_sample_rate: 16000,
            target_channels: 1,
            buffer_duration_ms: 100,
        }
    }
}

/// Audio capture backend trait
///
/// Implementations:
/// - `CpalBackend`: microphone input via the system default device
/// - `ScriptedBackend`: caller-fed frames (tests, batch processing)
#[async_trait::async_trait]
pub trait AudioBackend: Send {
    /// Start capturing audio
    ///
    /// Returns a channel receiver that will receive audio frames. The
    /// channel closing before `stop` signals that the device was lost.
    async fn start(&mut self) -> Result<mpsc::Receiver<AudioFrame>, CaptureError>;

    /// Stop capturing audio and release the device
    async fn stop(&mut self) -> Result<()>;

    /// Check if backend is currently capturing
    fn is_capturing(&self) -> bool;

    /// Get backend name for logging
    fn name(&self) -> &str;
}

// ============================================================================
// Frame processing helpers
// ============================================================================

/// Convert interleaved multi-channel samples to mono by averaging channels.
pub fn downmix_to_mono(samples: &[i16], channels: u16) -> Vec<i16> {
    if channels <= 1 {
        return samples.to_vec();
    }

    let channels = channels as usize;
    let mut mono = Vec::with_capacity(samples.len() / channels);
    for frame in samples.chunks_exact(channels) {
        let sum: i32 = frame.iter().map(|&s| s as i32).sum();
        mono.push((sum / channels as i32) as i16);
    }
    mono
}

/// Downsample mono audio by decimation. Upsampling is not supported; the
/// input is returned unchanged when the rates already match or the ratio
/// rounds to one.
pub fn decimate(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || to_rate == 0 {
        return samples.to_vec();
    }

    let ratio = from_rate / to_rate;
    if ratio <= 1 {
        return samples.to_vec();
    }

    samples.iter().step_by(ratio as usize).copied().collect()
}

// ============================================================================
// CpalBackend — microphone capture
// ============================================================================

/// Microphone capture via cpal.
///
/// The cpal stream is not `Send`, so it lives on a dedicated thread that
/// forwards processed frames into a tokio channel.
pub struct CpalBackend {
    config: AudioBackendConfig,
    shutdown: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
    capturing: bool,
}

impl CpalBackend {
    pub fn new(config: AudioBackendConfig) -> Self {
        Self {
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
            thread: None,
            capturing: false,
        }
    }
}

#[async_trait::async_trait]
impl AudioBackend for CpalBackend {
    async fn start(&mut self) -> Result<mpsc::Receiver<AudioFrame>, CaptureError> {
        if self.capturing {
            return Err(CaptureError::InvalidState("backend already capturing"));
        }

        let (frame_tx, frame_rx) = mpsc::channel::<AudioFrame>(64);
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), String>>();

        let config = self.config.clone();
        let shutdown = Arc::clone(&self.shutdown);
        shutdown.store(false, Ordering::SeqCst);

        let thread_shutdown = Arc::clone(&shutdown);
        let thread = std::thread::spawn(move || {
            run_device_thread(config, frame_tx, ready_tx, thread_shutdown);
        });

        // Wait for the device to open (or fail) before reporting success.
        match ready_rx.recv_timeout(std::time::Duration::from_secs(10)) {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => {
                let _ = thread.join();
                return Err(CaptureError::DeviceUnavailable { reason });
            }
            Err(_) => {
                shutdown.store(true, Ordering::SeqCst);
                return Err(CaptureError::DeviceUnavailable {
                    reason: "audio device did not open in time".to_string(),
                });
            }
        }

        self.thread = Some(thread);
        self.capturing = true;
        Ok(frame_rx)
    }

    async fn stop(&mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            // Joining a short-lived device thread; it only sleeps in 50ms steps.
            let _ = tokio::task::spawn_blocking(move || thread.join()).await;
        }
        self.capturing = false;
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.capturing
    }

    fn name(&self) -> &str {
        "cpal"
    }
}

fn run_device_thread(
    config: AudioBackendConfig,
    frame_tx: mpsc::Sender<AudioFrame>,
    ready_tx: std::sync::mpsc::Sender<Result<(), String>>,
    shutdown: Arc<AtomicBool>,
) {
    let host = cpal::default_host();
    let device = match host.default_input_device() {
        Some(d) => d,
        None => {
            let _ = ready_tx.send(Err("no audio input device available".to_string()));
            return;
        }
    };

    let device_name = device.name().unwrap_or_else(|_| "unknown".to_string());

    let device_config = match device.default_input_config() {
        Ok(c) => c,
        Err(e) => {
            let _ = ready_tx.send(Err(format!("failed to query input config: {e}")));
            return;
        }
    };

    let device_rate = device_config.sample_rate().0;
    let device_channels = device_config.channels();
    let sample_format = device_config.sample_format();

    info!(
        "Capture device: {} ({}Hz, {} channels, {:?})",
        device_name, device_rate, device_channels, sample_format
    );

    let mut processor = FrameProcessor::new(config, device_rate, device_channels);
    let stream_shutdown = Arc::clone(&shutdown);

    let err_fn = move |err| {
        error!("Audio stream error: {}", err);
        stream_shutdown.store(true, Ordering::SeqCst);
    };

    let stream = match sample_format {
        cpal::SampleFormat::I16 => device.build_input_stream(
            &device_config.into(),
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                processor.push(data, &frame_tx);
            },
            err_fn,
            None,
        ),
        cpal::SampleFormat::F32 => device.build_input_stream(
            &device_config.into(),
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let converted: Vec<i16> = data
                    .iter()
                    .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
                    .collect();
                processor.push(&converted, &frame_tx);
            },
            err_fn,
            None,
        ),
        other => {
            let _ = ready_tx.send(Err(format!("unsupported sample format: {other:?}")));
            return;
        }
    };

    let stream = match stream {
        Ok(s) => s,
        Err(e) => {
            let _ = ready_tx.send(Err(format!("failed to open input stream: {e}")));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(format!("failed to start input stream: {e}")));
        return;
    }

    let _ = ready_tx.send(Ok(()));
    debug!("Audio stream started");

    while !shutdown.load(Ordering::SeqCst) {
        std::thread::sleep(std::time::Duration::from_millis(50));
    }

    drop(stream);
    debug!("Audio stream stopped");
}

/// Accumulates device samples, converts them to the target format, and
/// emits fixed-duration frames.
struct FrameProcessor {
    config: AudioBackendConfig,
    device_rate: u32,
    device_channels: u16,
    buffer: Vec<i16>,
    samples_per_buffer: usize,
    emitted_ms: u64,
}

impl FrameProcessor {
    fn new(config: AudioBackendConfig, device_rate: u32, device_channels: u16) -> Self {
        let samples_per_buffer = (device_rate as u64 * device_channels as u64
            * config.buffer_duration_ms
            / 1000) as usize;
        Self {
            config,
            device_rate,
            device_channels,
            buffer: Vec::with_capacity(samples_per_buffer.max(1)),
            samples_per_buffer: samples_per_buffer.max(1),
            emitted_ms: 0,
        }
    }

    fn push(&mut self, data: &[i16], frame_tx: &mpsc::Sender<AudioFrame>) {
        self.buffer.extend_from_slice(data);

        while self.buffer.len() >= self.samples_per_buffer {
            let raw: Vec<i16> = self.buffer.drain(..self.samples_per_buffer).collect();

            let samples = if self.config.target_channels == 1 {
                downmix_to_mono(&raw, self.device_channels)
            } else {
                raw
            };
            let samples = decimate(&samples, self.device_rate, self.config.target_sample_rate);

            let frame = AudioFrame {
                samples,
                sample_rate: self.config.target_sample_rate,
                channels: self.config.target_channels,
                timestamp_ms: self.emitted_ms,
            };
            self.emitted_ms += frame.duration_ms();

            // The consumer owns backpressure; if it is gone the stream is
            // being torn down and dropping the frame is fine.
            if frame_tx.blocking_send(frame).is_err() {
                warn!("Frame receiver closed; dropping captured audio");
                self.buffer.clear();
                return;
            }
        }
    }
}

// ============================================================================
// ScriptedBackend — caller-fed frames
// ============================================================================

/// Backend fed by the caller, for tests and batch runs.
pub struct ScriptedBackend {
    rx: Option<mpsc::Receiver<AudioFrame>>,
    capturing: bool,
}

/// Producer half of a [`ScriptedBackend`]; dropping it ends the stream,
/// which the capturer treats as device loss unless it was stopped first.
pub struct ScriptHandle {
    tx: mpsc::Sender<AudioFrame>,
    sample_rate: u32,
    channels: u16,
    elapsed_ms: u64,
}

impl ScriptedBackend {
    pub fn new(config: AudioBackendConfig) -> (Self, ScriptHandle) {
        let (tx, rx) = mpsc::channel(64);
        let handle = ScriptHandle {
            tx,
            sample_rate: config.target_sample_rate,
            channels: config.target_channels,
            elapsed_ms: 0,
        };
        (
            Self {
                rx: Some(rx),
                capturing: false,
            },
            handle,
        )
    }
}

impl ScriptHandle {
    /// Feed one batch of interleaved samples to the capturer.
    pub async fn push(&mut self, samples: Vec<i16>) {
        let frame = AudioFrame {
            samples,
            sample_rate: self.sample_rate,
            channels: self.channels,
            timestamp_ms: self.elapsed_ms,
        };
        self.elapsed_ms += frame.duration_ms();
        let _ = self.tx.send(frame).await;
    }

    /// Feed `ms` milliseconds of silence.
    pub async fn push_silence(&mut self, ms: u64) {
        let count = (self.sample_rate as u64 * self.channels as u64 * ms / 1000) as usize;
        self.push(vec![0i16; count]).await;
    }
}

#[async_trait::async_trait]
impl AudioBackend for ScriptedBackend {
    async fn start(&mut self) -> Result<mpsc::Receiver<AudioFrame>, CaptureError> {
        let rx = self.rx.take().ok_or(CaptureError::InvalidState(
            "scripted backend already started",
        ))?;
        self.capturing = true;
        Ok(rx)
    }

    async fn stop(&mut self) -> Result<()> {
        self.capturing = false;
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.capturing
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
