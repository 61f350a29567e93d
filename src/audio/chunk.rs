use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::warn;

use super::backend::AudioFrame;

/// Size of the canonical RIFF/WAVE PCM header. hound writes placeholder
/// sizes at creation and rewrites them in place on finalize, so a chunk
/// file is exactly `44 + audio bytes` long.
pub const WAV_HEADER_LEN: u64 = 44;

/// A bounded-duration segment of captured audio, persisted as one file.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Owning session
    pub session_id: String,
    /// Position within the session, starting at 0
    pub index: u32,
    /// When the chunk was opened
    pub started_at: DateTime<Utc>,
    /// Set when the chunk is finalized
    pub ended_at: Option<DateTime<Utc>>,
    /// Backing WAV file
    pub file_path: PathBuf,
}

impl Chunk {
    /// File name for a chunk within its session directory.
    pub fn file_name(index: u32) -> String {
        format!("chunk-{:03}.wav", index)
    }
}

/// Writes a single chunk to disk as a WAV file.
///
/// The header carries placeholder sizes until `finish` rewrites them; a
/// chunk is only eligible for upload once finalized.
pub struct ChunkWriter {
    writer: Option<hound::WavWriter<BufWriter<File>>>,
    chunk: Chunk,
    active_ms: u64,
}

impl ChunkWriter {
    pub fn create(
        session_dir: &Path,
        session_id: &str,
        index: u32,
        sample_rate: u32,
        channels: u16,
    ) -> Result<Self> {
        let file_path = session_dir.join(Chunk::file_name(index));

        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let writer = hound::WavWriter::create(&file_path, spec)
            .with_context(|| format!("Failed to create WAV file: {:?}", file_path))?;

        Ok(Self {
            writer: Some(writer),
            chunk: Chunk {
                session_id: session_id.to_string(),
                index,
                started_at: Utc::now(),
                ended_at: None,
                file_path,
            },
            active_ms: 0,
        })
    }

    pub fn chunk(&self) -> &Chunk {
        &self.chunk
    }

    /// Active audio duration written so far, in milliseconds.
    pub fn active_ms(&self) -> u64 {
        self.active_ms
    }

    pub fn write_frame(&mut self, frame: &AudioFrame) -> Result<()> {
        if let Some(writer) = &mut self.writer {
            for &sample in &frame.samples {
                writer
                    .write_sample(sample)
                    .context("Failed to write sample to WAV")?;
            }
            self.active_ms += frame.duration_ms();
        }
        Ok(())
    }

    /// Finalize the header in place and return the completed chunk.
    pub fn finish(mut self) -> Result<Chunk> {
        if let Some(writer) = self.writer.take() {
            writer.finalize().context("Failed to finalize WAV file")?;
        }
        self.chunk.ended_at = Some(Utc::now());
        Ok(self.chunk.clone())
    }

    /// Drop the writer and remove the partial file. Used when a disk
    /// write fails mid-chunk; the chunk's index is consumed.
    pub fn abandon(mut self) {
        let path = self.chunk.file_path.clone();
        drop(self.writer.take());
        if let Err(e) = fs::remove_file(&path) {
            warn!("Failed to remove abandoned chunk {:?}: {}", path, e);
        }
    }
}

impl Drop for ChunkWriter {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            if let Err(e) = writer.finalize() {
                warn!("Failed to finalize WAV writer on drop: {}", e);
            }
        }
    }
}

/// Duration of a finalized chunk file in milliseconds, derived from the
/// audio byte length and byte rate rather than wall-clock timestamps.
pub fn wav_duration_ms(path: &Path) -> Result<u64> {
    let reader = hound::WavReader::open(path)
        .with_context(|| format!("Failed to open WAV file: {:?}", path))?;
    let spec = reader.spec();
    let frames = reader.duration() as u64;
    if spec.sample_rate == 0 {
        anyhow::bail!("WAV file {:?} reports a zero sample rate", path);
    }
    Ok(frames * 1000 / spec.sample_rate as u64)
}
