pub mod backend;
pub mod capture;
pub mod chunk;

pub use backend::{
    AudioBackend, AudioBackendConfig, AudioFrame, CpalBackend, ScriptHandle, ScriptedBackend,
};
pub use capture::{AudioCapturer, CaptureConfig, CaptureEvent, CaptureState};
pub use chunk::{wav_duration_ms, Chunk, ChunkWriter, WAV_HEADER_LEN};
