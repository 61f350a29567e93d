pub mod audio;
pub mod cli;
pub mod config;
pub mod error;
pub mod session;
pub mod store;
pub mod upload;

pub use audio::{
    AudioBackend, AudioBackendConfig, AudioCapturer, AudioFrame, CaptureConfig, CaptureEvent,
    CaptureState, Chunk, CpalBackend, ScriptHandle, ScriptedBackend,
};
pub use config::Config;
pub use error::{CaptureError, UploadError};
pub use session::{SessionController, SessionStats};
pub use store::{ChunkStore, ChunkUploadRecord, SessionRecord, UploadStatus};
pub use upload::{AssistantClient, ChunkUploadResponse, UploadCoordinator, UploadOutcome};
