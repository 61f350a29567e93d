//! Durable bookkeeping for the upload pipeline
//!
//! The queue is the source of truth for delivery: crash recovery is just
//! "re-run the drain on startup". Chunk audio bytes live as standalone
//! WAV files referenced by path from their queue record.

mod chunk_store;
mod types;

pub use chunk_store::ChunkStore;
pub use types::{CachedResult, ChunkUploadRecord, SessionRecord, UploadStatus};
