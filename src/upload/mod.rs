//! Chunk delivery to the assistant endpoint
//!
//! `AssistantClient` speaks the remote HTTP contract; `UploadCoordinator`
//! drains the durable queue against it with per-session ordering and
//! bounded retry.

mod client;
mod coordinator;

pub use client::{AssistantClient, ChunkUploadResponse, RESULT_TYPES};
pub use coordinator::{SweepSummary, UploadCoordinator, UploadOutcome};
