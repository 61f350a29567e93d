use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while starting or driving audio capture.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The audio input cannot be opened (permission missing, hardware
    /// busy, no input device). Fatal to the session, never retried.
    #[error("audio input device unavailable: {reason}")]
    DeviceUnavailable { reason: String },

    /// `start` was called on a capturer that is already running.
    #[error("capture already started for session {0}")]
    AlreadyStarted(String),

    /// The capturer was asked to do something its state forbids.
    #[error("invalid capture state: {0}")]
    InvalidState(&'static str),

    /// Local I/O failure while preparing the recording directory.
    #[error("recording storage error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by a single chunk upload attempt.
#[derive(Debug, Error)]
pub enum UploadError {
    /// Network-level failure (connect, timeout, broken transfer).
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("server rejected upload: status {status}: {body}")]
    Rejected { status: u16, body: String },

    /// The chunk's backing file no longer exists; unrecoverable.
    #[error("chunk file missing: {0}")]
    FileMissing(PathBuf),

    /// The chunk file exists but could not be read.
    #[error("failed to read chunk file: {0}")]
    FileRead(std::io::Error),
}

impl UploadError {
    /// Missing files are deleted from the queue rather than retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, UploadError::FileMissing(_))
    }
}
