use std::path::Path;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("metadata probe failed: {0}")]
    Probe(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("server ignored range request (status {0})")]
    RangeNotSupported(u16),
    #[error("chunk {index} failed after {attempts} attempts: {message}")]
    ChunkFailed {
        index: u32,
        attempts: u32,
        message: String,
    },
    #[error("io error: {0}")]
    Io(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("a download is already running")]
    AlreadyRunning,
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl CoreError {
    pub(crate) fn io(path: &Path, err: std::io::Error) -> Self {
        CoreError::Io(format!("{}: {}", path.display(), err))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CoreError::Io(_) | CoreError::Storage(_) | CoreError::Config(_)
        )
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
