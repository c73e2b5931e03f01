//! Artifact store errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("artifact not found: {0}")]
    NotFound(String),

    #[error("invalid artifact key: {0}")]
    InvalidKey(String),

    #[error("checksum mismatch for {file}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        file: String,
        expected: String,
        actual: String,
    },

    #[error("manifest error: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StoreError> for pgpack_core::Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => pgpack_core::Error::NotFound(what),
            StoreError::InvalidKey(msg) => pgpack_core::Error::InvalidInput(msg),
            StoreError::Io(e) => pgpack_core::Error::Io(e),
            other => pgpack_core::Error::Internal(other.to_string()),
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
