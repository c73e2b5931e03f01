//! Runner error types.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to download {url}: {message}")]
    Fetch { url: String, message: String },

    #[error("invalid source URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("job '{label}' failed: {message}")]
    JobFailed { label: String, message: String },

    #[error("required path does not exist: {}", .0.display())]
    MissingPath(PathBuf),

    #[error("PostgreSQL verification failed: {0}")]
    Verification(String),

    #[error("no files match {0}")]
    NoArtifacts(String),

    #[error("invalid artifact pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error(transparent)]
    Core(#[from] pgpack_core::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type RunnerResult<T> = Result<T, RunnerError>;
