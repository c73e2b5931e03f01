//! Executor trait and job types.
//!
//! A job is one external command run on the build host. Stages are made of
//! one or more jobs executed strictly in sequence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::{Result, RunId};

/// Specification for a job to execute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Run this job belongs to.
    pub run_id: RunId,
    /// Short label shown in logs (e.g. "configure").
    pub label: String,
    /// Program followed by its arguments.
    pub command: Vec<String>,
    /// Working directory; the executor's own cwd when unset.
    pub working_dir: Option<PathBuf>,
    /// Extra environment variables.
    pub env: BTreeMap<String, String>,
    /// Directories prepended to `PATH`, in order.
    pub path_prepend: Vec<PathBuf>,
    /// Maximum execution time.
    pub timeout: Option<Duration>,
}

impl JobSpec {
    pub fn new(run_id: RunId, label: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            run_id,
            label: label.into(),
            command,
            working_dir: None,
            env: BTreeMap::new(),
            path_prepend: Vec::new(),
            timeout: None,
        }
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_path(mut self, dir: impl Into<PathBuf>) -> Self {
        self.path_prepend.push(dir.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The command as a single shell-like line, for display only.
    pub fn display_command(&self) -> String {
        self.command
            .iter()
            .map(|arg| {
                if arg.is_empty() || arg.contains(char::is_whitespace) {
                    format!("'{}'", arg)
                } else {
                    arg.clone()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Handle to a running or completed job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobHandle {
    /// Executor-assigned job number, unique per executor.
    pub job_id: u64,
    /// Run the job belongs to.
    pub run_id: RunId,
    /// Executor-specific identifier (e.g. process id).
    pub executor_id: String,
    /// Name of the executor running this job.
    pub executor_name: String,
}

/// Status of a job execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobStatus {
    /// Job is currently running.
    Running { started_at: DateTime<Utc> },
    /// Job exited with status zero.
    Succeeded {
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    },
    /// Job exited non-zero, was killed, or timed out.
    Failed {
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        exit_code: Option<i32>,
        message: String,
    },
    /// Job was cancelled.
    Cancelled {
        started_at: DateTime<Utc>,
        cancelled_at: DateTime<Utc>,
    },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Running { .. })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobStatus::Succeeded { .. })
    }
}

/// Result of a completed job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    /// Final status.
    pub status: JobStatus,
    /// Exit code if the process exited normally.
    pub exit_code: Option<i32>,
}

/// A line of log output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub stream: LogStream,
    pub content: String,
}

impl LogLine {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            stream: LogStream::System,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
    System,
}

/// Trait for job executors.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Name of this executor.
    fn name(&self) -> &'static str;

    /// Start a job.
    async fn spawn(&self, spec: JobSpec) -> Result<JobHandle>;

    /// Take the job's log stream. Can be called once per job; the stream ends
    /// when the job's output is closed.
    async fn logs(&self, handle: &JobHandle) -> Result<BoxStream<'static, LogLine>>;

    /// Get the current status of a job.
    async fn status(&self, handle: &JobHandle) -> Result<JobStatus>;

    /// Wait for a job to complete.
    async fn wait(&self, handle: &JobHandle) -> Result<JobResult>;

    /// Cancel a running job.
    async fn cancel(&self, handle: &JobHandle) -> Result<()>;
}
