//! Local subprocess executor.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::BoxStream;
use pgpack_core::executor::*;
use pgpack_core::{Error, Result};
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, Notify, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

/// Runs jobs as child processes of the current process.
pub struct LocalExecutor {
    next_id: AtomicU64,
    jobs: Mutex<HashMap<u64, LocalJob>>,
}

struct LocalJob {
    label: String,
    started_at: DateTime<Utc>,
    timeout: Option<Duration>,
    /// Taken by the first `wait` call.
    child: Option<Child>,
    /// Taken by the first `logs` call.
    logs: Option<mpsc::UnboundedReceiver<LogLine>>,
    cancel: Arc<Notify>,
    result: Option<JobResult>,
}

enum Outcome {
    Exited(std::io::Result<ExitStatus>),
    Cancelled,
    TimedOut(Duration),
}

impl LocalExecutor {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            jobs: Mutex::new(HashMap::new()),
        }
    }

    fn build_command(spec: &JobSpec) -> Result<Command> {
        let (program, args) = spec.command.split_first().ok_or_else(|| {
            Error::InvalidInput(format!("job '{}' has an empty command", spec.label))
        })?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }

        if !spec.path_prepend.is_empty() {
            cmd.env("PATH", prepend_path(&spec.path_prepend)?);
        }

        Ok(cmd)
    }
}

impl Default for LocalExecutor {
    fn default() -> Self {
        Self::new()
    }
}

/// `PATH` with `dirs` in front of the current value.
fn prepend_path(dirs: &[PathBuf]) -> Result<OsString> {
    let current = std::env::var_os("PATH").unwrap_or_default();
    let paths = dirs
        .iter()
        .cloned()
        .chain(std::env::split_paths(&current));
    std::env::join_paths(paths)
        .map_err(|e| Error::InvalidInput(format!("invalid PATH entry: {}", e)))
}

/// Forward a child's output line by line. Keeps draining after the receiver
/// is gone so the child never blocks on a full pipe.
fn pump<R>(reader: R, stream: LogStream, tx: mpsc::UnboundedSender<LogLine>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let content = String::from_utf8_lossy(&buf).trim_end().to_string();
                    let _ = tx.send(LogLine {
                        timestamp: Utc::now(),
                        stream,
                        content,
                    });
                }
                Err(e) => {
                    warn!(error = %e, "Log stream error");
                    break;
                }
            }
        }
    });
}

async fn deadline(timeout: Option<Duration>) {
    match timeout {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn spawn(&self, spec: JobSpec) -> Result<JobHandle> {
        let mut cmd = Self::build_command(&spec)?;

        debug!(job = %spec.label, command = %spec.display_command(), "Spawning process");
        let mut child = cmd.spawn().map_err(|e| {
            Error::ExecutionFailed(format!("failed to start '{}': {}", spec.command[0], e))
        })?;

        let pid = child.id().map(|p| p.to_string()).unwrap_or_default();
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(LogLine::system(format!("$ {}", spec.display_command())));

        if let Some(stdout) = child.stdout.take() {
            pump(stdout, LogStream::Stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            pump(stderr, LogStream::Stderr, tx);
        }

        let job_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        info!(job = %spec.label, job_id, pid = %pid, "Started job");

        self.jobs.lock().await.insert(
            job_id,
            LocalJob {
                label: spec.label.clone(),
                started_at: Utc::now(),
                timeout: spec.timeout,
                child: Some(child),
                logs: Some(rx),
                cancel: Arc::new(Notify::new()),
                result: None,
            },
        );

        Ok(JobHandle {
            job_id,
            run_id: spec.run_id,
            executor_id: pid,
            executor_name: self.name().to_string(),
        })
    }

    async fn logs(&self, handle: &JobHandle) -> Result<BoxStream<'static, LogLine>> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(&handle.job_id)
            .ok_or_else(|| Error::NotFound(format!("job {}", handle.job_id)))?;
        let rx = job.logs.take().ok_or_else(|| {
            Error::InvalidInput(format!("logs for job '{}' were already taken", job.label))
        })?;
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn status(&self, handle: &JobHandle) -> Result<JobStatus> {
        let jobs = self.jobs.lock().await;
        let job = jobs
            .get(&handle.job_id)
            .ok_or_else(|| Error::NotFound(format!("job {}", handle.job_id)))?;
        Ok(match &job.result {
            Some(result) => result.status.clone(),
            None => JobStatus::Running {
                started_at: job.started_at,
            },
        })
    }

    async fn wait(&self, handle: &JobHandle) -> Result<JobResult> {
        let (mut child, cancel, timeout, started_at, label) = {
            let mut jobs = self.jobs.lock().await;
            let job = jobs
                .get_mut(&handle.job_id)
                .ok_or_else(|| Error::NotFound(format!("job {}", handle.job_id)))?;
            if let Some(result) = &job.result {
                return Ok(result.clone());
            }
            let child = job.child.take().ok_or_else(|| {
                Error::Internal(format!("job '{}' is already being waited on", job.label))
            })?;
            (
                child,
                job.cancel.clone(),
                job.timeout,
                job.started_at,
                job.label.clone(),
            )
        };

        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status),
            _ = cancel.notified() => Outcome::Cancelled,
            _ = deadline(timeout) => Outcome::TimedOut(timeout.unwrap_or_default()),
        };

        if matches!(outcome, Outcome::Cancelled | Outcome::TimedOut(_)) {
            if let Err(e) = child.kill().await {
                warn!(job = %label, error = %e, "Failed to kill process");
            }
        }

        let finished_at = Utc::now();
        let result = match outcome {
            Outcome::Exited(Ok(status)) if status.success() => JobResult {
                status: JobStatus::Succeeded {
                    started_at,
                    finished_at,
                },
                exit_code: status.code(),
            },
            Outcome::Exited(Ok(status)) => JobResult {
                status: JobStatus::Failed {
                    started_at,
                    finished_at,
                    exit_code: status.code(),
                    message: format!("'{}' failed with {}", label, status),
                },
                exit_code: status.code(),
            },
            Outcome::Exited(Err(e)) => JobResult {
                status: JobStatus::Failed {
                    started_at,
                    finished_at,
                    exit_code: None,
                    message: format!("failed to wait for '{}': {}", label, e),
                },
                exit_code: None,
            },
            Outcome::Cancelled => JobResult {
                status: JobStatus::Cancelled {
                    started_at,
                    cancelled_at: finished_at,
                },
                exit_code: None,
            },
            Outcome::TimedOut(limit) => JobResult {
                status: JobStatus::Failed {
                    started_at,
                    finished_at,
                    exit_code: None,
                    message: format!("'{}' timed out after {}s", label, limit.as_secs()),
                },
                exit_code: None,
            },
        };

        info!(job = %label, success = result.status.is_success(), exit_code = ?result.exit_code, "Job finished");

        if let Some(job) = self.jobs.lock().await.get_mut(&handle.job_id) {
            job.result = Some(result.clone());
        }
        Ok(result)
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(&handle.job_id)
            .ok_or_else(|| Error::NotFound(format!("job {}", handle.job_id)))?;

        if job.result.is_some() {
            return Ok(());
        }

        match job.child.take() {
            // Nobody is waiting yet: kill directly and record the outcome.
            Some(mut child) => {
                child.start_kill()?;
                job.result = Some(JobResult {
                    status: JobStatus::Cancelled {
                        started_at: job.started_at,
                        cancelled_at: Utc::now(),
                    },
                    exit_code: None,
                });
            }
            None => job.cancel.notify_one(),
        }

        info!(job = %job.label, "Cancelled job");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgpack_core::RunId;

    fn job(command: &[&str]) -> JobSpec {
        JobSpec::new(
            RunId::new(),
            "test",
            command.iter().map(|s| s.to_string()).collect(),
        )
    }

    async fn run(executor: &LocalExecutor, spec: JobSpec) -> (JobResult, Vec<LogLine>) {
        let handle = executor.spawn(spec).await.unwrap();
        let logs = executor.logs(&handle).await.unwrap();
        let result = executor.wait(&handle).await.unwrap();
        let lines: Vec<LogLine> = logs.collect().await;
        (result, lines)
    }

    #[tokio::test]
    async fn test_successful_command_streams_output() {
        let executor = LocalExecutor::new();
        let (result, lines) = run(&executor, job(&["echo", "hello"])).await;

        assert!(result.status.is_success());
        assert_eq!(result.exit_code, Some(0));
        assert!(
            lines
                .iter()
                .any(|l| l.stream == LogStream::Stdout && l.content == "hello")
        );
        assert_eq!(lines[0].stream, LogStream::System);
    }

    #[tokio::test]
    async fn test_failing_command() {
        let executor = LocalExecutor::new();
        let (result, _) = run(&executor, job(&["sh", "-c", "echo oops >&2; exit 3"])).await;

        assert_eq!(result.exit_code, Some(3));
        match result.status {
            JobStatus::Failed { exit_code, .. } => assert_eq!(exit_code, Some(3)),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stderr_is_captured() {
        let executor = LocalExecutor::new();
        let (_, lines) = run(&executor, job(&["sh", "-c", "echo oops >&2"])).await;
        assert!(
            lines
                .iter()
                .any(|l| l.stream == LogStream::Stderr && l.content == "oops")
        );
    }

    #[tokio::test]
    async fn test_empty_command_rejected() {
        let executor = LocalExecutor::new();
        let err = executor.spawn(job(&[])).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let executor = LocalExecutor::new();
        let err = executor
            .spawn(job(&["pgpack-definitely-not-a-program"]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ExecutionFailed(_)));
    }

    #[tokio::test]
    async fn test_env_working_dir_and_path() {
        let dir = tempfile::tempdir().unwrap();
        let executor = LocalExecutor::new();
        let spec = job(&["sh", "-c", "echo $FOO; pwd; echo $PATH"])
            .in_dir(dir.path())
            .with_env("FOO", "bar")
            .with_path("/opt/pgpack-test/bin");

        let (result, lines) = run(&executor, spec).await;
        assert!(result.status.is_success());

        let stdout: Vec<_> = lines
            .iter()
            .filter(|l| l.stream == LogStream::Stdout)
            .map(|l| l.content.clone())
            .collect();
        assert_eq!(stdout[0], "bar");
        let expected_dir = dir.path().canonicalize().unwrap();
        assert_eq!(PathBuf::from(&stdout[1]).canonicalize().unwrap(), expected_dir);
        assert!(stdout[2].starts_with("/opt/pgpack-test/bin"));
    }

    #[tokio::test]
    async fn test_timeout_fails_job() {
        let executor = LocalExecutor::new();
        let spec = job(&["sleep", "5"]).with_timeout(Duration::from_millis(100));
        let handle = executor.spawn(spec).await.unwrap();
        let result = executor.wait(&handle).await.unwrap();

        match result.status {
            JobStatus::Failed { message, .. } => assert!(message.contains("timed out")),
            other => panic!("expected timeout failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_while_waiting() {
        let executor = Arc::new(LocalExecutor::new());
        let handle = executor.spawn(job(&["sleep", "5"])).await.unwrap();

        let waiter = {
            let executor = executor.clone();
            let handle = handle.clone();
            tokio::spawn(async move { executor.wait(&handle).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        executor.cancel(&handle).await.unwrap();

        let result = waiter.await.unwrap().unwrap();
        assert!(matches!(result.status, JobStatus::Cancelled { .. }));
        assert!(executor.status(&handle).await.unwrap().is_terminal());
    }

    #[tokio::test]
    async fn test_logs_taken_once() {
        let executor = LocalExecutor::new();
        let handle = executor.spawn(job(&["true"])).await.unwrap();
        let _logs = executor.logs(&handle).await.unwrap();
        assert!(executor.logs(&handle).await.is_err());
        executor.wait(&handle).await.unwrap();
    }
}
