//! Dry-run executor: records jobs and reports success without running them.

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use pgpack_core::executor::*;
use pgpack_core::{Error, Result};
use std::sync::Mutex;

#[derive(Default)]
pub struct DryRunExecutor {
    jobs: Mutex<Vec<JobSpec>>,
}

impl DryRunExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Jobs received so far, in spawn order.
    pub fn jobs(&self) -> Vec<JobSpec> {
        self.jobs.lock().map(|jobs| jobs.clone()).unwrap_or_default()
    }

    fn spec(&self, handle: &JobHandle) -> Result<JobSpec> {
        let jobs = self
            .jobs
            .lock()
            .map_err(|_| Error::Internal("dry-run job list poisoned".to_string()))?;
        usize::try_from(handle.job_id)
            .ok()
            .and_then(|idx| jobs.get(idx).cloned())
            .ok_or_else(|| Error::NotFound(format!("job {}", handle.job_id)))
    }
}

#[async_trait]
impl Executor for DryRunExecutor {
    fn name(&self) -> &'static str {
        "dry-run"
    }

    async fn spawn(&self, spec: JobSpec) -> Result<JobHandle> {
        if spec.command.is_empty() {
            return Err(Error::InvalidInput(format!(
                "job '{}' has an empty command",
                spec.label
            )));
        }
        let mut jobs = self
            .jobs
            .lock()
            .map_err(|_| Error::Internal("dry-run job list poisoned".to_string()))?;
        let job_id = jobs.len() as u64;
        let run_id = spec.run_id;
        jobs.push(spec);

        Ok(JobHandle {
            job_id,
            run_id,
            executor_id: format!("dry-run-{}", job_id),
            executor_name: self.name().to_string(),
        })
    }

    async fn logs(&self, handle: &JobHandle) -> Result<BoxStream<'static, LogLine>> {
        let spec = self.spec(handle)?;
        let mut line = format!("would run: {}", spec.display_command());
        if let Some(dir) = &spec.working_dir {
            line.push_str(&format!(" (in {})", dir.display()));
        }
        Ok(stream::iter(vec![LogLine::system(line)]).boxed())
    }

    async fn status(&self, handle: &JobHandle) -> Result<JobStatus> {
        self.spec(handle)?;
        let now = Utc::now();
        Ok(JobStatus::Succeeded {
            started_at: now,
            finished_at: now,
        })
    }

    async fn wait(&self, handle: &JobHandle) -> Result<JobResult> {
        Ok(JobResult {
            status: self.status(handle).await?,
            exit_code: Some(0),
        })
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<()> {
        self.spec(handle).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgpack_core::RunId;

    #[tokio::test]
    async fn test_records_jobs_without_running() {
        let executor = DryRunExecutor::new();
        let spec = JobSpec::new(
            RunId::new(),
            "install",
            vec!["rm".to_string(), "-rf".to_string(), "/nonexistent-pgpack".to_string()],
        )
        .in_dir("/tmp");

        let handle = executor.spawn(spec.clone()).await.unwrap();
        let lines: Vec<_> = executor.logs(&handle).await.unwrap().collect().await;
        let result = executor.wait(&handle).await.unwrap();

        assert!(result.status.is_success());
        assert_eq!(executor.jobs(), vec![spec]);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].content.starts_with("would run: rm -rf"));
        assert!(lines[0].content.ends_with("(in /tmp)"));
    }

    #[tokio::test]
    async fn test_unknown_handle() {
        let executor = DryRunExecutor::new();
        let handle = JobHandle {
            job_id: 7,
            run_id: RunId::new(),
            executor_id: String::new(),
            executor_name: "dry-run".to_string(),
        };
        assert!(matches!(
            executor.wait(&handle).await,
            Err(Error::NotFound(_))
        ));
    }
}
