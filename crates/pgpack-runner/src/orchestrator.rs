//! Pipeline orchestrator - runs the packaging stages strictly in order.

use chrono::Utc;
use futures::StreamExt;
use pgpack_config::BuildContext;
use pgpack_core::RunId;
use pgpack_core::artifact::{ArtifactManifest, ArtifactStore};
use pgpack_core::executor::{Executor, JobSpec, JobStatus, LogLine, LogStream};
use pgpack_core::pipeline::{
    PipelineRun, PipelineStatus, Stage, StageAction, StageKind, StageResult, StageStatus,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::fetch::SourceFetcher;
use crate::{RunnerError, RunnerResult, plan, provision, publish};

/// How long to keep draining a job's output after it exits.
const LOG_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Event emitted during pipeline execution.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum PipelineEvent {
    StageStarted {
        stage: StageKind,
    },
    StageLog {
        stage: StageKind,
        line: LogLine,
    },
    StageCompleted {
        stage: StageKind,
        status: StageStatus,
    },
    ArtifactPublished {
        manifest: ArtifactManifest,
    },
    PipelineCompleted {
        run_id: RunId,
        success: bool,
    },
}

/// Result of a pipeline execution.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub run: PipelineRun,
    /// The published upload; `None` unless every stage succeeded.
    pub artifact: Option<ArtifactManifest>,
}

impl PipelineResult {
    pub fn success(&self) -> bool {
        self.run.status == PipelineStatus::Succeeded
    }

    pub fn stage(&self, kind: StageKind) -> Option<&StageResult> {
        self.run.stages.iter().find(|s| s.kind == kind)
    }
}

/// Orchestrates the execution of a packaging run.
#[derive(Clone)]
pub struct PipelineOrchestrator {
    executor: Arc<dyn Executor>,
    store: Arc<dyn ArtifactStore>,
    fetcher: Arc<dyn SourceFetcher>,
    dry_run: bool,
}

impl PipelineOrchestrator {
    pub fn new(
        executor: Arc<dyn Executor>,
        store: Arc<dyn ArtifactStore>,
        fetcher: Arc<dyn SourceFetcher>,
    ) -> Self {
        Self {
            executor,
            store,
            fetcher,
            dry_run: false,
        }
    }

    /// Report host-side steps (downloads, directory removal, path checks,
    /// version checks, uploads) instead of performing them. Jobs still go
    /// through the executor.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Plan and start a run, returning a channel of events and a handle to
    /// get the final result.
    ///
    /// Planning errors surface here, before any stage runs.
    pub fn execute(
        &self,
        ctx: &BuildContext,
    ) -> RunnerResult<(
        mpsc::Receiver<PipelineEvent>,
        tokio::task::JoinHandle<PipelineResult>,
    )> {
        let run = PipelineRun::new(ctx.request.clone());
        let stages = plan(ctx, run.id)?;
        let (tx, rx) = mpsc::channel(100);
        let this = self.clone();

        info!(
            run_id = %run.id,
            tag = %ctx.request.tag(),
            pg_version = %ctx.pg_version(),
            dry_run = self.dry_run,
            "Starting packaging run"
        );

        let handle = tokio::spawn(async move { this.execute_inner(run, stages, tx).await });
        Ok((rx, handle))
    }

    async fn execute_inner(
        &self,
        mut run: PipelineRun,
        stages: Vec<Stage>,
        tx: mpsc::Sender<PipelineEvent>,
    ) -> PipelineResult {
        run.status = PipelineStatus::Running;
        run.started_at = Some(Utc::now());
        run.stages = stages
            .iter()
            .map(|stage| StageResult {
                kind: stage.kind,
                status: StageStatus::Pending,
                started_at: None,
                finished_at: None,
            })
            .collect();

        let mut failed: Option<StageKind> = None;
        let mut artifact = None;

        for (idx, stage) in stages.iter().enumerate() {
            if let Some(failed_kind) = failed {
                info!(stage = %stage.kind, failed = %failed_kind, "Skipping stage");
                run.stages[idx].status = StageStatus::Skipped {
                    reason: format!("stage '{}' failed", failed_kind),
                };
                continue;
            }

            let _ = tx
                .send(PipelineEvent::StageStarted { stage: stage.kind })
                .await;
            run.stages[idx].status = StageStatus::Running;
            run.stages[idx].started_at = Some(Utc::now());

            let status = match self.execute_stage(stage, run.id, &tx).await {
                Ok(published) => {
                    info!(stage = %stage.kind, "Stage completed successfully");
                    if let Some(manifest) = published {
                        let _ = tx
                            .send(PipelineEvent::ArtifactPublished {
                                manifest: manifest.clone(),
                            })
                            .await;
                        artifact = Some(manifest);
                    }
                    StageStatus::Succeeded
                }
                Err(e) => {
                    error!(stage = %stage.kind, error = %e, "Stage failed");
                    failed = Some(stage.kind);
                    StageStatus::Failed {
                        message: e.to_string(),
                    }
                }
            };

            run.stages[idx].status = status.clone();
            run.stages[idx].finished_at = Some(Utc::now());
            let _ = tx
                .send(PipelineEvent::StageCompleted {
                    stage: stage.kind,
                    status,
                })
                .await;
        }

        run.status = match failed {
            None => PipelineStatus::Succeeded,
            Some(kind) => PipelineStatus::Failed {
                stage: kind.name().to_string(),
            },
        };
        run.finished_at = Some(Utc::now());

        let success = failed.is_none();
        info!(run_id = %run.id, success, "Packaging run finished");
        let _ = tx
            .send(PipelineEvent::PipelineCompleted {
                run_id: run.id,
                success,
            })
            .await;

        PipelineResult { run, artifact }
    }

    /// Execute a single stage, returning the published artifact for the
    /// publish stage.
    async fn execute_stage(
        &self,
        stage: &Stage,
        run_id: RunId,
        tx: &mpsc::Sender<PipelineEvent>,
    ) -> RunnerResult<Option<ArtifactManifest>> {
        let kind = stage.kind;
        match &stage.action {
            StageAction::Run { jobs } => {
                self.run_jobs(kind, jobs, tx).await?;
                Ok(None)
            }
            StageAction::RequirePaths { paths } => {
                for path in paths {
                    if self.dry_run {
                        self.note(kind, tx, format!("would check {}", path.display()))
                            .await;
                    } else if !tokio::fs::try_exists(path).await? {
                        return Err(RunnerError::MissingPath(path.clone()));
                    }
                }
                Ok(None)
            }
            StageAction::Clone { dest, jobs } => {
                if tokio::fs::try_exists(dest).await? {
                    if self.dry_run {
                        self.note(kind, tx, format!("would remove {}", dest.display()))
                            .await;
                    } else {
                        tokio::fs::remove_dir_all(dest).await?;
                        self.note(kind, tx, format!("removed existing {}", dest.display()))
                            .await;
                    }
                }
                self.run_jobs(kind, jobs, tx).await?;
                Ok(None)
            }
            StageAction::ProvisionPostgres(p) => {
                if self.dry_run {
                    self.note(
                        kind,
                        tx,
                        format!("would download {} to {}", p.source_url, p.archive.display()),
                    )
                    .await;
                } else {
                    let bytes = provision::prepare_source(self.fetcher.as_ref(), p).await?;
                    self.note(kind, tx, format!("downloaded {} ({} bytes)", p.source_url, bytes))
                        .await;
                }

                self.run_jobs(kind, &p.jobs, tx).await?;

                let check = provision::version_check(p, run_id);
                if self.dry_run {
                    self.note(kind, tx, format!("would verify {}", check.display_command()))
                        .await;
                } else {
                    let output = self.run_job(kind, &check, tx, true).await?;
                    provision::check_reported_version(&output, &p.version)?;
                }
                Ok(None)
            }
            StageAction::Publish(spec) => {
                if self.dry_run {
                    self.note(
                        kind,
                        tx,
                        format!("would upload {} as artifact {}", spec.pattern, spec.name),
                    )
                    .await;
                    return Ok(None);
                }
                let manifest = publish::publish(self.store.as_ref(), spec, run_id).await?;
                Ok(Some(manifest))
            }
        }
    }

    async fn run_jobs(
        &self,
        kind: StageKind,
        jobs: &[JobSpec],
        tx: &mpsc::Sender<PipelineEvent>,
    ) -> RunnerResult<()> {
        for job in jobs {
            self.run_job(kind, job, tx, false).await?;
        }
        Ok(())
    }

    /// Run one job to completion, forwarding its output as stage logs.
    ///
    /// With `capture` set, stdout lines are also returned.
    async fn run_job(
        &self,
        kind: StageKind,
        job: &JobSpec,
        tx: &mpsc::Sender<PipelineEvent>,
        capture: bool,
    ) -> RunnerResult<Vec<String>> {
        info!(stage = %kind, job = %job.label, command = %job.display_command(), "Spawning job");

        let handle = self.executor.spawn(job.clone()).await?;
        let mut log_stream = self.executor.logs(&handle).await?;

        let tx_logs = tx.clone();
        let mut log_task = tokio::spawn(async move {
            let mut captured = Vec::new();
            while let Some(line) = log_stream.next().await {
                if capture && line.stream == LogStream::Stdout {
                    captured.push(line.content.clone());
                }
                let _ = tx_logs
                    .send(PipelineEvent::StageLog { stage: kind, line })
                    .await;
            }
            captured
        });

        let result = self.executor.wait(&handle).await?;

        // Output may still be in flight; stop following it if a background
        // process keeps the pipes open.
        let captured = match tokio::time::timeout(LOG_DRAIN_TIMEOUT, &mut log_task).await {
            Ok(Ok(captured)) => captured,
            Ok(Err(_)) => Vec::new(),
            Err(_) => {
                log_task.abort();
                Vec::new()
            }
        };

        match result.status {
            JobStatus::Succeeded { .. } => Ok(captured),
            JobStatus::Failed { message, .. } => Err(RunnerError::JobFailed {
                label: job.label.clone(),
                message,
            }),
            JobStatus::Cancelled { .. } => Err(RunnerError::JobFailed {
                label: job.label.clone(),
                message: "cancelled".to_string(),
            }),
            JobStatus::Running { .. } => Err(RunnerError::JobFailed {
                label: job.label.clone(),
                message: "job ended in unexpected state".to_string(),
            }),
        }
    }

    async fn note(&self, kind: StageKind, tx: &mpsc::Sender<PipelineEvent>, message: String) {
        let _ = tx
            .send(PipelineEvent::StageLog {
                stage: kind,
                line: LogLine::system(message),
            })
            .await;
    }
}
