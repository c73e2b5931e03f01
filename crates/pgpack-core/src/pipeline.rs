//! Stage definitions and run results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::executor::JobSpec;
use crate::{BuildRequest, RunId};

/// The fixed steps of a packaging run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageKind {
    /// Make the automation repository (packaging script) available.
    Checkout,
    /// Install OS build packages and Debian packaging tools.
    InstallPackages,
    /// Download, build and install PostgreSQL.
    ProvisionPostgres,
    /// Fresh clone of the extension at the requested tag.
    CheckoutExtension,
    /// Install the pinned pgrx build tool.
    InstallToolchain,
    /// Build the extension and repackage it as `.deb` files.
    Package,
    /// Upload the `.deb` files to the artifact store.
    Publish,
}

impl StageKind {
    pub const ALL: [StageKind; 7] = [
        StageKind::Checkout,
        StageKind::InstallPackages,
        StageKind::ProvisionPostgres,
        StageKind::CheckoutExtension,
        StageKind::InstallToolchain,
        StageKind::Package,
        StageKind::Publish,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            StageKind::Checkout => "checkout",
            StageKind::InstallPackages => "install-packages",
            StageKind::ProvisionPostgres => "provision-postgres",
            StageKind::CheckoutExtension => "checkout-extension",
            StageKind::InstallToolchain => "install-toolchain",
            StageKind::Package => "package",
            StageKind::Publish => "publish",
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A planned stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub kind: StageKind,
    pub action: StageAction,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        self.kind.name()
    }
}

/// What a stage does.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StageAction {
    /// Run jobs in order.
    Run { jobs: Vec<JobSpec> },
    /// Check that files already exist on the build host.
    RequirePaths { paths: Vec<PathBuf> },
    /// Remove `dest` if present, then run the clone jobs.
    Clone { dest: PathBuf, jobs: Vec<JobSpec> },
    /// Fetch a PostgreSQL source archive and build it.
    ProvisionPostgres(PostgresProvision),
    /// Upload matching files to the artifact store.
    Publish(PublishSpec),
}

impl StageAction {
    /// Jobs this action hands to the executor.
    pub fn jobs(&self) -> &[JobSpec] {
        match self {
            StageAction::Run { jobs } | StageAction::Clone { jobs, .. } => jobs,
            StageAction::ProvisionPostgres(p) => &p.jobs,
            StageAction::RequirePaths { .. } | StageAction::Publish(_) => &[],
        }
    }
}

/// PostgreSQL provisioning inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresProvision {
    /// `<major>.<minor>`.
    pub version: String,
    /// Where the source archive is downloaded from.
    pub source_url: String,
    /// Where the archive is written.
    pub archive: PathBuf,
    pub src_dir: PathBuf,
    pub install_dir: PathBuf,
    /// Extract, configure, build and install, in order.
    pub jobs: Vec<JobSpec>,
}

impl PostgresProvision {
    pub fn pg_config(&self) -> PathBuf {
        self.install_dir.join("bin").join("pg_config")
    }
}

/// Artifact publication inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishSpec {
    /// Artifact name, `vector-<tag>-pg<PG>`.
    pub name: String,
    /// Absolute glob selecting the files to upload.
    pub pattern: String,
    pub retention: Duration,
}

/// A pipeline run record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: RunId,
    pub request: BuildRequest,
    pub status: PipelineStatus,
    pub stages: Vec<StageResult>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    pub fn new(request: BuildRequest) -> Self {
        Self {
            id: RunId::new(),
            request,
            status: PipelineStatus::Queued,
            stages: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }
}

/// Overall pipeline status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineStatus {
    /// Waiting to start.
    Queued,
    /// Currently running.
    Running,
    /// Every stage succeeded and the artifact was published.
    Succeeded,
    /// A stage failed; nothing was published.
    Failed { stage: String },
}

impl PipelineStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineStatus::Succeeded | PipelineStatus::Failed { .. })
    }
}

/// Result of a stage execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub kind: StageKind,
    pub status: StageStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StageResult {
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

/// Status of a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageStatus {
    /// Not reached yet.
    Pending,
    /// Currently executing.
    Running,
    /// Completed successfully.
    Succeeded,
    /// Failed.
    Failed { message: String },
    /// Not executed because an earlier stage failed.
    Skipped { reason: String },
}

impl StageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StageStatus::Succeeded | StageStatus::Failed { .. } | StageStatus::Skipped { .. }
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StageStatus::Succeeded)
    }
}
