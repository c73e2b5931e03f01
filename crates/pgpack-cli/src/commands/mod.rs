//! CLI command implementations.

pub mod artifacts;
pub mod plan;
pub mod run;

use anyhow::{Context, Result};
use pgpack_config::context::TriggerParams;
use pgpack_config::system::load_system_config;
use pgpack_config::workflow::{WORKFLOW_FILE, load_workflow, parse_workflow};
use pgpack_config::{BuildContext, SystemConfig, WorkflowConfig};
use pgpack_store::LocalArtifactStore;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Everything loaded from disk before a command runs.
pub struct Environment {
    pub workspace: PathBuf,
    pub workflow_path: PathBuf,
    pub workflow: WorkflowConfig,
    pub system: SystemConfig,
}

impl Environment {
    pub fn load(
        workspace: Option<&Path>,
        workflow: Option<&Path>,
        system: Option<&Path>,
    ) -> Result<Self> {
        let workspace = resolve_workspace(workspace)?;
        let workflow_path = workflow
            .map(Path::to_path_buf)
            .unwrap_or_else(|| workspace.join(WORKFLOW_FILE));

        let workflow = load_workflow(&workflow_path)
            .with_context(|| format!("Failed to load workflow: {}", workflow_path.display()))?;
        let system = load_system_config(system).context("Failed to load system configuration")?;
        debug!(
            workspace = %workspace.display(),
            workflow = %workflow_path.display(),
            "Loaded configuration"
        );

        Ok(Self {
            workspace,
            workflow_path,
            workflow,
            system,
        })
    }

    /// Resolve trigger parameters into a build context.
    pub fn resolve(&self, params: TriggerParams) -> Result<BuildContext> {
        BuildContext::resolve(params, &self.workflow, &self.system, &self.workspace)
            .context("Invalid build parameters")
    }

    pub fn store_root(&self) -> PathBuf {
        let path = &self.system.artifact_store.path;
        if path.is_absolute() {
            path.clone()
        } else {
            self.workspace.join(path)
        }
    }

    pub async fn open_store(&self) -> Result<LocalArtifactStore> {
        let root = self.store_root();
        LocalArtifactStore::open(&root)
            .await
            .with_context(|| format!("Failed to open artifact store: {}", root.display()))
    }
}

fn resolve_workspace(workspace: Option<&Path>) -> Result<PathBuf> {
    let dir = match workspace {
        Some(dir) => dir.to_path_buf(),
        None => std::env::current_dir().context("Failed to read current directory")?,
    };
    dir.canonicalize()
        .with_context(|| format!("Failed to resolve workspace: {}", dir.display()))
}

pub fn default_workflow_path(workspace: Option<&Path>) -> Result<PathBuf> {
    Ok(resolve_workspace(workspace)?.join(WORKFLOW_FILE))
}

pub fn validate(path: &Path) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read workflow: {}", path.display()))?;
    match parse_workflow(&content) {
        Ok(workflow) => {
            println!("Workflow '{}' is valid", workflow.name);
            println!(
                "  PostgreSQL default: {}.{}",
                workflow.default_pg_major, workflow.default_pg_minor
            );
            println!("  pgrx: {}", workflow.toolchain.pgrx_version);
            println!(
                "  Artifact: {} ({} days)",
                workflow.artifact.name, workflow.artifact.retention_days
            );
            Ok(())
        }
        Err(e) => {
            println!("Configuration error: {}", e);
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_defaults_without_workflow_file() {
        let dir = tempfile::tempdir().unwrap();
        let env = Environment::load(Some(dir.path()), None, None).unwrap();

        assert_eq!(env.workflow, WorkflowConfig::default());
        assert!(env.workflow_path.ends_with(WORKFLOW_FILE));
        assert!(env.store_root().starts_with(&env.workspace));
        assert!(env.store_root().ends_with(".pgpack/artifacts"));
    }

    #[test]
    fn test_environment_reads_workflow() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(WORKFLOW_FILE), "make-jobs 12\n").unwrap();
        let env = Environment::load(Some(dir.path()), None, None).unwrap();
        assert_eq!(env.workflow.make_jobs, 12);

        let ctx = env
            .resolve(TriggerParams {
                tag: "v0.1.0".to_string(),
                os: Some("debian-12".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(ctx.make_jobs, 12);
        assert_eq!(ctx.workspace, env.workspace);
    }

    #[test]
    fn test_empty_tag_rejected_before_running() {
        let dir = tempfile::tempdir().unwrap();
        let env = Environment::load(Some(dir.path()), None, None).unwrap();
        assert!(env.resolve(TriggerParams::default()).is_err());
    }
}
