//! Build context: the single, immutable view of a run's configuration.
//!
//! Resolved once from the trigger parameters, the workflow and the system
//! configuration, then shared by reference with every stage.

use crate::system::SystemConfig;
use crate::variables::{DirsContext, VariableContext, VariableContextBuilder};
use crate::workflow::WorkflowConfig;
use crate::{ConfigError, ConfigResult};
use pgpack_core::BuildRequest;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

const OS_RELEASE: &str = "/etc/os-release";
const FALLBACK_OS: &str = "linux";

/// Trigger parameters as given by the user, before defaults are applied.
#[derive(Debug, Clone, Default)]
pub struct TriggerParams {
    pub tag: String,
    pub pg_major: Option<String>,
    pub pg_minor: Option<String>,
    pub os: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildContext {
    pub request: BuildRequest,
    pub workflow: WorkflowConfig,
    pub workspace: PathBuf,
    /// Automation checkout holding the packaging script.
    pub checkout_dir: PathBuf,
    pub pg_src_dir: PathBuf,
    pub pg_install_dir: PathBuf,
    pub extension_dir: PathBuf,
    pub make_jobs: u32,
    pub os_name: String,
    pub artifact_name: String,
    /// Absolute glob of the files to publish.
    pub artifact_pattern: String,
    pub retention: Duration,
    /// Environment for every job.
    pub env: BTreeMap<String, String>,
    pub sudo: bool,
    pub job_timeout: Option<Duration>,
}

impl BuildContext {
    /// Resolve trigger parameters against a workflow.
    ///
    /// Fails before anything touches the host when the tag is missing or a
    /// template references an unknown variable.
    pub fn resolve(
        params: TriggerParams,
        workflow: &WorkflowConfig,
        system: &SystemConfig,
        workspace: &Path,
    ) -> ConfigResult<Self> {
        let request = BuildRequest::new(
            params.tag,
            params.pg_major.or_else(|| Some(workflow.default_pg_major.clone())),
            params.pg_minor.or_else(|| Some(workflow.default_pg_minor.clone())),
        )?;

        let os_name = params
            .os
            .or_else(|| workflow.os.clone())
            .unwrap_or_else(detect_os_name);

        let checkout_dir = match &workflow.checkout {
            Some(checkout) => absolutize(workspace, &checkout.path),
            None => workspace.to_path_buf(),
        };
        let pg_src_dir = absolutize(workspace, &workflow.dirs.pg_src);
        let pg_install_dir = absolutize(workspace, &workflow.dirs.pg_install);
        let extension_dir = absolutize(workspace, &workflow.dirs.extension);

        let mut builder = VariableContextBuilder::new()
            .with_tag(request.tag())
            .with_pg(request.pg_major(), request.pg_minor())
            .with_os(&os_name)
            .with_dirs(DirsContext {
                workspace: workspace.display().to_string(),
                pg_src: pg_src_dir.display().to_string(),
                pg_install: pg_install_dir.display().to_string(),
                extension: extension_dir.display().to_string(),
            });
        for (name, value) in &workflow.vars {
            builder = builder.with_custom(name, value);
        }
        let mut variables = builder.build();
        variables.populate_env();

        let artifact_name =
            interpolate_strict(&variables, "artifact name", &workflow.artifact.name)?;
        single_component("artifact name", &artifact_name)?;
        let file_pattern = interpolate_strict(
            &variables,
            "packaging pattern",
            &workflow.packaging.file_pattern,
        )?;
        single_component("packaging pattern", &file_pattern)?;
        let artifact_pattern = checkout_dir
            .join(&workflow.packaging.output_dir)
            .join(file_pattern)
            .display()
            .to_string();

        let mut env = BTreeMap::new();
        env.insert("MAKE_JOBS".to_string(), workflow.make_jobs.to_string());
        env.insert("PG_SRC_DIR".to_string(), pg_src_dir.display().to_string());
        env.insert("PG_INSTALL_DIR".to_string(), pg_install_dir.display().to_string());
        for (key, value) in &workflow.env {
            env.insert(key.clone(), interpolate_strict(&variables, key, value)?);
        }

        debug!(
            tag = %request.tag(),
            pg_version = %request.pg_version(),
            os = %os_name,
            artifact = %artifact_name,
            "Resolved build context"
        );

        Ok(Self {
            request,
            workflow: workflow.clone(),
            workspace: workspace.to_path_buf(),
            checkout_dir,
            pg_src_dir,
            pg_install_dir,
            extension_dir,
            make_jobs: workflow.make_jobs,
            os_name,
            artifact_name,
            artifact_pattern,
            retention: Duration::from_secs(u64::from(workflow.artifact.retention_days) * 86_400),
            env,
            sudo: system.executor.sudo,
            job_timeout: system.executor.job_timeout,
        })
    }

    pub fn pg_version(&self) -> String {
        self.request.pg_version()
    }

    pub fn pg_bin_dir(&self) -> PathBuf {
        self.pg_install_dir.join("bin")
    }

    pub fn pg_config(&self) -> PathBuf {
        self.pg_bin_dir().join("pg_config")
    }

    /// Directory `cargo pgrx package` runs in.
    pub fn extension_crate_dir(&self) -> PathBuf {
        self.extension_dir.join(&self.workflow.extension.crate_dir)
    }

    pub fn packaging_script(&self) -> PathBuf {
        self.checkout_dir.join(&self.workflow.packaging.script)
    }
}

fn interpolate_strict(vars: &VariableContext, field: &str, input: &str) -> ConfigResult<String> {
    let unresolved = vars.unresolved(input);
    if !unresolved.is_empty() {
        return Err(ConfigError::invalid(
            field,
            format!("unknown variables: {}", unresolved.join(", ")),
        ));
    }
    Ok(vars.interpolate(input))
}

/// Reject values that would not stay a single path component once a tag or
/// variable has been substituted in.
fn single_component(field: &str, value: &str) -> ConfigResult<()> {
    if value.is_empty() || value == "." || value == ".." {
        return Err(ConfigError::invalid(field, format!("{:?} is not a file name", value)));
    }
    if let Some(c) = value.chars().find(|c| matches!(c, '/' | '\\' | '\0')) {
        return Err(ConfigError::invalid(
            field,
            format!("{:?} must not contain {:?}", value, c),
        ));
    }
    Ok(())
}

fn absolutize(base: &Path, path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Host OS identifier in the `<ID>-<VERSION_ID>` form CI runners use
/// (e.g. `ubuntu-22.04`).
pub fn detect_os_name() -> String {
    std::fs::read_to_string(OS_RELEASE)
        .ok()
        .and_then(|content| parse_os_release(&content))
        .unwrap_or_else(|| FALLBACK_OS.to_string())
}

/// Extract `<ID>-<VERSION_ID>` from os-release content.
pub fn parse_os_release(content: &str) -> Option<String> {
    let mut id = None;
    let mut version = None;

    for line in content.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"').trim_matches('\'').to_string();
        match key.trim() {
            "ID" => id = Some(value),
            "VERSION_ID" => version = Some(value),
            _ => {}
        }
    }

    match (id, version) {
        (Some(id), Some(version)) if !id.is_empty() && !version.is_empty() => {
            Some(format!("{}-{}", id, version))
        }
        (Some(id), _) if !id.is_empty() => Some(id),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(tag: &str) -> TriggerParams {
        TriggerParams {
            tag: tag.to_string(),
            os: Some("ubuntu-22.04".to_string()),
            ..Default::default()
        }
    }

    fn resolve(params: TriggerParams) -> ConfigResult<BuildContext> {
        BuildContext::resolve(
            params,
            &WorkflowConfig::default(),
            &SystemConfig::default(),
            Path::new("/work"),
        )
    }

    #[test]
    fn test_defaults() {
        let ctx = resolve(params("v0.1.0")).unwrap();
        assert_eq!(ctx.pg_version(), "15.4");
        assert_eq!(ctx.make_jobs, 6);
        assert_eq!(ctx.pg_src_dir, PathBuf::from("/work/pgbuild"));
        assert_eq!(ctx.pg_install_dir, PathBuf::from("/work/postgresql"));
        assert_eq!(ctx.pg_config(), PathBuf::from("/work/postgresql/bin/pg_config"));
        assert_eq!(ctx.extension_dir, PathBuf::from("/work/timescale-vector"));
        assert_eq!(
            ctx.extension_crate_dir(),
            PathBuf::from("/work/timescale-vector/timescale_vector")
        );
        assert_eq!(ctx.packaging_script(), PathBuf::from("/work/scripts/package-deb.sh"));
        assert_eq!(ctx.retention, Duration::from_secs(90 * 86_400));
        assert_eq!(ctx.env.get("MAKE_JOBS").map(String::as_str), Some("6"));
    }

    #[test]
    fn test_explicit_version_names() {
        let ctx = resolve(TriggerParams {
            pg_major: Some("14".to_string()),
            pg_minor: Some("2".to_string()),
            ..params("v0.2.0")
        })
        .unwrap();
        assert_eq!(ctx.pg_version(), "14.2");
        assert_eq!(ctx.artifact_name, "vector-v0.2.0-pg14");
        assert_eq!(ctx.artifact_name, ctx.request.artifact_name());
        assert_eq!(
            ctx.artifact_pattern,
            "/work/pkgdump/timescaledb-vector-*v0.2.0*.deb"
        );
    }

    #[test]
    fn test_empty_tag_fails() {
        let err = resolve(params("")).unwrap_err();
        assert!(matches!(err, ConfigError::Request(_)));
    }

    #[test]
    fn test_tag_with_path_separator_fails() {
        for tag in ["release/0.2", "release\\0.2"] {
            let err = resolve(params(tag)).unwrap_err();
            assert!(
                matches!(&err, ConfigError::InvalidValue { field, .. } if field == "artifact name"),
                "{tag}: {err}"
            );
        }
    }

    #[test]
    fn test_custom_pattern_with_separator_fails() {
        let mut workflow = WorkflowConfig::default();
        workflow.artifact.name = "vector-pg${pg.major}".to_string();
        workflow.vars.insert("flavor".to_string(), "nested/dir".to_string());
        workflow.packaging.file_pattern = "${flavor}-*.deb".to_string();
        let err = BuildContext::resolve(
            params("v0.1.0"),
            &workflow,
            &SystemConfig::default(),
            Path::new("/work"),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { field, .. } if field == "packaging pattern"
        ));
    }

    #[test]
    fn test_workflow_defaults_apply() {
        let workflow = WorkflowConfig {
            default_pg_major: "16".to_string(),
            default_pg_minor: "0".to_string(),
            ..WorkflowConfig::default()
        };
        let ctx = BuildContext::resolve(
            params("v1"),
            &workflow,
            &SystemConfig::default(),
            Path::new("/work"),
        )
        .unwrap();
        assert_eq!(ctx.pg_version(), "16.0");
    }

    #[test]
    fn test_unknown_template_variable_fails() {
        let mut workflow = WorkflowConfig::default();
        workflow.artifact.name = "vector-${tag}-${nope}".to_string();
        let result = BuildContext::resolve(
            params("v1"),
            &workflow,
            &SystemConfig::default(),
            Path::new("/work"),
        );
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_checkout_dir_follows_repository_setting() {
        let mut workflow = WorkflowConfig::default();
        workflow.checkout = Some(crate::workflow::RepositorySettings {
            repository: "https://github.com/example/packaging".to_string(),
            reference: None,
            path: "automation".to_string(),
        });
        let ctx = BuildContext::resolve(
            params("v1"),
            &workflow,
            &SystemConfig::default(),
            Path::new("/work"),
        )
        .unwrap();
        assert_eq!(
            ctx.packaging_script(),
            PathBuf::from("/work/automation/scripts/package-deb.sh")
        );
        assert!(ctx.artifact_pattern.starts_with("/work/automation/pkgdump/"));
    }

    #[test]
    fn test_workflow_vars_feed_templates() {
        let mut workflow = WorkflowConfig::default();
        workflow.vars.insert("flavor".to_string(), "vector".to_string());
        workflow.packaging.file_pattern = "timescaledb-${flavor}-*${tag}*.deb".to_string();
        let ctx = BuildContext::resolve(
            params("v1"),
            &workflow,
            &SystemConfig::default(),
            Path::new("/work"),
        )
        .unwrap();
        assert_eq!(ctx.artifact_pattern, "/work/pkgdump/timescaledb-vector-*v1*.deb");
    }

    #[test]
    fn test_parse_os_release() {
        let content = "NAME=\"Ubuntu\"\nID=ubuntu\nVERSION_ID=\"22.04\"\n";
        assert_eq!(parse_os_release(content).as_deref(), Some("ubuntu-22.04"));
        assert_eq!(parse_os_release("ID=arch\n").as_deref(), Some("arch"));
        assert_eq!(parse_os_release("NAME=x\n"), None);
    }
}
