//! Workflow configuration parsing.
//!
//! A workflow file describes how a package is built: which OS packages to
//! install, where PostgreSQL comes from, which extension repository and pgrx
//! version to use, and how the resulting `.deb` files are named and kept.
//! Every setting has a default, so an empty file (or no file) describes the
//! stock timescaledb-vector packaging run.

use crate::kdl_util::{
    all_string_args, bool_prop, first_string_arg, key_value_children, string_prop, u32_arg,
    u32_prop,
};
use crate::{ConfigError, ConfigResult};
use kdl::KdlDocument;
use pgpack_core::artifact::DEFAULT_RETENTION_DAYS;
use pgpack_core::request::{DEFAULT_PG_MAJOR, DEFAULT_PG_MINOR};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

/// Default file name looked up in the workspace.
pub const WORKFLOW_FILE: &str = "pgpack.kdl";

/// A parsed workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub name: String,
    /// Version used when the trigger omits `PG` / `PG_MIN`.
    pub default_pg_major: String,
    pub default_pg_minor: String,
    pub dirs: DirSettings,
    pub make_jobs: u32,
    /// Environment handed to every job, values interpolated.
    pub env: BTreeMap<String, String>,
    /// Custom template variables.
    pub vars: BTreeMap<String, String>,
    pub packages: PackageSettings,
    pub postgres: PostgresSettings,
    /// Automation repository to clone; the workspace itself when unset.
    pub checkout: Option<RepositorySettings>,
    pub extension: ExtensionSettings,
    pub toolchain: ToolchainSettings,
    pub packaging: PackagingSettings,
    pub artifact: ArtifactSettings,
    /// Fixed OS identifier; detected from the host when unset.
    pub os: Option<String>,
}

/// Directory names, relative to the workspace unless absolute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirSettings {
    pub pg_src: String,
    pub pg_install: String,
    pub extension: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageSettings {
    pub baseline: Vec<String>,
    /// Debian packaging tools, installed alongside the baseline.
    pub debian: Vec<String>,
    /// Run `apt-get update` before installing.
    pub update_index: bool,
}

impl PackageSettings {
    /// Baseline and Debian packages, in order, without duplicates.
    pub fn all(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.baseline
            .iter()
            .chain(self.debian.iter())
            .filter(|p| seen.insert(p.as_str()))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostgresSettings {
    /// Base URL holding `v<version>/postgresql-<version>.tar.bz2`.
    pub mirror: String,
    pub configure_flags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositorySettings {
    pub repository: String,
    pub reference: Option<String>,
    /// Clone destination, relative to the workspace.
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionSettings {
    pub repository: String,
    /// Directory inside the checkout holding the extension crate.
    pub crate_dir: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolchainSettings {
    pub pgrx_version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackagingSettings {
    /// Packaging script, relative to the automation checkout.
    pub script: String,
    /// Directory the script writes `.deb` files to, relative to the checkout.
    pub output_dir: String,
    /// File name glob inside `output_dir`, interpolated.
    pub file_pattern: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactSettings {
    /// Artifact name template, interpolated.
    pub name: String,
    pub retention_days: u32,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            name: "deb-packager".to_string(),
            default_pg_major: DEFAULT_PG_MAJOR.to_string(),
            default_pg_minor: DEFAULT_PG_MINOR.to_string(),
            dirs: DirSettings {
                pg_src: "pgbuild".to_string(),
                pg_install: "postgresql".to_string(),
                extension: "timescale-vector".to_string(),
            },
            make_jobs: 6,
            env: BTreeMap::new(),
            vars: BTreeMap::new(),
            packages: PackageSettings {
                baseline: [
                    "build-essential",
                    "flex",
                    "bison",
                    "libreadline-dev",
                    "zlib1g-dev",
                    "libssl-dev",
                    "pkg-config",
                    "clang",
                    "libclang-dev",
                    "git",
                    "bzip2",
                    "curl",
                ]
                .iter()
                .map(|s| s.to_string())
                .collect(),
                debian: vec!["dpkg-dev".to_string(), "debhelper".to_string()],
                update_index: true,
            },
            postgres: PostgresSettings {
                mirror: "https://ftp.postgresql.org/pub/source/".to_string(),
                configure_flags: Vec::new(),
            },
            checkout: None,
            extension: ExtensionSettings {
                repository: "https://github.com/timescale/timescale-vector".to_string(),
                crate_dir: "timescale_vector".to_string(),
            },
            toolchain: ToolchainSettings {
                pgrx_version: "0.9.8".to_string(),
            },
            packaging: PackagingSettings {
                script: "scripts/package-deb.sh".to_string(),
                output_dir: "pkgdump".to_string(),
                file_pattern: "timescaledb-vector-*${tag}*.deb".to_string(),
            },
            artifact: ArtifactSettings {
                name: "vector-${tag}-pg${pg.major}".to_string(),
                retention_days: DEFAULT_RETENTION_DAYS,
            },
            os: None,
        }
    }
}

/// Load a workflow file, falling back to the defaults when it does not exist.
pub fn load_workflow(path: &Path) -> ConfigResult<WorkflowConfig> {
    match std::fs::read_to_string(path) {
        Ok(content) => parse_workflow(&content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "No workflow file, using defaults");
            Ok(WorkflowConfig::default())
        }
        Err(e) => Err(e.into()),
    }
}

/// Parse a workflow from KDL text, on top of the defaults.
pub fn parse_workflow(kdl: &str) -> ConfigResult<WorkflowConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = WorkflowConfig::default();
    let mut seen = HashSet::new();

    for node in doc.nodes() {
        let node_name = node.name().value();
        if !seen.insert(node_name.to_string()) {
            return Err(ConfigError::Duplicate(node_name.to_string()));
        }

        match node_name {
            "workflow" => {
                config.name = first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("workflow name".to_string()))?;
            }
            "defaults" => {
                if let Some(pg) = string_prop(node, "pg") {
                    config.default_pg_major = pg;
                }
                if let Some(pg_min) = string_prop(node, "pg-min") {
                    config.default_pg_minor = pg_min;
                }
            }
            "dirs" => {
                if let Some(v) = string_prop(node, "pg-src") {
                    config.dirs.pg_src = v;
                }
                if let Some(v) = string_prop(node, "pg-install") {
                    config.dirs.pg_install = v;
                }
                if let Some(v) = string_prop(node, "extension") {
                    config.dirs.extension = v;
                }
            }
            "make-jobs" => {
                config.make_jobs = u32_arg(node, "make-jobs")?;
            }
            "env" => {
                config.env.extend(key_value_children(node));
            }
            "vars" => {
                config.vars.extend(key_value_children(node));
            }
            "packages" => {
                if let Some(update) = bool_prop(node, "update") {
                    config.packages.update_index = update;
                }
                if let Some(children) = node.children() {
                    for child in children.nodes() {
                        match child.name().value() {
                            "baseline" => config.packages.baseline = all_string_args(child),
                            "debian" => config.packages.debian = all_string_args(child),
                            other => {
                                return Err(ConfigError::invalid(
                                    "packages",
                                    format!("unknown package group: {}", other),
                                ));
                            }
                        }
                    }
                }
            }
            "postgres" => {
                if let Some(mirror) = string_prop(node, "mirror") {
                    config.postgres.mirror = mirror;
                }
                if let Some(children) = node.children() {
                    for child in children.nodes() {
                        if child.name().value() == "configure-flags" {
                            config.postgres.configure_flags = all_string_args(child);
                        }
                    }
                }
            }
            "checkout" => {
                let repository = string_prop(node, "repository").ok_or_else(|| {
                    ConfigError::MissingField("checkout repository".to_string())
                })?;
                config.checkout = Some(RepositorySettings {
                    repository,
                    reference: string_prop(node, "ref"),
                    path: string_prop(node, "path").unwrap_or_else(|| "automation".to_string()),
                });
            }
            "extension" => {
                if let Some(repo) = string_prop(node, "repository") {
                    config.extension.repository = repo;
                }
                if let Some(dir) = string_prop(node, "crate-dir") {
                    config.extension.crate_dir = dir;
                }
            }
            "toolchain" => {
                if let Some(version) = string_prop(node, "pgrx") {
                    config.toolchain.pgrx_version = version;
                }
            }
            "packaging" => {
                if let Some(script) = string_prop(node, "script") {
                    config.packaging.script = script;
                }
                if let Some(dir) = string_prop(node, "output-dir") {
                    config.packaging.output_dir = dir;
                }
                if let Some(pattern) = string_prop(node, "pattern") {
                    config.packaging.file_pattern = pattern;
                }
            }
            "artifact" => {
                if let Some(name) = string_prop(node, "name") {
                    config.artifact.name = name;
                }
                if let Some(days) = u32_prop(node, "retention-days")? {
                    config.artifact.retention_days = days;
                }
            }
            "os" => {
                config.os = first_string_arg(node);
            }
            _ => {} // Ignore unknown nodes
        }
    }

    validate(&config)?;
    Ok(config)
}

fn validate(config: &WorkflowConfig) -> ConfigResult<()> {
    if config.make_jobs == 0 {
        return Err(ConfigError::invalid("make-jobs", "must be at least 1"));
    }
    if config.artifact.retention_days == 0 {
        return Err(ConfigError::invalid("artifact retention-days", "must be at least 1"));
    }
    if config.artifact.name.trim().is_empty() {
        return Err(ConfigError::MissingField("artifact name".to_string()));
    }
    if config.artifact.name.contains('/') {
        return Err(ConfigError::invalid("artifact name", "must not contain '/'"));
    }
    if config.packaging.file_pattern.contains('/') {
        return Err(ConfigError::invalid(
            "packaging pattern",
            "is a file name pattern and must not contain '/'",
        ));
    }
    if config.toolchain.pgrx_version.trim().is_empty() {
        return Err(ConfigError::MissingField("toolchain pgrx".to_string()));
    }
    let mirror = &config.postgres.mirror;
    if !mirror.starts_with("https://") && !mirror.starts_with("http://") {
        return Err(ConfigError::invalid("postgres mirror", "must be an http(s) URL"));
    }
    Ok(())
}
