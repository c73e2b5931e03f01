//! System configuration parsing.
//!
//! Host-level settings that do not belong to a workflow: where artifacts are
//! stored and how jobs are executed.

use crate::kdl_util::{bool_prop, first_string_arg, string_prop, u32_prop};
use crate::{ConfigError, ConfigResult};
use kdl::KdlDocument;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// System-wide configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemConfig {
    pub artifact_store: ArtifactStoreConfig,
    pub executor: ExecutorConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactStoreConfig {
    pub backend: String,
    /// Store root; relative paths are resolved against the workspace.
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    pub executor_type: String,
    /// Prefix package installation with `sudo`.
    pub sudo: bool,
    /// Per-job time limit.
    pub job_timeout: Option<Duration>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            artifact_store: ArtifactStoreConfig {
                backend: "local".to_string(),
                path: PathBuf::from(".pgpack/artifacts"),
            },
            executor: ExecutorConfig {
                executor_type: "local".to_string(),
                sudo: true,
                job_timeout: None,
            },
        }
    }
}

/// Load system configuration; defaults when no path is given.
pub fn load_system_config(path: Option<&Path>) -> ConfigResult<SystemConfig> {
    match path {
        Some(path) => parse_system_config(&std::fs::read_to_string(path)?),
        None => Ok(SystemConfig::default()),
    }
}

/// Parse system configuration from KDL text.
pub fn parse_system_config(kdl: &str) -> ConfigResult<SystemConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = SystemConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "artifact-store" => {
                let backend = first_string_arg(node).unwrap_or_else(|| "local".to_string());
                if backend != "local" {
                    return Err(ConfigError::invalid(
                        "artifact-store",
                        format!("unsupported backend: {}", backend),
                    ));
                }
                config.artifact_store.backend = backend;
                if let Some(path) = string_prop(node, "path") {
                    config.artifact_store.path = PathBuf::from(path);
                }
            }
            "executor" => {
                let executor_type = first_string_arg(node).unwrap_or_else(|| "local".to_string());
                if executor_type != "local" {
                    return Err(ConfigError::invalid(
                        "executor",
                        format!("unsupported executor: {}", executor_type),
                    ));
                }
                config.executor.executor_type = executor_type;
                if let Some(sudo) = bool_prop(node, "sudo") {
                    config.executor.sudo = sudo;
                }
                if let Some(secs) = u32_prop(node, "timeout-secs")? {
                    config.executor.job_timeout =
                        (secs > 0).then(|| Duration::from_secs(u64::from(secs)));
                }
            }
            _ => {}
        }
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = parse_system_config("").unwrap();
        assert_eq!(config, SystemConfig::default());
        assert!(config.executor.sudo);
        assert_eq!(config.artifact_store.path, PathBuf::from(".pgpack/artifacts"));
    }

    #[test]
    fn test_parse_system_config() {
        let config = parse_system_config(
            r#"
            artifact-store "local" path="/var/lib/pgpack"
            executor "local" sudo=#false timeout-secs=3600
        "#,
        )
        .unwrap();
        assert_eq!(config.artifact_store.path, PathBuf::from("/var/lib/pgpack"));
        assert!(!config.executor.sudo);
        assert_eq!(config.executor.job_timeout, Some(Duration::from_secs(3600)));
    }

    #[test]
    fn test_unsupported_backend() {
        let result = parse_system_config(r#"artifact-store "s3" path="bucket""#);
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_load_without_path() {
        assert_eq!(load_system_config(None).unwrap(), SystemConfig::default());
    }
}
