//! The build request: what a single run is asked to package.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// PostgreSQL major version used when none is given.
pub const DEFAULT_PG_MAJOR: &str = "15";
/// PostgreSQL minor version used when none is given.
pub const DEFAULT_PG_MINOR: &str = "4";

/// Parameters supplied when a run is triggered.
///
/// Validated once at construction and immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawBuildRequest")]
pub struct BuildRequest {
    tag: String,
    pg_major: String,
    pg_minor: String,
}

/// Wire form of [`BuildRequest`]; deserialized values go through
/// [`BuildRequest::new`].
#[derive(Deserialize)]
struct RawBuildRequest {
    tag: String,
    #[serde(default)]
    pg_major: Option<String>,
    #[serde(default)]
    pg_minor: Option<String>,
}

impl TryFrom<RawBuildRequest> for BuildRequest {
    type Error = Error;

    fn try_from(raw: RawBuildRequest) -> Result<Self> {
        BuildRequest::new(raw.tag, raw.pg_major, raw.pg_minor)
    }
}

impl BuildRequest {
    /// Build a request, applying the default PostgreSQL version for any part
    /// left out.
    ///
    /// Fails when the tag is empty, so nothing is provisioned for a request
    /// that could never be packaged.
    pub fn new(
        tag: impl Into<String>,
        pg_major: Option<String>,
        pg_minor: Option<String>,
    ) -> Result<Self> {
        let tag = tag.into().trim().to_string();
        if tag.is_empty() {
            return Err(Error::InvalidInput("tag is required".to_string()));
        }
        if tag.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(Error::InvalidInput(format!(
                "tag must not contain whitespace: {:?}",
                tag
            )));
        }

        let pg_major = validate_version_part("PG", pg_major, DEFAULT_PG_MAJOR)?;
        let pg_minor = validate_version_part("PG_MIN", pg_minor, DEFAULT_PG_MINOR)?;

        Ok(Self {
            tag,
            pg_major,
            pg_minor,
        })
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn pg_major(&self) -> &str {
        &self.pg_major
    }

    pub fn pg_minor(&self) -> &str {
        &self.pg_minor
    }

    /// `<PG>.<PG_MIN>`, the version handed to the PostgreSQL provisioner.
    pub fn pg_version(&self) -> String {
        format!("{}.{}", self.pg_major, self.pg_minor)
    }

    /// Name the published artifact is stored under.
    pub fn artifact_name(&self) -> String {
        format!("vector-{}-pg{}", self.tag, self.pg_major)
    }
}

fn validate_version_part(field: &str, value: Option<String>, default: &str) -> Result<String> {
    let value = match value {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return Ok(default.to_string()),
    };

    if !value.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(Error::InvalidInput(format!(
            "{} must be alphanumeric, got {:?}",
            field, value
        )));
    }

    Ok(value)
}
