//! Artifact storage abstraction.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{Result, RunId};

/// Retention applied to published packages unless configured otherwise.
pub const DEFAULT_RETENTION_DAYS: u32 = 90;

/// Key for storing/retrieving an artifact file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactKey {
    /// Artifact name, e.g. `vector-v0.2.0-pg14`.
    pub name: String,
    /// Run that produced the file.
    pub run_id: RunId,
    /// File name inside the artifact.
    pub file: String,
}

/// Reference to a stored artifact file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Storage key.
    pub key: ArtifactKey,
    /// Storage location (backend-specific).
    pub location: String,
    /// Hex SHA-256 of the content.
    pub checksum: String,
    /// Size in bytes.
    pub size: u64,
    /// When the file was stored.
    pub created_at: DateTime<Utc>,
    /// When the file stops being downloadable.
    pub expires_at: DateTime<Utc>,
}

impl ArtifactRef {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// All files uploaded under one artifact name by one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactManifest {
    pub name: String,
    pub run_id: RunId,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub files: Vec<ArtifactRef>,
}

impl ArtifactManifest {
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

/// Policy for artifact retention.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Remove uploads older than this, regardless of their own expiry.
    pub max_age: Option<Duration>,
    /// Keep at least this many of the newest uploads per artifact name.
    pub min_runs: Option<u32>,
}

/// Statistics from a prune operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneStats {
    pub artifacts_deleted: u64,
    pub bytes_freed: u64,
}

/// Trait for artifact storage backends.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store one file. `retention` sets how long it stays downloadable.
    async fn put(&self, key: &ArtifactKey, data: Bytes, retention: Duration)
    -> Result<ArtifactRef>;

    /// Retrieve a stored file.
    async fn get(&self, reference: &ArtifactRef) -> Result<Bytes>;

    /// List uploads for one artifact name, newest first.
    async fn list(&self, name: &str) -> Result<Vec<ArtifactManifest>>;

    /// List every upload in the store, newest first.
    async fn list_all(&self) -> Result<Vec<ArtifactManifest>>;

    /// Delete one upload.
    async fn delete(&self, name: &str, run_id: &RunId) -> Result<()>;

    /// Remove expired uploads and anything the policy rules out.
    async fn prune(&self, policy: RetentionPolicy) -> Result<PruneStats>;
}
