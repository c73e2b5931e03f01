//! Local filesystem artifact store.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use pgpack_core::RunId;
use pgpack_core::artifact::{
    ArtifactKey, ArtifactManifest, ArtifactRef, ArtifactStore, PruneStats, RetentionPolicy,
};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{StoreError, StoreResult};

const MANIFEST_FILE: &str = "manifest.json";

/// Filesystem-backed artifact store.
///
/// Layout: `<root>/<artifact name>/<run id>/<file>` with a `manifest.json`
/// next to the files of each upload.
pub struct LocalArtifactStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl LocalArtifactStore {
    /// Create a store rooted at `root`, creating the directory if needed.
    pub async fn open(root: impl AsRef<Path>) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn upload_dir(&self, name: &str, run_id: &RunId) -> PathBuf {
        self.root.join(name).join(run_id.to_string())
    }

    pub async fn put_file(
        &self,
        key: &ArtifactKey,
        data: Bytes,
        retention: Duration,
    ) -> StoreResult<ArtifactRef> {
        validate_component("artifact name", &key.name)?;
        validate_component("file name", &key.file)?;
        if key.file == MANIFEST_FILE {
            return Err(StoreError::InvalidKey(format!(
                "file name '{}' is reserved",
                MANIFEST_FILE
            )));
        }

        let _guard = self.write_lock.lock().await;

        let dir = self.upload_dir(&key.name, &key.run_id);
        fs::create_dir_all(&dir).await?;

        let path = dir.join(&key.file);
        write_atomic(&path, &data).await?;

        let manifest_path = dir.join(MANIFEST_FILE);
        let now = Utc::now();
        let mut manifest = match read_manifest(&manifest_path).await {
            Ok(manifest) => manifest,
            Err(StoreError::NotFound(_)) => ArtifactManifest {
                name: key.name.clone(),
                run_id: key.run_id,
                created_at: now,
                expires_at: expiry(now, retention),
                files: Vec::new(),
            },
            Err(e) => return Err(e),
        };

        let reference = ArtifactRef {
            key: key.clone(),
            location: path.display().to_string(),
            checksum: sha256_hex(&data),
            size: data.len() as u64,
            created_at: now,
            expires_at: manifest.expires_at,
        };

        manifest.files.retain(|f| f.key.file != key.file);
        manifest.files.push(reference.clone());
        write_atomic(&manifest_path, &serde_json::to_vec_pretty(&manifest)?).await?;

        info!(
            artifact = %key.name,
            run_id = %key.run_id,
            file = %key.file,
            size = reference.size,
            "Stored artifact file"
        );
        Ok(reference)
    }

    pub async fn get_file(&self, reference: &ArtifactRef) -> StoreResult<Bytes> {
        let path = self
            .upload_dir(&reference.key.name, &reference.key.run_id)
            .join(&reference.key.file);
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(path.display().to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let actual = sha256_hex(&data);
        if actual != reference.checksum {
            return Err(StoreError::ChecksumMismatch {
                file: reference.key.file.clone(),
                expected: reference.checksum.clone(),
                actual,
            });
        }
        Ok(Bytes::from(data))
    }

    pub async fn list_uploads(&self, name: &str) -> StoreResult<Vec<ArtifactManifest>> {
        validate_component("artifact name", name)?;
        let dir = self.root.join(name);
        let mut manifests = Vec::new();

        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(manifests),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let manifest_path = entry.path().join(MANIFEST_FILE);
            match read_manifest(&manifest_path).await {
                Ok(manifest) => manifests.push(manifest),
                Err(e) => {
                    warn!(path = %manifest_path.display(), error = %e, "Skipping unreadable upload");
                }
            }
        }

        manifests.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(manifests)
    }

    pub async fn list_all_uploads(&self) -> StoreResult<Vec<ArtifactManifest>> {
        let mut all = Vec::new();
        for name in self.names().await? {
            all.extend(self.list_uploads(&name).await?);
        }
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(all)
    }

    async fn names(&self) -> StoreResult<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    pub async fn delete_upload(&self, name: &str, run_id: &RunId) -> StoreResult<()> {
        validate_component("artifact name", name)?;
        let _guard = self.write_lock.lock().await;
        let dir = self.upload_dir(name, run_id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!(artifact = %name, run_id = %run_id, "Deleted upload");
                remove_if_empty(&self.root.join(name)).await;
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(format!("{}/{}", name, run_id)))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn prune_uploads(&self, policy: &RetentionPolicy) -> StoreResult<PruneStats> {
        let now = Utc::now();
        let mut stats = PruneStats::default();
        let keep_newest = policy.min_runs.unwrap_or(0) as usize;
        let max_age = policy
            .max_age
            .and_then(|age| chrono::Duration::from_std(age).ok());

        for name in self.names().await? {
            let manifests = self.list_uploads(&name).await?;
            for manifest in manifests.into_iter().skip(keep_newest) {
                let too_old = max_age
                    .map(|age| now - manifest.created_at > age)
                    .unwrap_or(false);
                if manifest.expires_at > now && !too_old {
                    continue;
                }

                self.delete_upload(&manifest.name, &manifest.run_id).await?;
                stats.artifacts_deleted += manifest.files.len() as u64;
                stats.bytes_freed += manifest.total_size();
            }
        }

        info!(
            deleted = stats.artifacts_deleted,
            bytes_freed = stats.bytes_freed,
            "Pruned artifact store"
        );
        Ok(stats)
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn put(
        &self,
        key: &ArtifactKey,
        data: Bytes,
        retention: Duration,
    ) -> pgpack_core::Result<ArtifactRef> {
        Ok(self.put_file(key, data, retention).await?)
    }

    async fn get(&self, reference: &ArtifactRef) -> pgpack_core::Result<Bytes> {
        Ok(self.get_file(reference).await?)
    }

    async fn list(&self, name: &str) -> pgpack_core::Result<Vec<ArtifactManifest>> {
        Ok(self.list_uploads(name).await?)
    }

    async fn list_all(&self) -> pgpack_core::Result<Vec<ArtifactManifest>> {
        Ok(self.list_all_uploads().await?)
    }

    async fn delete(&self, name: &str, run_id: &RunId) -> pgpack_core::Result<()> {
        Ok(self.delete_upload(name, run_id).await?)
    }

    async fn prune(&self, policy: RetentionPolicy) -> pgpack_core::Result<PruneStats> {
        Ok(self.prune_uploads(&policy).await?)
    }
}

fn validate_component(what: &str, value: &str) -> StoreResult<()> {
    if value.is_empty()
        || value == "."
        || value == ".."
        || value.contains('/')
        || value.contains('\\')
        || value.contains('\0')
    {
        return Err(StoreError::InvalidKey(format!("invalid {}: {:?}", what, value)));
    }
    Ok(())
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn expiry(created_at: DateTime<Utc>, retention: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(retention)
        .ok()
        .and_then(|d| created_at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

async fn read_manifest(path: &Path) -> StoreResult<ArtifactManifest> {
    match fs::read(path).await {
        Ok(data) => Ok(serde_json::from_slice(&data)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(StoreError::NotFound(path.display().to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Write to a sibling temp file, then rename over the target.
async fn write_atomic(path: &Path, data: &[u8]) -> StoreResult<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| StoreError::InvalidKey(path.display().to_string()))?;
    let tmp = path.with_file_name(format!(".{}.partial", file_name));
    fs::write(&tmp, data).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

async fn remove_if_empty(dir: &Path) {
    if let Ok(mut entries) = fs::read_dir(dir).await {
        if let Ok(None) = entries.next_entry().await {
            let _ = fs::remove_dir(dir).await;
        }
    }
}
