//! Artifact publishing.

use bytes::Bytes;
use pgpack_core::RunId;
use pgpack_core::artifact::{ArtifactKey, ArtifactManifest, ArtifactStore};
use pgpack_core::pipeline::PublishSpec;
use std::path::PathBuf;
use tracing::{info, warn};

use crate::{RunnerError, RunnerResult};

/// Expand the artifact glob into the files it matches, sorted.
///
/// Matching nothing is an error: a run must publish at least one package.
pub fn expand_pattern(pattern: &str) -> RunnerResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in glob::glob(pattern)? {
        match entry {
            Ok(path) if path.is_file() => files.push(path),
            Ok(_) => {}
            Err(e) => warn!(pattern = %pattern, error = %e, "Unreadable glob match"),
        }
    }

    if files.is_empty() {
        return Err(RunnerError::NoArtifacts(pattern.to_string()));
    }
    files.sort();
    Ok(files)
}

/// Upload every matching file under the spec's artifact name for this run.
pub async fn publish(
    store: &dyn ArtifactStore,
    spec: &PublishSpec,
    run_id: RunId,
) -> RunnerResult<ArtifactManifest> {
    let files = expand_pattern(&spec.pattern)?;

    for path in &files {
        let file = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| RunnerError::NoArtifacts(path.display().to_string()))?
            .to_string();
        let data = tokio::fs::read(path).await?;
        let key = ArtifactKey {
            name: spec.name.clone(),
            run_id,
            file,
        };
        store.put(&key, Bytes::from(data), spec.retention).await?;
    }

    let manifest = store
        .list(&spec.name)
        .await?
        .into_iter()
        .find(|m| m.run_id == run_id)
        .ok_or_else(|| {
            pgpack_core::Error::NotFound(format!("artifact {} for run {}", spec.name, run_id))
        })?;

    info!(
        artifact = %manifest.name,
        run_id = %run_id,
        files = manifest.files.len(),
        expires_at = %manifest.expires_at,
        "Published artifact"
    );
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgpack_store::LocalArtifactStore;
    use std::time::Duration;

    fn spec(dir: &std::path::Path) -> PublishSpec {
        PublishSpec {
            name: "vector-v0.2.0-pg14".to_string(),
            pattern: dir
                .join("pkgdump/timescaledb-vector-*v0.2.0*.deb")
                .display()
                .to_string(),
            retention: Duration::from_secs(90 * 86_400),
        }
    }

    fn write_debs(dir: &std::path::Path, names: &[&str]) {
        let out = dir.join("pkgdump");
        std::fs::create_dir_all(&out).unwrap();
        for name in names {
            std::fs::write(out.join(name), name.as_bytes()).unwrap();
        }
    }

    #[test]
    fn test_expand_pattern_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        write_debs(
            dir.path(),
            &[
                "timescaledb-vector-postgresql-14_v0.2.0-Linux_amd64.deb",
                "timescaledb-vector-2-v0.2.0.deb",
                "timescaledb-vector-v0.1.0.deb",
                "notes-v0.2.0.txt",
            ],
        );

        let files = expand_pattern(&spec(dir.path()).pattern).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(
            names,
            vec![
                "timescaledb-vector-2-v0.2.0.deb",
                "timescaledb-vector-postgresql-14_v0.2.0-Linux_amd64.deb",
            ]
        );
    }

    #[test]
    fn test_no_match_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = expand_pattern(&spec(dir.path()).pattern).unwrap_err();
        assert!(matches!(err, RunnerError::NoArtifacts(_)));
    }

    #[tokio::test]
    async fn test_publish_uploads_all_matches() {
        let dir = tempfile::tempdir().unwrap();
        write_debs(
            dir.path(),
            &["timescaledb-vector-a-v0.2.0.deb", "timescaledb-vector-b-v0.2.0.deb"],
        );
        let store = LocalArtifactStore::open(dir.path().join("store")).await.unwrap();
        let run_id = RunId::new();

        let manifest = publish(&store, &spec(dir.path()), run_id).await.unwrap();
        assert_eq!(manifest.name, "vector-v0.2.0-pg14");
        assert_eq!(manifest.run_id, run_id);
        assert_eq!(manifest.files.len(), 2);
        assert!(manifest.expires_at - manifest.created_at >= chrono::Duration::days(89));
    }
}
