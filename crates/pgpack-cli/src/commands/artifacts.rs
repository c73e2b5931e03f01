//! Artifact store commands.

use anyhow::{Context, Result};
use chrono::Utc;
use pgpack_core::RunId;
use pgpack_core::artifact::{ArtifactManifest, ArtifactStore, RetentionPolicy};
use std::path::Path;
use std::time::Duration;

use super::Environment;

pub async fn list(env: &Environment, name: Option<&str>, json: bool) -> Result<()> {
    let store = env.open_store().await?;
    let uploads = match name {
        Some(name) => store.list(name).await?,
        None => store.list_all().await?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&uploads)?);
        return Ok(());
    }

    if uploads.is_empty() {
        println!("No artifacts found");
        return Ok(());
    }

    let now = Utc::now();
    println!("{:<30} {:<10} {:>6} {:>12}  EXPIRES", "NAME", "RUN", "FILES", "BYTES");
    for upload in &uploads {
        let expires = if upload.expires_at <= now {
            "expired".to_string()
        } else {
            upload.expires_at.format("%Y-%m-%d").to_string()
        };
        println!(
            "{:<30} {:<10} {:>6} {:>12}  {}",
            upload.name,
            upload.run_id.short(),
            upload.files.len(),
            upload.total_size(),
            expires
        );
    }
    Ok(())
}

pub async fn download(
    env: &Environment,
    name: &str,
    run: Option<&str>,
    out: &Path,
) -> Result<()> {
    let store = env.open_store().await?;
    let upload = select_upload(store.list(name).await?, run)?;

    std::fs::create_dir_all(out)
        .with_context(|| format!("Failed to create {}", out.display()))?;
    for file in &upload.files {
        let data = store
            .get(file)
            .await
            .with_context(|| format!("Failed to read {}", file.key.file))?;
        let dest = out.join(&file.key.file);
        std::fs::write(&dest, &data)
            .with_context(|| format!("Failed to write {}", dest.display()))?;
        println!("{} ({} bytes)", dest.display(), data.len());
    }
    Ok(())
}

pub async fn prune(
    env: &Environment,
    older_than_days: Option<u32>,
    keep: Option<u32>,
) -> Result<()> {
    let store = env.open_store().await?;
    let policy = RetentionPolicy {
        max_age: older_than_days.map(|days| Duration::from_secs(u64::from(days) * 86_400)),
        min_runs: keep,
    };
    let stats = store.prune(policy).await?;
    println!(
        "Deleted {} file(s), freed {} bytes",
        stats.artifacts_deleted, stats.bytes_freed
    );
    Ok(())
}

/// Pick the upload for `run`, or the newest one when no run is given.
fn select_upload(uploads: Vec<ArtifactManifest>, run: Option<&str>) -> Result<ArtifactManifest> {
    match run {
        Some(run) => {
            let run_id: RunId = run
                .parse()
                .with_context(|| format!("Invalid run ID: {}", run))?;
            uploads
                .into_iter()
                .find(|u| u.run_id == run_id)
                .with_context(|| format!("No upload for run {}", run_id))
        }
        None => uploads.into_iter().next().context("No uploads with that name"),
    }
}
