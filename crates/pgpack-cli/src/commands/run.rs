//! Packaging run command.

use anyhow::{Context, Result};
use pgpack_config::context::TriggerParams;
use pgpack_core::executor::{Executor, LogStream};
use pgpack_core::pipeline::{StageResult, StageStatus};
use pgpack_executor::{DryRunExecutor, LocalExecutor};
use pgpack_runner::{HttpFetcher, PipelineEvent, PipelineOrchestrator, PipelineResult};
use std::path::Path;
use std::sync::Arc;

use super::Environment;

/// Run the packaging workflow on this host.
pub async fn run(
    env: &Environment,
    params: TriggerParams,
    dry_run: bool,
    report: Option<&Path>,
) -> Result<()> {
    let ctx = env.resolve(params)?;

    println!(
        "Packaging timescaledb-vector {} for PostgreSQL {} on {}",
        ctx.request.tag(),
        ctx.pg_version(),
        ctx.os_name
    );
    println!("Workspace: {}", ctx.workspace.display());
    println!("Artifact: {}", ctx.artifact_name);
    if dry_run {
        println!("Dry run: no commands will be executed");
    }

    let executor: Arc<dyn Executor> = if dry_run {
        Arc::new(DryRunExecutor::new())
    } else {
        Arc::new(LocalExecutor::new())
    };
    let store = Arc::new(env.open_store().await?);
    let orchestrator =
        PipelineOrchestrator::new(executor, store, Arc::new(HttpFetcher::new())).dry_run(dry_run);

    println!("\n--- Starting packaging run ---\n");

    let (mut rx, result_handle) = orchestrator
        .execute(&ctx)
        .context("Failed to plan packaging run")?;

    while let Some(event) = rx.recv().await {
        print_event(event);
    }

    let result = result_handle.await.context("Packaging task failed")?;

    print_summary(&result);

    if let Some(path) = report {
        let json = serde_json::to_string_pretty(&result)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write report: {}", path.display()))?;
        println!("Report written to {}", path.display());
    }

    if result.success() {
        println!("\n✓ Packaging succeeded!");
        Ok(())
    } else {
        anyhow::bail!("Packaging failed");
    }
}

fn print_event(event: PipelineEvent) {
    match event {
        PipelineEvent::StageStarted { stage } => {
            println!("▶ Stage '{}' started", stage);
        }
        PipelineEvent::StageLog { stage, line } => {
            let stream_marker = match line.stream {
                LogStream::Stdout => " ",
                LogStream::Stderr => "!",
                LogStream::System => "*",
            };
            println!("  [{}]{} {}", stage, stream_marker, line.content);
        }
        PipelineEvent::StageCompleted { stage, status } => match status {
            StageStatus::Succeeded => println!("✓ Stage '{}' completed successfully\n", stage),
            StageStatus::Failed { message } => {
                println!("✗ Stage '{}' failed: {}\n", stage, message)
            }
            _ => {}
        },
        PipelineEvent::ArtifactPublished { manifest } => {
            println!(
                "⇪ Published {} ({} file(s), {} bytes, expires {})",
                manifest.name,
                manifest.files.len(),
                manifest.total_size(),
                manifest.expires_at.format("%Y-%m-%d")
            );
        }
        PipelineEvent::PipelineCompleted { success, .. } => {
            if success {
                println!("--- Packaging run completed successfully ---");
            } else {
                println!("--- Packaging run failed ---");
            }
        }
    }
}

fn print_summary(result: &PipelineResult) {
    println!("\n--- Stage Summary (run {}) ---", result.run.id.short());
    for stage in &result.run.stages {
        println!("  {} - {}", stage.kind, describe(stage));
    }

    if let Some(artifact) = &result.artifact {
        println!("\nArtifact {} (run {}):", artifact.name, artifact.run_id);
        for file in &artifact.files {
            println!("  {} ({} bytes, sha256 {})", file.key.file, file.size, file.checksum);
        }
    }
}

fn describe(stage: &StageResult) -> String {
    let elapsed = stage
        .duration()
        .map(|d| format!(" in {:.1}s", d.num_milliseconds() as f64 / 1000.0))
        .unwrap_or_default();
    match &stage.status {
        StageStatus::Succeeded => format!("✓ succeeded{}", elapsed),
        StageStatus::Failed { message } => format!("✗ failed{}: {}", elapsed, message),
        StageStatus::Skipped { reason } => format!("⊘ skipped: {}", reason),
        StageStatus::Pending => "○ pending".to_string(),
        StageStatus::Running => "▶ running".to_string(),
    }
}
