//! Plan command: show what a run would do.

use anyhow::{Context, Result};
use pgpack_config::BuildContext;
use pgpack_config::context::TriggerParams;
use pgpack_core::RunId;
use pgpack_core::pipeline::{Stage, StageAction};
use serde::Serialize;

use super::Environment;

#[derive(Serialize)]
struct PlanDocument<'a> {
    context: &'a BuildContext,
    stages: &'a [Stage],
}

pub fn show(env: &Environment, params: TriggerParams, json: bool) -> Result<()> {
    let ctx = env.resolve(params)?;
    let stages = pgpack_runner::plan(&ctx, RunId::new()).context("Failed to plan run")?;

    if json {
        let doc = PlanDocument {
            context: &ctx,
            stages: &stages,
        };
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    println!("Workflow: {} ({})", ctx.workflow.name, env.workflow_path.display());
    println!("Tag: {}", ctx.request.tag());
    println!("PostgreSQL: {}", ctx.pg_version());
    println!("OS: {}", ctx.os_name);
    println!("Workspace: {}", ctx.workspace.display());
    println!(
        "Artifact: {} (kept {} days)",
        ctx.artifact_name, ctx.workflow.artifact.retention_days
    );
    println!("Files: {}", ctx.artifact_pattern);

    for (idx, stage) in stages.iter().enumerate() {
        println!("\n{}. {}", idx + 1, stage.kind);
        match &stage.action {
            StageAction::RequirePaths { paths } => {
                for path in paths {
                    println!("   require {}", path.display());
                }
            }
            StageAction::Clone { dest, .. } => {
                println!("   remove {} if present", dest.display());
            }
            StageAction::ProvisionPostgres(p) => {
                println!("   download {}", p.source_url);
                println!("   into {}", p.archive.display());
            }
            StageAction::Publish(spec) => {
                println!("   upload {} as {}", spec.pattern, spec.name);
            }
            StageAction::Run { .. } => {}
        }
        for job in stage.action.jobs() {
            match &job.working_dir {
                Some(dir) => println!("   $ {}  (in {})", job.display_command(), dir.display()),
                None => println!("   $ {}", job.display_command()),
            }
        }
        if let StageAction::ProvisionPostgres(p) = &stage.action {
            println!("   verify {} --version", p.pg_config().display());
        }
    }

    Ok(())
}
