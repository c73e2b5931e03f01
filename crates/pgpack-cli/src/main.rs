//! pgpack CLI tool.

use clap::{Args, Parser, Subcommand, ValueEnum};
use pgpack_config::context::TriggerParams;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "pgpack")]
#[command(about = "Build timescaledb-vector Debian packages against PostgreSQL", long_about = None)]
struct Cli {
    /// Workflow file (default: pgpack.kdl in the workspace)
    #[arg(long, global = true)]
    workflow: Option<PathBuf>,

    /// System configuration file
    #[arg(long, global = true, env = "PGPACK_SYSTEM_CONFIG")]
    system: Option<PathBuf>,

    /// Workspace root (default: current directory)
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Build and publish packages
    Run {
        #[command(flatten)]
        trigger: TriggerArgs,
        /// Print what would run without touching the host
        #[arg(long)]
        dry_run: bool,
        /// Write the run result as JSON to this file
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Show the resolved configuration and every stage's commands
    Plan {
        #[command(flatten)]
        trigger: TriggerArgs,
        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },
    /// Validate a workflow file
    Validate {
        /// Path to the workflow file
        path: Option<PathBuf>,
    },
    /// Manage published artifacts
    Artifacts {
        #[command(subcommand)]
        command: ArtifactCommands,
    },
}

#[derive(Args, Debug)]
struct TriggerArgs {
    /// Extension release tag to package
    #[arg(long, env = "PGPACK_TAG")]
    tag: String,
    /// PostgreSQL major version
    #[arg(long = "pg", env = "PG")]
    pg_major: Option<String>,
    /// PostgreSQL minor version
    #[arg(long = "pg-min", env = "PG_MIN")]
    pg_minor: Option<String>,
    /// OS identifier passed to the packaging script
    #[arg(long)]
    os: Option<String>,
}

impl From<TriggerArgs> for TriggerParams {
    fn from(args: TriggerArgs) -> Self {
        TriggerParams {
            tag: args.tag,
            pg_major: args.pg_major,
            pg_minor: args.pg_minor,
            os: args.os,
        }
    }
}

#[derive(Subcommand)]
enum ArtifactCommands {
    /// List stored uploads, newest first
    List {
        /// Only uploads with this artifact name
        #[arg(long)]
        name: Option<String>,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Copy an upload's files out of the store
    Download {
        /// Artifact name, e.g. vector-v0.2.0-pg15
        name: String,
        /// Run ID (default: newest upload)
        #[arg(long)]
        run: Option<String>,
        /// Destination directory
        #[arg(long, default_value = ".")]
        out: PathBuf,
    },
    /// Delete expired uploads
    Prune {
        /// Also delete uploads older than this many days
        #[arg(long)]
        older_than_days: Option<u32>,
        /// Always keep this many newest uploads per artifact name
        #[arg(long)]
        keep: Option<u32>,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let env = commands::Environment::load(
        cli.workspace.as_deref(),
        cli.workflow.as_deref(),
        cli.system.as_deref(),
    );

    match cli.command {
        Commands::Run {
            trigger,
            dry_run,
            report,
        } => {
            commands::run::run(&env?, trigger.into(), dry_run, report.as_deref()).await?;
        }
        Commands::Plan { trigger, json } => {
            commands::plan::show(&env?, trigger.into(), json)?;
        }
        Commands::Validate { path } => {
            let path = match (path, cli.workflow) {
                (Some(path), _) | (None, Some(path)) => path,
                (None, None) => commands::default_workflow_path(cli.workspace.as_deref())?,
            };
            commands::validate(&path)?;
        }
        Commands::Artifacts { command } => {
            let env = env?;
            match command {
                ArtifactCommands::List { name, json } => {
                    commands::artifacts::list(&env, name.as_deref(), json).await?;
                }
                ArtifactCommands::Download { name, run, out } => {
                    commands::artifacts::download(&env, &name, run.as_deref(), &out).await?;
                }
                ArtifactCommands::Prune {
                    older_than_days,
                    keep,
                } => {
                    commands::artifacts::prune(&env, older_than_days, keep).await?;
                }
            }
        }
    }

    Ok(())
}
