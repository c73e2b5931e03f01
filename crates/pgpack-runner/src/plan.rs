//! Stage planning.
//!
//! Expands a resolved [`BuildContext`] into the seven packaging stages with
//! every command fully spelled out. Nothing here touches the host, so the
//! same plan backs both real runs and `pgpack plan`.

use pgpack_config::BuildContext;
use pgpack_core::RunId;
use pgpack_core::executor::JobSpec;
use pgpack_core::pipeline::{PostgresProvision, PublishSpec, Stage, StageAction, StageKind};
use url::Url;

use crate::RunnerResult;

/// Build the stage list for one run.
pub fn plan(ctx: &BuildContext, run_id: RunId) -> RunnerResult<Vec<Stage>> {
    let jobs = JobFactory { ctx, run_id };

    Ok(vec![
        Stage {
            kind: StageKind::Checkout,
            action: checkout(&jobs),
        },
        Stage {
            kind: StageKind::InstallPackages,
            action: install_packages(&jobs),
        },
        Stage {
            kind: StageKind::ProvisionPostgres,
            action: StageAction::ProvisionPostgres(provision_postgres(&jobs)?),
        },
        Stage {
            kind: StageKind::CheckoutExtension,
            action: checkout_extension(&jobs),
        },
        Stage {
            kind: StageKind::InstallToolchain,
            action: install_toolchain(&jobs),
        },
        Stage {
            kind: StageKind::Package,
            action: package(&jobs),
        },
        Stage {
            kind: StageKind::Publish,
            action: StageAction::Publish(PublishSpec {
                name: ctx.artifact_name.clone(),
                pattern: ctx.artifact_pattern.clone(),
                retention: ctx.retention,
            }),
        },
    ])
}

/// Location of the PostgreSQL source archive on the mirror.
pub fn source_url(mirror: &str, version: &str) -> RunnerResult<Url> {
    let mut base = mirror.to_string();
    if !base.ends_with('/') {
        base.push('/');
    }
    Ok(Url::parse(&base)?.join(&format!("v{0}/postgresql-{0}.tar.bz2", version))?)
}

struct JobFactory<'a> {
    ctx: &'a BuildContext,
    run_id: RunId,
}

impl JobFactory<'_> {
    fn job<I, S>(&self, label: &str, args: I) -> JobSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut spec = JobSpec::new(
            self.run_id,
            label,
            args.into_iter().map(Into::into).collect(),
        );
        spec.env = self.ctx.env.clone();
        if let Some(timeout) = self.ctx.job_timeout {
            spec = spec.with_timeout(timeout);
        }
        spec
    }

    /// A job that needs root, prefixed with `sudo` when configured.
    fn privileged<I, S>(&self, label: &str, args: I) -> JobSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut command = Vec::new();
        if self.ctx.sudo {
            command.push("sudo".to_string());
        }
        command.extend(args.into_iter().map(Into::into));
        self.job(label, command)
    }
}

/// Fetch a single commit into a fresh repository at `dest`.
///
/// Fetching by ref instead of `clone --branch` accepts commit ids as well as
/// branch and tag names. Without a reference the remote's `HEAD` is used.
fn git_checkout(
    jobs: &JobFactory<'_>,
    repository: &str,
    reference: Option<&str>,
    dest: &str,
) -> Vec<JobSpec> {
    let reference = reference.unwrap_or("HEAD");
    vec![
        jobs.job("git-init", ["git", "init", "--quiet", dest])
            .in_dir(&jobs.ctx.workspace),
        jobs.job(
            "git-fetch",
            ["git", "-C", dest, "fetch", "--depth", "1", repository, reference],
        )
        .in_dir(&jobs.ctx.workspace),
        jobs.job(
            "git-checkout",
            ["git", "-C", dest, "checkout", "--detach", "FETCH_HEAD"],
        )
        .in_dir(&jobs.ctx.workspace),
    ]
}

fn checkout(jobs: &JobFactory<'_>) -> StageAction {
    let ctx = jobs.ctx;
    match &ctx.workflow.checkout {
        Some(repo) => StageAction::Clone {
            dest: ctx.checkout_dir.clone(),
            jobs: git_checkout(
                jobs,
                &repo.repository,
                repo.reference.as_deref(),
                &ctx.checkout_dir.display().to_string(),
            ),
        },
        None => StageAction::RequirePaths {
            paths: vec![ctx.packaging_script()],
        },
    }
}

fn install_packages(jobs: &JobFactory<'_>) -> StageAction {
    let settings = &jobs.ctx.workflow.packages;
    let packages = settings.all();
    let mut specs = Vec::new();

    if settings.update_index {
        specs.push(
            jobs.privileged("apt-update", ["apt-get", "update"])
                .with_env("DEBIAN_FRONTEND", "noninteractive"),
        );
    }
    if !packages.is_empty() {
        let mut command = vec![
            "apt-get".to_string(),
            "install".to_string(),
            "-y".to_string(),
            "--no-install-recommends".to_string(),
        ];
        command.extend(packages);
        specs.push(
            jobs.privileged("apt-install", command)
                .with_env("DEBIAN_FRONTEND", "noninteractive"),
        );
    }

    StageAction::Run { jobs: specs }
}

fn provision_postgres(jobs: &JobFactory<'_>) -> RunnerResult<PostgresProvision> {
    let ctx = jobs.ctx;
    let version = ctx.pg_version();
    let archive = ctx.workspace.join(format!("postgresql-{}.tar.bz2", version));
    let src_dir = ctx.pg_src_dir.clone();
    let install_dir = ctx.pg_install_dir.clone();

    let extract = jobs
        .job(
            "extract",
            [
                "tar".to_string(),
                "-xjf".to_string(),
                archive.display().to_string(),
                "-C".to_string(),
                src_dir.display().to_string(),
                "--strip-components=1".to_string(),
            ],
        )
        .in_dir(&ctx.workspace);

    let mut configure_args = vec![
        "./configure".to_string(),
        format!("--prefix={}", install_dir.display()),
    ];
    configure_args.extend(ctx.workflow.postgres.configure_flags.iter().cloned());
    let configure = jobs.job("configure", configure_args).in_dir(&src_dir);

    let build = jobs
        .job("make", ["make".to_string(), format!("-j{}", ctx.make_jobs)])
        .in_dir(&src_dir);
    let install = jobs.job("make-install", ["make", "install"]).in_dir(&src_dir);

    Ok(PostgresProvision {
        source_url: source_url(&ctx.workflow.postgres.mirror, &version)?.to_string(),
        version,
        archive,
        src_dir,
        install_dir,
        jobs: vec![extract, configure, build, install],
    })
}

fn checkout_extension(jobs: &JobFactory<'_>) -> StageAction {
    let ctx = jobs.ctx;
    StageAction::Clone {
        dest: ctx.extension_dir.clone(),
        jobs: git_checkout(
            jobs,
            &ctx.workflow.extension.repository,
            Some(ctx.request.tag()),
            &ctx.extension_dir.display().to_string(),
        ),
    }
}

fn install_toolchain(jobs: &JobFactory<'_>) -> StageAction {
    let ctx = jobs.ctx;
    let install = jobs.job(
        "cargo-install-pgrx",
        [
            "cargo",
            "install",
            "cargo-pgrx",
            "--version",
            ctx.workflow.toolchain.pgrx_version.as_str(),
            "--locked",
        ],
    );
    let init = jobs.job(
        "pgrx-init",
        [
            "cargo".to_string(),
            "pgrx".to_string(),
            "init".to_string(),
            format!("--pg{}={}", ctx.request.pg_major(), ctx.pg_config().display()),
        ],
    );
    StageAction::Run {
        jobs: vec![install, init],
    }
}

fn package(jobs: &JobFactory<'_>) -> StageAction {
    let ctx = jobs.ctx;
    let bin_dir = ctx.pg_bin_dir();

    let build = jobs
        .job("pgrx-package", ["cargo", "pgrx", "package"])
        .in_dir(ctx.extension_crate_dir())
        .with_path(&bin_dir);

    let repackage = jobs
        .job(
            "package-deb",
            [
                "bash".to_string(),
                ctx.packaging_script().display().to_string(),
                ctx.request.tag().to_string(),
                ctx.extension_dir.display().to_string(),
                ctx.os_name.clone(),
                ctx.request.pg_major().to_string(),
            ],
        )
        .in_dir(&ctx.checkout_dir)
        .with_path(&bin_dir);

    StageAction::Run {
        jobs: vec![build, repackage],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgpack_config::context::TriggerParams;
    use pgpack_config::workflow::RepositorySettings;
    use pgpack_config::{SystemConfig, WorkflowConfig};
    use std::path::{Path, PathBuf};

    fn context(workflow: WorkflowConfig) -> BuildContext {
        context_at(workflow, "v0.2.0", Path::new("/work"))
    }

    fn context_at(workflow: WorkflowConfig, tag: &str, workspace: &Path) -> BuildContext {
        BuildContext::resolve(
            TriggerParams {
                tag: tag.to_string(),
                pg_major: Some("14".to_string()),
                pg_minor: Some("2".to_string()),
                os: Some("ubuntu-22.04".to_string()),
            },
            &workflow,
            &SystemConfig::default(),
            workspace,
        )
        .unwrap()
    }

    fn stage(stages: &[Stage], kind: StageKind) -> &Stage {
        stages.iter().find(|s| s.kind == kind).unwrap()
    }

    #[test]
    fn test_plan_has_all_stages_in_order() {
        let stages = plan(&context(WorkflowConfig::default()), RunId::new()).unwrap();
        let kinds: Vec<_> = stages.iter().map(|s| s.kind).collect();
        assert_eq!(kinds, StageKind::ALL.to_vec());
    }

    #[test]
    fn test_jobs_carry_run_id_and_env() {
        let run_id = RunId::new();
        let stages = plan(&context(WorkflowConfig::default()), run_id).unwrap();
        for job in stages.iter().flat_map(|s| s.action.jobs()) {
            assert_eq!(job.run_id, run_id);
            assert_eq!(job.env.get("MAKE_JOBS").map(String::as_str), Some("6"));
        }
    }

    #[test]
    fn test_checkout_requires_script_without_repository() {
        let stages = plan(&context(WorkflowConfig::default()), RunId::new()).unwrap();
        match &stage(&stages, StageKind::Checkout).action {
            StageAction::RequirePaths { paths } => {
                assert_eq!(paths, &vec![PathBuf::from("/work/scripts/package-deb.sh")]);
            }
            other => panic!("unexpected action: {other:?}"),
        }
    }

    #[test]
    fn test_checkout_clones_configured_repository() {
        let mut workflow = WorkflowConfig::default();
        workflow.checkout = Some(RepositorySettings {
            repository: "https://github.com/example/packaging".to_string(),
            reference: Some("main".to_string()),
            path: "automation".to_string(),
        });
        let stages = plan(&context(workflow), RunId::new()).unwrap();
        match &stage(&stages, StageKind::Checkout).action {
            StageAction::Clone { dest, jobs } => {
                assert_eq!(dest, &PathBuf::from("/work/automation"));
                let commands: Vec<_> = jobs.iter().map(|j| j.display_command()).collect();
                assert_eq!(
                    commands,
                    vec![
                        "git init --quiet /work/automation",
                        "git -C /work/automation fetch --depth 1 https://github.com/example/packaging main",
                        "git -C /work/automation checkout --detach FETCH_HEAD",
                    ]
                );
            }
            other => panic!("unexpected action: {other:?}"),
        }
    }

    #[test]
    fn test_extension_checkout_fetches_any_ref() {
        let sha = "d087f9f8b1f3c3f5d0a1c6e5a3b4e2f1c9d8e7a6";
        let ctx = context_at(WorkflowConfig::default(), sha, Path::new("/work"));
        let stages = plan(&ctx, RunId::new()).unwrap();
        match &stage(&stages, StageKind::CheckoutExtension).action {
            StageAction::Clone { dest, jobs } => {
                assert_eq!(dest, &PathBuf::from("/work/timescale-vector"));
                let labels: Vec<_> = jobs.iter().map(|j| j.label.as_str()).collect();
                assert_eq!(labels, vec!["git-init", "git-fetch", "git-checkout"]);
                assert_eq!(
                    jobs[1].command,
                    vec![
                        "git",
                        "-C",
                        "/work/timescale-vector",
                        "fetch",
                        "--depth",
                        "1",
                        "https://github.com/timescale/timescale-vector",
                        sha,
                    ]
                );
                assert!(!jobs.iter().any(|j| j.command.iter().any(|a| a == "--branch")));
            }
            other => panic!("unexpected action: {other:?}"),
        }
    }

    #[test]
    fn test_checkout_without_reference_fetches_head() {
        let mut workflow = WorkflowConfig::default();
        workflow.checkout = Some(RepositorySettings {
            repository: "https://github.com/example/packaging".to_string(),
            reference: None,
            path: "automation".to_string(),
        });
        let stages = plan(&context(workflow), RunId::new()).unwrap();
        let jobs = stage(&stages, StageKind::Checkout).action.jobs();
        assert_eq!(jobs[1].command.last().map(String::as_str), Some("HEAD"));
    }

    fn git(dir: &Path, args: &[&str]) -> String {
        let output = std::process::Command::new("git")
            .args([
                "-c",
                "user.name=pgpack",
                "-c",
                "user.email=pgpack@localhost",
                "-c",
                "commit.gpgsign=false",
            ])
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap();
        assert!(output.status.success(), "git {args:?} failed");
        String::from_utf8(output.stdout).unwrap().trim().to_string()
    }

    #[tokio::test]
    async fn test_extension_checkout_of_commit_id() {
        use futures::StreamExt;
        use pgpack_core::executor::Executor;
        use pgpack_executor::LocalExecutor;

        let upstream = tempfile::tempdir().unwrap();
        git(upstream.path(), &["init", "--quiet"]);
        std::fs::write(upstream.path().join("README.md"), "first").unwrap();
        git(upstream.path(), &["add", "README.md"]);
        git(upstream.path(), &["commit", "--quiet", "-m", "first"]);
        let sha = git(upstream.path(), &["rev-parse", "HEAD"]);
        std::fs::write(upstream.path().join("README.md"), "second").unwrap();
        git(upstream.path(), &["commit", "--quiet", "-am", "second"]);
        git(upstream.path(), &["config", "uploadpack.allowAnySHA1InWant", "true"]);

        let workspace = tempfile::tempdir().unwrap();
        let mut workflow = WorkflowConfig::default();
        workflow.extension.repository = format!("file://{}", upstream.path().display());
        let ctx = context_at(workflow, &sha, workspace.path());

        let stages = plan(&ctx, RunId::new()).unwrap();
        let executor = LocalExecutor::new();
        for job in stage(&stages, StageKind::CheckoutExtension).action.jobs() {
            let handle = executor.spawn(job.clone()).await.unwrap();
            let logs = executor.logs(&handle).await.unwrap();
            let result = executor.wait(&handle).await.unwrap();
            let _: Vec<_> = logs.collect().await;
            assert!(result.status.is_success(), "{} failed", job.label);
        }

        assert_eq!(
            std::fs::read_to_string(ctx.extension_dir.join("README.md")).unwrap(),
            "first"
        );
        assert_eq!(git(&ctx.extension_dir, &["rev-parse", "HEAD"]), sha);
    }

    #[test]
    fn test_install_packages() {
        let stages = plan(&context(WorkflowConfig::default()), RunId::new()).unwrap();
        let jobs = stage(&stages, StageKind::InstallPackages).action.jobs();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].command, vec!["sudo", "apt-get", "update"]);
        let install = &jobs[1].command;
        assert_eq!(&install[..5], &["sudo", "apt-get", "install", "-y", "--no-install-recommends"]);
        for package in ["build-essential", "libclang-dev", "bzip2", "dpkg-dev", "debhelper"] {
            assert!(install.iter().any(|p| p == package), "{package}");
        }
    }

    #[test]
    fn test_provision_postgres() {
        let stages = plan(&context(WorkflowConfig::default()), RunId::new()).unwrap();
        let StageAction::ProvisionPostgres(provision) =
            &stage(&stages, StageKind::ProvisionPostgres).action
        else {
            panic!("expected provisioning action");
        };
        assert_eq!(provision.version, "14.2");
        assert_eq!(
            provision.source_url,
            "https://ftp.postgresql.org/pub/source/v14.2/postgresql-14.2.tar.bz2"
        );
        assert_eq!(provision.archive, PathBuf::from("/work/postgresql-14.2.tar.bz2"));

        let labels: Vec<_> = provision.jobs.iter().map(|j| j.label.as_str()).collect();
        assert_eq!(labels, vec!["extract", "configure", "make", "make-install"]);
        assert_eq!(
            provision.jobs[1].command,
            vec!["./configure", "--prefix=/work/postgresql"]
        );
        assert_eq!(provision.jobs[2].command, vec!["make", "-j6"]);
        assert_eq!(provision.jobs[2].working_dir, Some(PathBuf::from("/work/pgbuild")));
    }

    #[test]
    fn test_toolchain_is_pinned() {
        let stages = plan(&context(WorkflowConfig::default()), RunId::new()).unwrap();
        let jobs = stage(&stages, StageKind::InstallToolchain).action.jobs();
        assert_eq!(
            jobs[0].display_command(),
            "cargo install cargo-pgrx --version 0.9.8 --locked"
        );
        assert_eq!(
            jobs[1].display_command(),
            "cargo pgrx init --pg14=/work/postgresql/bin/pg_config"
        );
    }

    #[test]
    fn test_package_jobs_see_postgres_bin() {
        let stages = plan(&context(WorkflowConfig::default()), RunId::new()).unwrap();
        let jobs = stage(&stages, StageKind::Package).action.jobs();

        assert_eq!(
            jobs[0].working_dir,
            Some(PathBuf::from("/work/timescale-vector/timescale_vector"))
        );
        assert_eq!(
            jobs[1].command,
            vec![
                "bash",
                "/work/scripts/package-deb.sh",
                "v0.2.0",
                "/work/timescale-vector",
                "ubuntu-22.04",
                "14",
            ]
        );
        for job in jobs {
            assert_eq!(job.path_prepend, vec![PathBuf::from("/work/postgresql/bin")]);
        }
    }

    #[test]
    fn test_publish_spec() {
        let stages = plan(&context(WorkflowConfig::default()), RunId::new()).unwrap();
        let StageAction::Publish(spec) = &stage(&stages, StageKind::Publish).action else {
            panic!("expected publish action");
        };
        assert_eq!(spec.name, "vector-v0.2.0-pg14");
        assert_eq!(spec.pattern, "/work/pkgdump/timescaledb-vector-*v0.2.0*.deb");
    }

    #[test]
    fn test_source_url_without_trailing_slash() {
        let url = source_url("https://mirror.example.org/pg", "15.4").unwrap();
        assert_eq!(
            url.as_str(),
            "https://mirror.example.org/pg/v15.4/postgresql-15.4.tar.bz2"
        );
    }
}
