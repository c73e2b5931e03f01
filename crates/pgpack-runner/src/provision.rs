//! PostgreSQL provisioning helpers.
//!
//! Builds always start from a freshly downloaded archive in an empty source
//! directory; nothing is reused from earlier runs.

use pgpack_core::RunId;
use pgpack_core::executor::JobSpec;
use pgpack_core::pipeline::PostgresProvision;
use tracing::debug;

use crate::fetch::SourceFetcher;
use crate::{RunnerError, RunnerResult};

/// Empty the source directory and download the archive.
pub async fn prepare_source(
    fetcher: &dyn SourceFetcher,
    provision: &PostgresProvision,
) -> RunnerResult<u64> {
    if tokio::fs::try_exists(&provision.src_dir).await? {
        debug!(dir = %provision.src_dir.display(), "Removing previous source tree");
        tokio::fs::remove_dir_all(&provision.src_dir).await?;
    }
    tokio::fs::create_dir_all(&provision.src_dir).await?;

    fetcher.fetch(&provision.source_url, &provision.archive).await
}

/// Job asking the freshly installed `pg_config` for its version.
pub fn version_check(provision: &PostgresProvision, run_id: RunId) -> JobSpec {
    JobSpec::new(
        run_id,
        "verify",
        vec![
            provision.pg_config().display().to_string(),
            "--version".to_string(),
        ],
    )
}

/// Check `pg_config --version` output against the requested version.
///
/// The output must contain a `PostgreSQL <version>` line with exactly that
/// version; `15.4` does not accept `15.40`.
pub fn check_reported_version(output: &[String], expected: &str) -> RunnerResult<()> {
    let reported = output
        .iter()
        .find_map(|line| line.trim().strip_prefix("PostgreSQL "))
        .and_then(|rest| rest.split_whitespace().next());

    match reported {
        Some(version) if version == expected => Ok(()),
        Some(version) => Err(RunnerError::Verification(format!(
            "expected PostgreSQL {}, pg_config reports {}",
            expected, version
        ))),
        None => Err(RunnerError::Verification(
            "pg_config did not report a PostgreSQL version".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingFetcher {
        fetched: Mutex<Vec<(String, PathBuf)>>,
    }

    #[async_trait]
    impl SourceFetcher for RecordingFetcher {
        async fn fetch(&self, url: &str, dest: &Path) -> RunnerResult<u64> {
            self.fetched
                .lock()
                .unwrap()
                .push((url.to_string(), dest.to_path_buf()));
            tokio::fs::write(dest, b"archive").await?;
            Ok(7)
        }
    }

    fn provision(root: &Path) -> PostgresProvision {
        PostgresProvision {
            version: "15.4".to_string(),
            source_url: "https://ftp.postgresql.org/pub/source/v15.4/postgresql-15.4.tar.bz2"
                .to_string(),
            archive: root.join("postgresql-15.4.tar.bz2"),
            src_dir: root.join("pgbuild"),
            install_dir: root.join("postgresql"),
            jobs: vec![],
        }
    }

    #[tokio::test]
    async fn test_prepare_source_starts_clean() {
        let dir = tempfile::tempdir().unwrap();
        let provision = provision(dir.path());
        std::fs::create_dir_all(&provision.src_dir).unwrap();
        std::fs::write(provision.src_dir.join("stale.o"), b"old").unwrap();

        let fetcher = RecordingFetcher::default();
        let written = prepare_source(&fetcher, &provision).await.unwrap();

        assert_eq!(written, 7);
        assert!(provision.src_dir.is_dir());
        assert!(!provision.src_dir.join("stale.o").exists());
        assert!(provision.archive.exists());
        let fetched = fetcher.fetched.lock().unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].0, provision.source_url);
    }

    #[test]
    fn test_version_check_job() {
        let provision = provision(Path::new("/work"));
        let job = version_check(&provision, RunId::new());
        assert_eq!(
            job.command,
            vec!["/work/postgresql/bin/pg_config", "--version"]
        );
    }

    #[test]
    fn test_check_reported_version() {
        let lines = |s: &str| vec![s.to_string()];
        assert!(check_reported_version(&lines("PostgreSQL 15.4"), "15.4").is_ok());
        assert!(check_reported_version(&lines("PostgreSQL 15.4 (Debian)"), "15.4").is_ok());
        assert!(matches!(
            check_reported_version(&lines("PostgreSQL 15.40"), "15.4"),
            Err(RunnerError::Verification(_))
        ));
        assert!(matches!(
            check_reported_version(&lines("PostgreSQL 14.2"), "15.4"),
            Err(RunnerError::Verification(_))
        ));
        assert!(check_reported_version(&[], "15.4").is_err());
    }
}
