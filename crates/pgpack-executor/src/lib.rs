//! Job execution backends for pgpack.
//!
//! Provides executor implementations for running build jobs:
//! - Local subprocesses (real builds)
//! - Dry run (records jobs, runs nothing)

pub mod dry_run;
pub mod local;

pub use dry_run::DryRunExecutor;
pub use local::LocalExecutor;
pub use pgpack_core::executor::{
    Executor, JobHandle, JobResult, JobSpec, JobStatus, LogLine, LogStream,
};
