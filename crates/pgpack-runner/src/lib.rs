//! Pipeline planning and execution for pgpack.
//!
//! Turns a resolved build context into the fixed list of packaging stages
//! and runs them one after another through an executor, publishing the
//! resulting `.deb` files to an artifact store.

pub mod error;
pub mod fetch;
pub mod orchestrator;
pub mod plan;
pub mod provision;
pub mod publish;

pub use error::{RunnerError, RunnerResult};
pub use fetch::{HttpFetcher, SourceFetcher};
pub use orchestrator::{PipelineEvent, PipelineOrchestrator, PipelineResult};
pub use plan::plan;
