//! KDL configuration parsing for pgpack.
//!
//! This crate handles:
//! - Workflow definitions (pgpack.kdl)
//! - System configuration (artifact store, executor)
//! - Variable interpolation
//! - Resolving a build request into the context every stage reads

pub mod context;
pub mod error;
mod kdl_util;
pub mod system;
pub mod variables;
pub mod workflow;

pub use context::BuildContext;
pub use error::{ConfigError, ConfigResult};
pub use system::SystemConfig;
pub use variables::{VariableContext, VariableContextBuilder};
pub use workflow::WorkflowConfig;
