//! Core domain types and traits for pgpack.
//!
//! This crate contains:
//! - Run identifiers and the build request
//! - Stage definitions and run results
//! - Executor trait and job types
//! - Artifact storage abstraction

pub mod artifact;
pub mod error;
pub mod executor;
pub mod id;
pub mod pipeline;
pub mod request;

pub use error::{Error, Result};
pub use id::RunId;
pub use request::BuildRequest;
