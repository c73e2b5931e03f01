//! Artifact storage for pgpack.
//!
//! Published packages are kept on the local filesystem, one directory per
//! artifact name and run, each with a JSON manifest recording checksums and
//! the retention deadline.

pub mod error;
pub mod local;

pub use error::{StoreError, StoreResult};
pub use local::LocalArtifactStore;
