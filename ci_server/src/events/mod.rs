//! Build lifecycle.
//!
//! The pipeline state is the source of truth for where a build stands;
//! every transition is persisted on the build row.

pub mod build;
