//! Data models: projects, builds and their results.

pub mod build;
pub mod project;
pub mod result;
pub mod trigger;
