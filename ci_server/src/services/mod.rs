//! Pipeline services: environments, configuration, tasks, reporting, orchestration.

pub mod config_loader;
pub mod environment_service;
pub mod github_service;
pub mod orchestrator;
pub mod reporter;
pub mod task_runner;
