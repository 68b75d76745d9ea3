//! Error taxonomy of the build pipeline and its collaborators.

use std::time::Duration;

/// Failures raised by an environment backend.
#[derive(Debug, thiserror::Error)]
pub enum EnvironmentError {
    #[error("could not provision environment {name}: {reason}")]
    Provision { name: String, reason: String },
    #[error("could not start environment {name}: {reason}")]
    Start { name: String, reason: String },
    #[error("command channel to {name} failed: {reason}")]
    Command { name: String, reason: String },
}

/// Why a pipeline stopped before producing a normal task outcome.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("project is not approved for automatic builds")]
    NotApproved,
    #[error(transparent)]
    Provision(EnvironmentError),
    #[error(transparent)]
    Start(EnvironmentError),
    #[error("clone failed: {0}")]
    Clone(String),
    #[error("configuration missing: {0}")]
    ConfigurationMissing(String),
    /// Catch-all for unexpected failures while tasks run.
    #[error("{0}")]
    Task(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("build was cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Metric label for `ci_errors_total`.
    pub fn category(&self) -> &'static str {
        match self {
            PipelineError::NotApproved => "not_approved",
            PipelineError::Provision(_) => "provision",
            PipelineError::Start(_) => "start",
            PipelineError::Clone(_) => "clone",
            PipelineError::ConfigurationMissing(_) => "configuration",
            PipelineError::Task(_) => "pipeline",
            PipelineError::Timeout(_) => "timeout",
            PipelineError::Cancelled => "cancelled",
        }
    }
}

impl From<EnvironmentError> for PipelineError {
    fn from(err: EnvironmentError) -> Self {
        match err {
            EnvironmentError::Provision { .. } => PipelineError::Provision(err),
            EnvironmentError::Start { .. } => PipelineError::Start(err),
            EnvironmentError::Command { .. } => PipelineError::Task(err.to_string()),
        }
    }
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        PipelineError::Task(format!("store: {err}"))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },
    #[error("store lock poisoned")]
    Poisoned,
    #[error("database: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("database pool: {0}")]
    Pool(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Reasons the orchestrator refuses to accept a build.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("build queue is full")]
    QueueFull,
    #[error("orchestrator is shutting down")]
    ShuttingDown,
    #[error("build {0} already has a running pipeline")]
    AlreadyRunning(i64),
    #[error("not a GitHub repository: {0}")]
    InvalidRepository(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}
