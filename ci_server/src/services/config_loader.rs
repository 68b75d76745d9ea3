//! Per-repository build configuration, read from the checked-out revision.

use std::time::Duration;

use serde::Deserialize;

use crate::error::PipelineError;
use crate::services::environment_service::Environment;
use crate::services::task_runner::{run_command, shell_quote};

/// Fixed phrase of the comment posted when no usable configuration exists.
pub const CONFIGURATION_MISSING_PHRASE: &str = "can't continue without it";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildConfiguration {
    /// Shell commands, run in this order.
    pub tasks: Vec<String>,
    pub webhooks: Vec<String>,
    /// Whether summary comments are posted.
    pub comment: bool,
}

#[derive(Deserialize)]
struct RawConfiguration {
    tasks: Option<Vec<String>>,
    #[serde(default)]
    webhooks: Vec<String>,
    #[serde(default = "default_comment")]
    comment: bool,
}

fn default_comment() -> bool {
    true
}

impl BuildConfiguration {
    /// Parse the YAML text of a configuration file.
    ///
    /// A missing or empty `tasks` list is treated like a missing file.
    pub fn parse(text: &str) -> Result<Self, PipelineError> {
        let raw: RawConfiguration = serde_yaml::from_str(text)
            .map_err(|e| PipelineError::ConfigurationMissing(format!("unparsable: {e}")))?;
        let tasks = raw
            .tasks
            .filter(|tasks| !tasks.is_empty())
            .ok_or_else(|| PipelineError::ConfigurationMissing("no tasks defined".to_string()))?;
        Ok(Self {
            tasks,
            webhooks: raw.webhooks,
            comment: raw.comment,
        })
    }
}

/// Read `<working_dir>/<file_name>` from inside the environment and parse it.
pub async fn load(
    env: &dyn Environment,
    working_dir: &str,
    file_name: &str,
    deadline: Duration,
) -> Result<BuildConfiguration, PipelineError> {
    let path = format!("{}/{file_name}", working_dir.trim_end_matches('/'));
    let read = run_command(env, &format!("cat {}", shell_quote(&path)), true, deadline).await?;
    if !read.success() {
        return Err(PipelineError::ConfigurationMissing(format!(
            "{file_name} not found"
        )));
    }
    BuildConfiguration::parse(&read.output)
}

/// Body of the comment explaining why a build stopped before any task ran.
pub fn missing_comment(file_name: &str, error: &PipelineError) -> String {
    format!("{file_name} file is missing or invalid, {CONFIGURATION_MISSING_PHRASE}.\n\n{error}")
}
