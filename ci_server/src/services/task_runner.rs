//! Sequential, fail-fast task execution inside a build environment.

use std::time::{Duration, Instant};

use crate::error::PipelineError;
use crate::models::result::BuildOutcome;
use crate::services::environment_service::{CommandOutput, Environment};
use crate::store::BuildStore;

/// Run one remote command under `deadline`.
pub async fn run_command(
    env: &dyn Environment,
    command: &str,
    capture: bool,
    deadline: Duration,
) -> Result<CommandOutput, PipelineError> {
    match tokio::time::timeout(deadline, env.run(command, capture)).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(PipelineError::Timeout(deadline)),
    }
}

/// Single-quote `value` for `sh`.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

pub struct TaskRunner<'a> {
    env: &'a dyn Environment,
    store: &'a dyn BuildStore,
    build_id: i64,
    working_dir: &'a str,
    command_timeout: Duration,
}

impl<'a> TaskRunner<'a> {
    pub fn new(
        env: &'a dyn Environment,
        store: &'a dyn BuildStore,
        build_id: i64,
        working_dir: &'a str,
        command_timeout: Duration,
    ) -> Self {
        Self {
            env,
            store,
            build_id,
            working_dir,
            command_timeout,
        }
    }

    /// Run `tasks` in order, stopping after the first non-zero exit.
    ///
    /// The outcome is persisted after every task. A non-zero exit is part of
    /// the returned outcome; `Err` means the pipeline itself broke.
    pub async fn run_tasks(
        &self,
        tasks: &[String],
        mut outcome: BuildOutcome,
    ) -> Result<BuildOutcome, PipelineError> {
        for task in tasks {
            let started = Instant::now();
            tracing::info!(build_id = self.build_id, task = %task, "Running task");

            let command = format!("cd {} && {task}", shell_quote(self.working_dir));
            let output = run_command(self.env, &command, true, self.command_timeout).await?;

            crate::metrics::task_duration(started.elapsed().as_millis() as u64);
            outcome = outcome.record_task(task, &output.output, output.exit_code);
            self.store
                .save_result(self.build_id, &outcome)
                .await?;

            if !output.success() {
                tracing::warn!(
                    build_id = self.build_id,
                    task = %task,
                    exit_code = output.exit_code,
                    "Task failed"
                );
                break;
            }

            tracing::info!(build_id = self.build_id, task = %task, "Task passed");
        }

        Ok(outcome)
    }
}
