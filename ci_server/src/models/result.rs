//! ci.build.result: Outcome of a build's task execution.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::schema::ci_build_results;

/// Log of a build that was refused because its project is not approved.
pub const NOT_APPROVED_MARKER: &str = "This project is not approved for automatic builds.";

const LOG_RULE: &str = "------------------------------------";

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = ci_build_results)]
pub struct CiBuildResult {
    pub id: i64,
    pub build_id: i64,
    pub succeeded: bool,
    pub result_log: String,
    /// Exit codes of the attempted tasks, comma separated, in task order.
    pub return_codes: String,
    pub create_date: Option<DateTime<Utc>>,
    pub write_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Insertable, AsChangeset)]
#[diesel(table_name = ci_build_results)]
pub struct NewCiBuildResult {
    pub build_id: i64,
    pub succeeded: bool,
    pub result_log: String,
    pub return_codes: String,
}

impl NewCiBuildResult {
    pub fn from_outcome(build_id: i64, outcome: &BuildOutcome) -> Self {
        Self {
            build_id,
            succeeded: outcome.succeeded,
            result_log: outcome.log.clone(),
            return_codes: outcome.return_codes(),
        }
    }
}

impl CiBuildResult {
    pub fn outcome(&self) -> BuildOutcome {
        BuildOutcome {
            succeeded: self.succeeded,
            log: self.result_log.clone(),
            exit_codes: self
                .return_codes
                .split(',')
                .filter_map(|c| c.trim().parse().ok())
                .collect(),
        }
    }
}

/// Running result of a pipeline, threaded through each task execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BuildOutcome {
    pub succeeded: bool,
    pub log: String,
    pub exit_codes: Vec<i32>,
}

impl BuildOutcome {
    pub fn not_approved() -> Self {
        Self::failed(NOT_APPROVED_MARKER)
    }

    /// Outcome of a pipeline that broke; the reason becomes the log.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            log: reason.into(),
            exit_codes: Vec::new(),
        }
    }

    /// Append one task block and its exit code.
    pub fn record_task(mut self, task: &str, output: &str, exit_code: i32) -> Self {
        self.log.push_str(&format!("Task: {task}\n{LOG_RULE}\n"));
        self.log.push_str(output);
        if !output.is_empty() && !output.ends_with('\n') {
            self.log.push('\n');
        }
        self.log.push_str(&format!(
            "{LOG_RULE}\nExited with exit code: {exit_code}\n\n"
        ));
        self.exit_codes.push(exit_code);
        let verdicts: Vec<Option<bool>> = self.exit_codes.iter().map(|c| Some(*c == 0)).collect();
        self.succeeded = evaluate_results(&verdicts);
        self
    }

    /// Mark a partially run outcome failed, keeping its task blocks and exit codes.
    pub fn interrupted(mut self, reason: &str) -> Self {
        if !self.log.is_empty() && !self.log.ends_with('\n') {
            self.log.push('\n');
        }
        self.log.push_str(reason);
        self.succeeded = false;
        self
    }

    /// Number of task blocks in the log.
    pub fn task_count(&self) -> usize {
        self.exit_codes.len()
    }

    pub fn return_codes(&self) -> String {
        self.exit_codes
            .iter()
            .map(i32::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Summary comment posted after the tasks ran.
    pub fn comment_message(&self, build_url: &str) -> String {
        if self.succeeded {
            format!("All tasks passed.\n\n{build_url}")
        } else {
            format!("Be careful, the tests failed.\n\n{build_url}")
        }
    }
}

/// Aggregate per-task verdicts: any explicit failure fails the build,
/// entries without a verdict do not count against it.
pub fn evaluate_results(verdicts: &[Option<bool>]) -> bool {
    verdicts.iter().all(|v| *v != Some(false))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_task_appends_block_and_code() {
        let outcome = BuildOutcome::default()
            .record_task("echo ok", "ok", 0)
            .record_task("exit 1", "", 1);

        assert_eq!(outcome.exit_codes, vec![0, 1]);
        assert_eq!(outcome.task_count(), 2);
        assert!(!outcome.succeeded);
        assert_eq!(outcome.log.matches("Task: ").count(), 2);
        assert!(outcome.log.starts_with(
            "Task: echo ok\n------------------------------------\nok\n------------------------------------\nExited with exit code: 0\n\n"
        ));
        assert_eq!(outcome.return_codes(), "0,1");
    }

    #[test]
    fn row_round_trip_keeps_exit_codes() {
        let outcome = BuildOutcome::default().record_task("make", "built\n", 0);
        let row = NewCiBuildResult::from_outcome(9, &outcome);
        let stored = CiBuildResult {
            id: 1,
            build_id: row.build_id,
            succeeded: row.succeeded,
            result_log: row.result_log,
            return_codes: row.return_codes,
            create_date: None,
            write_date: None,
        };
        assert_eq!(stored.outcome(), outcome);
    }

    #[test]
    fn interrupted_keeps_completed_tasks() {
        let outcome = BuildOutcome::default()
            .record_task("echo ok", "ok", 0)
            .interrupted("build was cancelled");
        assert!(!outcome.succeeded);
        assert_eq!(outcome.exit_codes, vec![0]);
        assert!(outcome.log.starts_with("Task: echo ok\n"));
        assert!(outcome.log.ends_with("Exited with exit code: 0\n\nbuild was cancelled"));

        assert_eq!(BuildOutcome::default().interrupted("timed out").log, "timed out");
    }

    #[test]
    fn a_failed_task_keeps_the_build_failed() {
        let outcome = BuildOutcome::default()
            .record_task("exit 1", "", 1)
            .record_task("true", "", 0);
        assert!(!outcome.succeeded);
    }

    #[test]
    fn not_approved_is_a_failure_with_marker() {
        let outcome = BuildOutcome::not_approved();
        assert!(!outcome.succeeded);
        assert_eq!(outcome.log, NOT_APPROVED_MARKER);
        assert!(outcome.exit_codes.is_empty());
    }

    #[test]
    fn evaluate_results_ignores_missing_verdicts() {
        assert!(evaluate_results(&[Some(true)]));
        assert!(evaluate_results(&[Some(true), None]));
        assert!(!evaluate_results(&[Some(true), Some(false)]));
        assert!(!evaluate_results(&[Some(false), Some(true)]));
        assert!(!evaluate_results(&[Some(false), None]));
    }

    #[test]
    fn comment_message_depends_on_outcome() {
        let passed = BuildOutcome::default().record_task("true", "", 0);
        let failed = BuildOutcome::default().record_task("false", "", 1);
        assert!(passed.comment_message("u").starts_with("All tasks passed"));
        assert!(failed.comment_message("u").contains("failed"));
        assert!(failed.comment_message("https://ci/b/1").ends_with("https://ci/b/1"));
    }
}
