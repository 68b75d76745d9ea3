//! ci.build: One attempt to test a specific revision.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::models::project::CiProject;
use crate::models::result::CiBuildResult;
use crate::schema::ci_builds;

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = ci_builds)]
pub struct CiBuild {
    pub id: i64,
    pub project_id: i64,
    pub build_number: i32,
    pub branch: String,
    pub sha: String,
    /// 0 for branch builds.
    pub pull_request_id: i32,
    /// Last pipeline state reached, see `events::build::PipelineState`.
    pub state: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i32>,
    pub create_date: Option<DateTime<Utc>>,
    pub write_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = ci_builds)]
pub struct NewCiBuild {
    pub project_id: i64,
    pub build_number: i32,
    pub branch: String,
    pub sha: String,
    pub pull_request_id: i32,
    pub state: String,
}

impl CiBuild {
    pub fn is_pull_request(&self) -> bool {
        self.pull_request_id > 0
    }

    /// `owner / name / branch`
    pub fn display_name(&self, project: &CiProject) -> String {
        format!("{project} / {}", self.branch)
    }

    /// Container name, unique per build.
    ///
    /// The numeric prefix is `(project_id, pull_request_id, build_number)`
    /// and alone identifies the build; the owner/name slug after it is only
    /// for people reading `docker ps`.
    pub fn environment_name(&self, project: &CiProject) -> String {
        let slug: String = format!("{}-{}", project.owner, project.name)
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
                    c.to_ascii_lowercase()
                } else {
                    '-'
                }
            })
            .collect();
        format!(
            "ci-{}-pr{}-{}-{slug}",
            project.id, self.pull_request_id, self.build_number
        )
    }

    /// Checkout path inside the environment; owned by this build alone.
    pub fn working_directory(&self, workspace_dir: &str, project: &CiProject) -> String {
        format!(
            "{}/{}/{}/{}",
            workspace_dir.trim_end_matches('/'),
            project.owner,
            project.name,
            self.id
        )
    }

    /// Web page of the pull request, or of the repository for branch builds.
    pub fn pull_request_url(&self, project: &CiProject) -> String {
        if self.is_pull_request() {
            format!(
                "https://github.com/{}/{}/pull/{}",
                project.owner, project.name, self.pull_request_id
            )
        } else {
            project.html_url()
        }
    }

    pub fn color(result: Option<&CiBuildResult>) -> &'static str {
        match result {
            None => "orange",
            Some(r) if r.succeeded => "green",
            Some(_) => "red",
        }
    }
}

#[cfg(test)]
pub(crate) fn sample_build(pull_request_id: i32, build_number: i32) -> CiBuild {
    CiBuild {
        id: 41,
        project_id: 1,
        build_number,
        branch: "feature/login".to_string(),
        sha: "6ab4d34e2f".to_string(),
        pull_request_id,
        state: "created".to_string(),
        started_at: None,
        finished_at: None,
        duration_ms: None,
        create_date: None,
        write_date: None,
    }
}
