//! Normalized build requests parsed from inbound repository events.

use serde::{Deserialize, Serialize};

/// What a push, pull request or retest comment asks us to build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRequest {
    pub repo_url: String,
    pub repo_owner: String,
    pub repo_name: String,
    pub private: bool,
    /// 0 for branch builds.
    pub pull_request_id: i32,
    pub branch: String,
    pub sha: String,
}

/// A retest comment names the pull request but not the revision;
/// branch and sha are resolved from the last build of that pull request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetestRequest {
    pub repo_url: String,
    pub repo_owner: String,
    pub repo_name: String,
    pub private: bool,
    pub pull_request_id: i32,
}

impl RetestRequest {
    pub fn resolve(self, branch: String, sha: String) -> BuildRequest {
        BuildRequest {
            repo_url: self.repo_url,
            repo_owner: self.repo_owner,
            repo_name: self.repo_name,
            private: self.private,
            pull_request_id: self.pull_request_id,
            branch,
            sha,
        }
    }
}

/// `git@github.com:<owner>/<name>.git`
pub fn repository_url(owner: &str, name: &str) -> String {
    format!("git@github.com:{owner}/{name}.git")
}
