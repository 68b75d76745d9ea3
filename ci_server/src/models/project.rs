//! ci.project: A source repository builds run for.

use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::schema::ci_projects;

static REPOSITORY_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:git@github\.com:|https?://(?:[^@/]+@)?github\.com/)([^/\s]+)/([^/\s]+?)(?:\.git)?/?$")
        .expect("repository url pattern")
});

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = ci_projects)]
pub struct CiProject {
    pub id: i64,
    pub owner: String,
    pub name: String,
    pub git_repository: String,
    pub private: bool,
    /// Builds only execute for approved projects.
    pub approved: bool,
    /// Mean duration in milliseconds of the most recent finished builds.
    pub average_time: Option<i32>,
    /// Highest build number handed out so far; 0 before the first build.
    pub last_build_number: i32,
    pub active: bool,
    pub create_date: Option<DateTime<Utc>>,
    pub write_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Insertable, Deserialize)]
#[diesel(table_name = ci_projects)]
pub struct NewCiProject {
    pub owner: String,
    pub name: String,
    pub git_repository: String,
    pub private: bool,
    pub approved: bool,
}

impl NewCiProject {
    /// Project record for a repository URL such as `git@github.com:owner/name.git`.
    pub fn from_url(url: &str, private: bool, approved: bool) -> Option<Self> {
        let (owner, name) = parse_repository_url(url)?;
        Some(Self {
            owner,
            name,
            git_repository: url.to_string(),
            private,
            approved,
        })
    }
}

impl CiProject {
    /// URL the environment clones from. Private repositories embed the token.
    pub fn clone_url(&self, token: &str) -> String {
        if self.private {
            format!("https://{token}@github.com/{}/{}", self.owner, self.name)
        } else {
            format!("https://github.com/{}/{}", self.owner, self.name)
        }
    }

    pub fn html_url(&self) -> String {
        format!("https://github.com/{}/{}/", self.owner, self.name)
    }

    /// `owner/name`, the addressing unit of the GitHub API.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

impl fmt::Display for CiProject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} / {}", self.owner, self.name)
    }
}

/// Split a GitHub repository URL into `(owner, name)`.
pub fn parse_repository_url(url: &str) -> Option<(String, String)> {
    let caps = REPOSITORY_URL.captures(url.trim())?;
    Some((caps[1].to_string(), caps[2].to_string()))
}

#[cfg(test)]
pub(crate) fn sample_project(private: bool) -> CiProject {
    CiProject {
        id: 1,
        owner: "acme".to_string(),
        name: "widgets".to_string(),
        git_repository: "git@github.com:acme/widgets.git".to_string(),
        private,
        approved: true,
        average_time: None,
        last_build_number: 0,
        active: true,
        create_date: None,
        write_date: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ssh_and_https_urls() {
        assert_eq!(
            parse_repository_url("git@github.com:tind/balder.git"),
            Some(("tind".to_string(), "balder".to_string()))
        );
        assert_eq!(
            parse_repository_url("https://github.com/acme/widgets"),
            Some(("acme".to_string(), "widgets".to_string()))
        );
        assert_eq!(
            parse_repository_url("https://token@github.com/acme/widgets.git"),
            Some(("acme".to_string(), "widgets".to_string()))
        );
        assert_eq!(parse_repository_url("https://gitlab.com/acme/widgets"), None);
        assert_eq!(parse_repository_url("git@github.com:acme"), None);
    }

    #[test]
    fn new_project_from_url() {
        let project = NewCiProject::from_url("git@github.com:tind/balder.git", true, false).unwrap();
        assert_eq!(project.owner, "tind");
        assert_eq!(project.name, "balder");
        assert_eq!(project.git_repository, "git@github.com:tind/balder.git");
        assert!(!project.approved);
    }

    #[test]
    fn clone_url_depends_on_visibility() {
        assert_eq!(
            sample_project(false).clone_url("secret"),
            "https://github.com/acme/widgets"
        );
        assert_eq!(
            sample_project(true).clone_url("secret"),
            "https://secret@github.com/acme/widgets"
        );
    }

    #[test]
    fn display_is_owner_slash_name() {
        assert_eq!(sample_project(false).to_string(), "acme / widgets");
    }
}
