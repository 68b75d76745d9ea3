//! Outbound reporting: commit statuses, comments and notification webhooks.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::models::result::BuildOutcome;
use crate::services::github_service::{GitHubClient, StatusPayload};

/// GitHub caps status descriptions at 140 characters.
const MAX_DESCRIPTION: usize = 140;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitState {
    Pending,
    Success,
    Failure,
    Error,
}

impl CommitState {
    pub fn as_str(self) -> &'static str {
        match self {
            CommitState::Pending => "pending",
            CommitState::Success => "success",
            CommitState::Failure => "failure",
            CommitState::Error => "error",
        }
    }

    pub fn from_outcome(outcome: &BuildOutcome) -> Self {
        if outcome.succeeded {
            CommitState::Success
        } else {
            CommitState::Failure
        }
    }

    pub fn is_final(self) -> bool {
        self != CommitState::Pending
    }
}

impl fmt::Display for CommitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a report needs to address a build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildTarget {
    pub build_id: i64,
    /// `owner/name`
    pub repo: String,
    pub git_repository: String,
    pub sha: String,
    pub build_url: String,
    pub pull_request_id: i32,
}

/// JSON body of an outbound notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebhookPayload {
    pub repository: String,
    pub sha: String,
    pub build_url: String,
    pub pull_request_id: i32,
    /// Whether the build succeeded.
    pub state: bool,
    pub return_code: String,
}

impl WebhookPayload {
    pub fn new(target: &BuildTarget, outcome: &BuildOutcome) -> Self {
        Self {
            repository: target.git_repository.clone(),
            sha: target.sha.clone(),
            build_url: target.build_url.clone(),
            pull_request_id: target.pull_request_id,
            state: outcome.succeeded,
            return_code: outcome.return_codes(),
        }
    }
}

#[async_trait]
pub trait Reporter: Send + Sync {
    async fn set_commit_status(
        &self,
        target: &BuildTarget,
        state: CommitState,
        description: &str,
    ) -> anyhow::Result<()>;

    async fn post_comment(&self, target: &BuildTarget, body: &str) -> anyhow::Result<()>;

    async fn send_webhook(&self, url: &str, payload: &WebhookPayload) -> anyhow::Result<()>;
}

/// Reports to GitHub and POSTs notifications with reqwest.
pub struct GitHubReporter {
    github: GitHubClient,
    http: reqwest::Client,
    context: String,
    webhook_timeout: Duration,
}

impl GitHubReporter {
    pub fn new(github: GitHubClient, context: &str, webhook_timeout: Duration) -> Self {
        Self {
            github,
            http: reqwest::Client::new(),
            context: context.to_string(),
            webhook_timeout,
        }
    }
}

#[async_trait]
impl Reporter for GitHubReporter {
    async fn set_commit_status(
        &self,
        target: &BuildTarget,
        state: CommitState,
        description: &str,
    ) -> anyhow::Result<()> {
        let status = StatusPayload {
            state: state.as_str().to_string(),
            target_url: target.build_url.clone(),
            description: truncate_description(description),
            context: self.context.clone(),
        };
        self.github.post_status(&target.repo, &target.sha, &status).await
    }

    async fn post_comment(&self, target: &BuildTarget, body: &str) -> anyhow::Result<()> {
        self.github
            .post_commit_comment(&target.repo, &target.sha, body)
            .await
    }

    async fn send_webhook(&self, url: &str, payload: &WebhookPayload) -> anyhow::Result<()> {
        let resp = self
            .http
            .post(url)
            .timeout(self.webhook_timeout)
            .header("User-Agent", "ci-server")
            .json(payload)
            .send()
            .await?;
        if !resp.status().is_success() {
            anyhow::bail!("webhook {url} answered {}", resp.status());
        }
        Ok(())
    }
}

/// Status description for a finished build.
pub fn outcome_description(outcome: &BuildOutcome) -> &'static str {
    if outcome.succeeded {
        "All tasks passed"
    } else {
        "The tests failed"
    }
}

fn truncate_description(description: &str) -> String {
    if description.chars().count() <= MAX_DESCRIPTION {
        return description.to_string();
    }
    let mut short: String = description.chars().take(MAX_DESCRIPTION - 3).collect();
    short.push_str("...");
    short
}
