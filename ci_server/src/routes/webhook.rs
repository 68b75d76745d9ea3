//! GitHub webhook handler: turns push, pull request and retest comment events into builds.

use axum::body::Bytes;
use axum::http::{HeaderMap, StatusCode};
use serde_json::Value;

use crate::config::CiConfig;
use crate::error::OrchestratorError;
use crate::models::trigger::{repository_url, BuildRequest, RetestRequest};
use crate::services::github_service;
use crate::services::orchestrator::Orchestrator;

/// Handle an incoming GitHub webhook payload.
pub async fn handle_webhook(
    orchestrator: &Orchestrator,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<StatusCode, StatusCode> {
    let config = orchestrator.config();

    // Validate signature
    let signature = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if !github_service::validate_signature(&config.github_webhook_secret, &body, signature) {
        tracing::warn!("Webhook signature validation failed");
        return Err(StatusCode::UNAUTHORIZED);
    }

    // Parse event type
    let event_type = headers
        .get("x-github-event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown");

    let payload: Value = serde_json::from_slice(&body).map_err(|_| StatusCode::BAD_REQUEST)?;

    let created = match event_type {
        "push" => match parse_push(config, &payload) {
            Some(request) => Some(orchestrator.submit(&request).await),
            None => None,
        },
        "pull_request" => match parse_pull_request(config, &payload) {
            Some(request) => Some(orchestrator.submit(&request).await),
            None => None,
        },
        "issue_comment" => match parse_issue_comment(config, &payload) {
            Some(request) => orchestrator.retest(request).await.transpose(),
            None => None,
        },
        "ping" => {
            tracing::info!("Received GitHub ping webhook");
            None
        }
        _ => {
            tracing::debug!("Ignoring webhook event: {}", event_type);
            None
        }
    };

    match created {
        None => Ok(StatusCode::OK),
        Some(Ok(build)) => {
            tracing::info!(
                build_id = build.id,
                build_number = build.build_number,
                event = event_type,
                "Build created from webhook"
            );
            Ok(StatusCode::CREATED)
        }
        Some(Err(e)) => {
            tracing::error!(event = event_type, "Failed to start build: {e}");
            Err(status_for(&e))
        }
    }
}

fn status_for(err: &OrchestratorError) -> StatusCode {
    match err {
        OrchestratorError::QueueFull | OrchestratorError::ShuttingDown => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        OrchestratorError::AlreadyRunning(_) => StatusCode::CONFLICT,
        OrchestratorError::InvalidRepository(_) => StatusCode::BAD_REQUEST,
        OrchestratorError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Owner, name and visibility of the `repository` object every event carries.
fn repository(payload: &Value) -> Option<(String, String, bool)> {
    let repo = &payload["repository"];
    let name = repo["name"].as_str()?;
    // Push payloads name the owner, the other events log it in.
    let owner = repo["owner"]["login"]
        .as_str()
        .or_else(|| repo["owner"]["name"].as_str())?;
    let private = repo["private"].as_bool().unwrap_or(false);
    Some((owner.to_string(), name.to_string(), private))
}

/// A push builds only when it lands on the default branch.
pub fn parse_push(config: &CiConfig, payload: &Value) -> Option<BuildRequest> {
    let branch = payload["ref"].as_str()?.strip_prefix("refs/heads/")?;
    let default_branch = payload["repository"]["default_branch"]
        .as_str()
        .unwrap_or(&config.default_branch);
    if branch != default_branch {
        return None;
    }

    let sha = payload["after"].as_str()?;
    // Branch deletions push the all-zero sha.
    if sha.is_empty() || sha.bytes().all(|b| b == b'0') {
        return None;
    }

    let (owner, name, private) = repository(payload)?;
    Some(BuildRequest {
        repo_url: repository_url(&owner, &name),
        repo_owner: owner,
        repo_name: name,
        private,
        pull_request_id: 0,
        branch: branch.to_string(),
        sha: sha.to_string(),
    })
}

pub fn parse_pull_request(config: &CiConfig, payload: &Value) -> Option<BuildRequest> {
    let action = payload["action"].as_str().unwrap_or_default();
    if config.ignored_pr_actions.iter().any(|a| a == action) {
        return None;
    }

    let number = payload["number"].as_i64().and_then(|n| i32::try_from(n).ok())?;
    let head = &payload["pull_request"]["head"];
    let branch = head["ref"].as_str()?;
    let sha = head["sha"].as_str()?;

    let (owner, name, private) = repository(payload)?;
    Some(BuildRequest {
        repo_url: repository_url(&owner, &name),
        repo_owner: owner,
        repo_name: name,
        private,
        pull_request_id: number,
        branch: branch.to_string(),
        sha: sha.to_string(),
    })
}

/// A new comment containing the retest phrase on a pull request.
pub fn parse_issue_comment(config: &CiConfig, payload: &Value) -> Option<RetestRequest> {
    if payload["action"].as_str() != Some("created") {
        return None;
    }
    let body = payload["comment"]["body"].as_str()?;
    if !body.contains(&config.retest_phrase) {
        return None;
    }

    let issue = &payload["issue"];
    // Plain issues carry no `pull_request` object.
    let pull_request_url = issue["pull_request"]["url"].as_str()?;
    let number = issue["number"]
        .as_i64()
        .or_else(|| pull_request_url.rsplit('/').next()?.parse().ok())
        .and_then(|n| i32::try_from(n).ok())?;

    let (owner, name, private) = repository(payload)?;
    Some(RetestRequest {
        repo_url: repository_url(&owner, &name),
        repo_owner: owner,
        repo_name: name,
        private,
        pull_request_id: number,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn push(reference: &str, after: &str) -> Value {
        json!({
            "ref": reference,
            "after": after,
            "repository": {
                "name": "widgets",
                "private": true,
                "default_branch": "master",
                "owner": { "name": "acme" }
            }
        })
    }

    fn pull_request(action: &str) -> Value {
        json!({
            "action": action,
            "number": 7,
            "pull_request": {
                "head": { "ref": "feature/login", "sha": "6ab4d34e2f" }
            },
            "repository": {
                "name": "widgets",
                "private": false,
                "owner": { "login": "acme" }
            }
        })
    }

    fn comment(body: &str, on_pull_request: bool) -> Value {
        let mut issue = json!({ "number": 7 });
        if on_pull_request {
            issue["pull_request"] = json!({
                "url": "https://api.github.com/repos/acme/widgets/pulls/7"
            });
        }
        json!({
            "action": "created",
            "comment": { "body": body },
            "issue": issue,
            "repository": {
                "name": "widgets",
                "owner": { "login": "acme" }
            }
        })
    }

    #[test]
    fn push_to_default_branch_is_a_branch_build() {
        let request = parse_push(&CiConfig::default(), &push("refs/heads/master", "abc123")).unwrap();
        assert_eq!(request.repo_url, "git@github.com:acme/widgets.git");
        assert_eq!(request.repo_owner, "acme");
        assert_eq!(request.pull_request_id, 0);
        assert_eq!(request.branch, "master");
        assert_eq!(request.sha, "abc123");
        assert!(request.private);
    }

    #[test]
    fn push_elsewhere_yields_nothing() {
        let config = CiConfig::default();
        assert!(parse_push(&config, &push("refs/heads/feature", "abc123")).is_none());
        assert!(parse_push(&config, &push("refs/tags/v1.0", "abc123")).is_none());
        assert!(parse_push(&config, &push("refs/heads/master", &"0".repeat(40))).is_none());
    }

    #[test]
    fn pull_request_opened_and_synchronized_build() {
        let config = CiConfig::default();
        for action in ["opened", "synchronize", "reopened"] {
            let request = parse_pull_request(&config, &pull_request(action)).unwrap();
            assert_eq!(request.pull_request_id, 7);
            assert_eq!(request.branch, "feature/login");
            assert_eq!(request.sha, "6ab4d34e2f");
            assert!(!request.private);
        }
    }

    #[test]
    fn ignored_pull_request_actions_yield_nothing() {
        let config = CiConfig::default();
        for action in ["closed", "assigned", "labeled"] {
            assert!(parse_pull_request(&config, &pull_request(action)).is_none(), "{action}");
        }
    }

    #[test]
    fn retest_comment_on_pull_request() {
        let config = CiConfig::default();
        let request =
            parse_issue_comment(&config, &comment("Looks flaky, retest now please", true)).unwrap();
        assert_eq!(request.pull_request_id, 7);
        assert_eq!(request.repo_name, "widgets");
    }

    #[test]
    fn other_comments_yield_nothing() {
        let config = CiConfig::default();
        assert!(parse_issue_comment(&config, &comment("LGTM", true)).is_none());
        assert!(parse_issue_comment(&config, &comment("retest now please", false)).is_none());
    }

    #[test]
    fn queue_pressure_maps_to_service_unavailable() {
        assert_eq!(status_for(&OrchestratorError::QueueFull), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            status_for(&OrchestratorError::InvalidRepository("x".to_string())),
            StatusCode::BAD_REQUEST
        );
    }
}
