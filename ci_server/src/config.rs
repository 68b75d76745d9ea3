//! CI platform configuration: loaded from environment variables.

use std::time::Duration;

#[derive(Clone, Debug)]
pub struct CiConfig {
    /// GitHub webhook secret for HMAC validation.
    pub github_webhook_secret: String,
    /// GitHub personal access token for API calls and private clones.
    pub github_token: String,
    /// GitHub REST API base URL.
    pub github_api_url: String,
    /// Dashboard base URL for build detail links.
    pub dashboard_url: String,
    /// `context` field of every commit status we post.
    pub status_context: String,
    /// Per-repository configuration file, relative to the checkout.
    pub config_file: String,
    /// Comment phrase that triggers a retest of a pull request.
    pub retest_phrase: String,
    /// Default branch assumed when a push payload does not name one.
    pub default_branch: String,
    /// Pull request actions that never produce a build.
    pub ignored_pr_actions: Vec<String>,
    /// Owners whose newly seen projects start out approved.
    pub auto_approve_owners: Vec<String>,
    /// Root of the per-build working directories inside the environment.
    pub workspace_dir: String,
    pub docker: DockerConfig,
    /// Number of pipeline workers.
    pub workers: usize,
    /// Capacity of the pending pipeline queue.
    pub queue_capacity: usize,
    /// Deadline for a single remote command.
    pub command_timeout: Duration,
    /// Deadline for a whole pipeline run.
    pub pipeline_timeout: Duration,
    /// Deadline for one outbound webhook delivery.
    pub webhook_timeout: Duration,
}

/// Container backend settings.
#[derive(Clone, Debug)]
pub struct DockerConfig {
    pub binary: String,
    /// Daemon address passed as `-H`, if any.
    pub host: Option<String>,
    pub image: String,
    /// Directory holding the Dockerfile of `image`. When unset the image must already exist.
    pub dockerfile_dir: Option<String>,
    pub base_ssh_port: u32,
    pub base_http_port: u32,
    pub port_span: u32,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            host: None,
            image: "ci-basic".to_string(),
            dockerfile_dir: None,
            base_ssh_port: 15000,
            base_http_port: 18000,
            port_span: 1000,
        }
    }
}

impl Default for CiConfig {
    fn default() -> Self {
        Self {
            github_webhook_secret: String::new(),
            github_token: String::new(),
            github_api_url: "https://api.github.com".to_string(),
            dashboard_url: "http://localhost:9090".to_string(),
            status_context: "ci/build".to_string(),
            config_file: ".ci.yml".to_string(),
            retest_phrase: "retest now please".to_string(),
            default_branch: "master".to_string(),
            ignored_pr_actions: split_list(DEFAULT_IGNORED_PR_ACTIONS),
            auto_approve_owners: Vec::new(),
            workspace_dir: "/tmp/builds".to_string(),
            docker: DockerConfig::default(),
            workers: 2,
            queue_capacity: 32,
            command_timeout: Duration::from_secs(1800),
            pipeline_timeout: Duration::from_secs(3600),
            webhook_timeout: Duration::from_secs(10),
        }
    }
}

const DEFAULT_IGNORED_PR_ACTIONS: &str = "closed,assigned,unassigned,labeled,unlabeled,\
     review_requested,review_request_removed,edited";

impl CiConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let github_webhook_secret = std::env::var("CI_WEBHOOK_SECRET").unwrap_or_default();
        let github_token = std::env::var("CI_GITHUB_TOKEN").unwrap_or_default();

        if github_webhook_secret.is_empty() {
            tracing::warn!("CI_WEBHOOK_SECRET not set -- webhook signature validation disabled");
        }
        if github_token.is_empty() {
            tracing::warn!("CI_GITHUB_TOKEN not set -- GitHub status updates disabled");
        }

        let docker = DockerConfig {
            binary: std::env::var("CI_DOCKER_BIN").unwrap_or(defaults.docker.binary),
            host: std::env::var("CI_DOCKER_HOST").ok().filter(|h| !h.is_empty()),
            image: std::env::var("CI_BASE_IMAGE").unwrap_or(defaults.docker.image),
            dockerfile_dir: std::env::var("CI_DOCKERFILE_DIR").ok().filter(|d| !d.is_empty()),
            base_ssh_port: env_parse("CI_BASE_SSH_PORT", defaults.docker.base_ssh_port),
            base_http_port: env_parse("CI_BASE_HTTP_PORT", defaults.docker.base_http_port),
            port_span: env_parse("CI_PORT_SPAN", defaults.docker.port_span).max(1),
        };

        Self {
            github_webhook_secret,
            github_token,
            github_api_url: std::env::var("CI_GITHUB_API_URL").unwrap_or(defaults.github_api_url),
            dashboard_url: std::env::var("CI_DASHBOARD_URL")
                .unwrap_or(defaults.dashboard_url)
                .trim_end_matches('/')
                .to_string(),
            status_context: std::env::var("CI_STATUS_CONTEXT").unwrap_or(defaults.status_context),
            config_file: std::env::var("CI_CONFIG_FILE").unwrap_or(defaults.config_file),
            retest_phrase: std::env::var("CI_RETEST_PHRASE").unwrap_or(defaults.retest_phrase),
            default_branch: std::env::var("CI_DEFAULT_BRANCH").unwrap_or(defaults.default_branch),
            ignored_pr_actions: std::env::var("CI_IGNORED_PR_ACTIONS")
                .map(|s| split_list(&s))
                .unwrap_or(defaults.ignored_pr_actions),
            auto_approve_owners: std::env::var("CI_AUTO_APPROVE_OWNERS")
                .map(|s| split_list(&s))
                .unwrap_or_default(),
            workspace_dir: std::env::var("CI_WORKSPACE_DIR").unwrap_or(defaults.workspace_dir),
            docker,
            workers: env_parse("CI_WORKERS", defaults.workers).max(1),
            queue_capacity: env_parse("CI_QUEUE_CAPACITY", defaults.queue_capacity).max(1),
            command_timeout: Duration::from_secs(env_parse("CI_COMMAND_TIMEOUT", 1800)),
            pipeline_timeout: Duration::from_secs(env_parse("CI_PIPELINE_TIMEOUT", 3600)),
            webhook_timeout: Duration::from_secs(env_parse("CI_WEBHOOK_TIMEOUT", 10)),
        }
    }

    /// Detail page of a build, used as commit-status target and in comments.
    pub fn build_url(&self, owner: &str, name: &str, build_number: i32) -> String {
        format!("{}/builds/{owner}/{name}/{build_number}", self.dashboard_url)
    }

    pub fn is_auto_approved(&self, owner: &str) -> bool {
        self.auto_approve_owners.iter().any(|o| o == owner)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_url_is_derived_from_owner_name_and_number() {
        let config = CiConfig {
            dashboard_url: "https://ci.example.com".to_string(),
            ..CiConfig::default()
        };
        assert_eq!(
            config.build_url("acme", "widgets", 7),
            "https://ci.example.com/builds/acme/widgets/7"
        );
    }

    #[test]
    fn default_ignored_actions_include_closed() {
        let config = CiConfig::default();
        assert!(config.ignored_pr_actions.iter().any(|a| a == "closed"));
        assert!(!config.ignored_pr_actions.iter().any(|a| a == "opened"));
        assert!(!config.ignored_pr_actions.iter().any(|a| a == "synchronize"));
    }

    #[test]
    fn split_list_trims_and_skips_empty_entries() {
        assert_eq!(split_list(" a, b ,,c "), vec!["a", "b", "c"]);
        assert!(split_list("").is_empty());
    }
}
