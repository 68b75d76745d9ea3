//! GitHub integration: webhook validation, commit statuses, commit comments.

use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Validate a GitHub webhook signature (X-Hub-Signature-256).
pub fn validate_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    if secret.is_empty() {
        tracing::warn!("Webhook secret not configured, skipping validation");
        return true;
    }

    let sig = signature.strip_prefix("sha256=").unwrap_or(signature);
    let Ok(sig_bytes) = hex::decode(sig) else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload);

    mac.verify_slice(&sig_bytes).is_ok()
}

/// Body of `POST /repos/{owner}/{repo}/statuses/{sha}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusPayload {
    pub state: String,
    pub target_url: String,
    pub description: String,
    pub context: String,
}

/// Body of `POST /repos/{owner}/{repo}/commits/{sha}/comments`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommentPayload {
    pub body: String,
    pub sha: String,
}

/// Thin REST client for the two calls the pipeline makes.
#[derive(Clone)]
pub struct GitHubClient {
    http: reqwest::Client,
    api_url: String,
    token: String,
}

impl GitHubClient {
    pub fn new(api_url: &str, token: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_url: api_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.token.is_empty()
    }

    /// `repo` is `owner/name`.
    pub async fn post_status(
        &self,
        repo: &str,
        sha: &str,
        status: &StatusPayload,
    ) -> anyhow::Result<()> {
        let url = format!("{}/repos/{repo}/statuses/{sha}", self.api_url);
        self.post(&url, status).await
    }

    pub async fn post_commit_comment(&self, repo: &str, sha: &str, body: &str) -> anyhow::Result<()> {
        let url = format!("{}/repos/{repo}/commits/{sha}/comments", self.api_url);
        let payload = CommentPayload {
            body: body.to_string(),
            sha: sha.to_string(),
        };
        self.post(&url, &payload).await
    }

    async fn post<T: Serialize + ?Sized>(&self, url: &str, body: &T) -> anyhow::Result<()> {
        if !self.is_enabled() {
            tracing::debug!(url, "GitHub token not set, skipping call");
            return Ok(());
        }

        let resp = self
            .http
            .post(url)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "ci-server")
            .json(body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("GitHub call to {url} failed: {status} {text}");
        }

        Ok(())
    }
}
