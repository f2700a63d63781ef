use serde::Deserialize;
use serde_json::json;

use crate::error::{Error, Result};

const API_BASE: &str = "https://api.github.com";
const USER_AGENT: &str = "counterspell";

/// Minimal GitHub REST client: PR creation and user lookup.
pub struct GitHubClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
pub struct GitHubUser {
    pub login: String,
}

#[derive(Debug, Deserialize)]
struct PullResponse {
    html_url: String,
}

impl GitHubClient {
    pub fn new() -> Self {
        Self::with_base_url(API_BASE)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    /// Open a PR of `head` against `base`; returns the PR's html URL.
    pub async fn create_pull_request(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<String> {
        let url = format!("{}/repos/{owner}/{repo}/pulls", self.base_url);
        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("token {token}"))
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", USER_AGENT)
            .json(&json!({
                "title": title,
                "body": body,
                "head": head,
                "base": base,
            }))
            .send()
            .await
            .map_err(|e| Error::Transient(format!("github pr create: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            if status.as_u16() == 422 {
                return Err(Error::Conflict(format!("github rejected PR: {detail}")));
            }
            return Err(Error::Transient(format!(
                "github pr create returned {status}: {detail}"
            )));
        }

        let pull: PullResponse = response
            .json()
            .await
            .map_err(|e| Error::Internal(format!("github pr response: {e}")))?;
        Ok(pull.html_url)
    }

    pub async fn get_user(&self, token: &str) -> Result<GitHubUser> {
        let url = format!("{}/user", self.base_url);
        let response = self
            .http
            .get(&url)
            .header("Authorization", format!("token {token}"))
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", USER_AGENT)
            .send()
            .await
            .map_err(|e| Error::Transient(format!("github user: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::InvalidInput("github token rejected".into()));
        }
        response
            .json()
            .await
            .map_err(|e| Error::Internal(format!("github user response: {e}")))
    }
}

impl Default for GitHubClient {
    fn default() -> Self {
        Self::new()
    }
}
