//! GitHub implementation of the [`CiPlatform`] trait.
//!
//! A thin reqwest client over the REST API: paginated runner listing,
//! webhook management, workflow file download and rate-limit probing. The
//! webhook secret is derived deterministically from the API token
//! (hex SHA-256), so it survives process restarts without any persistence;
//! any holder of the token can reproduce it, which is acceptable because the
//! token is strictly more powerful than the secret.

use async_trait::async_trait;
use base64::prelude::*;
use chrono::Utc;
use ci_scaler_core::{CiPlatform, PlatformError, RateLimits, Runner, RunnerStatus, Workflow};
use reqwest::header::{HeaderMap, ACCEPT, LINK, USER_AGENT};
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::time::Duration;

pub const GITHUB_API_URL: &str = "https://api.github.com";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const PAGE_SIZE: u32 = 100;

/// The GitHub REST API client.
pub struct GitHubClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl GitHubClient {
    /// Build a client against api.github.com with the token from `GH_TOKEN`
    /// or `GITHUB_TOKEN`.
    pub fn from_env() -> Result<Self, PlatformError> {
        let token = std::env::var("GH_TOKEN")
            .ok()
            .filter(|token| !token.is_empty())
            .or_else(|| std::env::var("GITHUB_TOKEN").ok())
            .filter(|token| !token.is_empty());
        Self::new(GITHUB_API_URL, token)
    }

    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self, PlatformError> {
        let base_url: String = base_url.into();
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| PlatformError::Network {
                message: e.to_string(),
            })?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn request(&self, method: Method, url: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .http
            .request(method, url)
            .header(ACCEPT, "application/vnd.github.v3+json")
            .header(USER_AGENT, "ci-scaler");
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    async fn send(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, PlatformError> {
        let response = builder.send().await.map_err(|e| PlatformError::Network {
            message: e.to_string(),
        })?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(PlatformError::Http {
            status: status.as_u16(),
            message,
        })
    }

    /// All webhooks of a repository, following pagination.
    async fn list_hooks(&self, repository: &str) -> Result<Vec<HookItem>, PlatformError> {
        let mut hooks = Vec::new();
        let mut url = self.url(&format!("/repos/{repository}/hooks?per_page={PAGE_SIZE}"));
        loop {
            let response = self.send(self.request(Method::GET, &url)).await?;
            let next = next_link(response.headers());
            let page: Vec<HookItem> =
                response.json().await.map_err(|e| PlatformError::MalformedResponse {
                    message: e.to_string(),
                })?;
            hooks.extend(page);
            match next {
                Some(next) => url = next,
                None => break,
            }
        }
        Ok(hooks)
    }

    /// Hook ids whose configured URL matches.
    async fn hook_ids_by_url(
        &self,
        repository: &str,
        url: &str,
    ) -> Result<Vec<u64>, PlatformError> {
        Ok(self
            .list_hooks(repository)
            .await?
            .into_iter()
            .filter(|hook| hook.config.url.as_deref() == Some(url))
            .map(|hook| hook.id)
            .collect())
    }
}

#[async_trait]
impl CiPlatform for GitHubClient {
    async fn fetch_runners(&self, repository: &str) -> Result<Vec<Runner>, PlatformError> {
        let loaded_at = Utc::now().timestamp();
        let mut runners = Vec::new();
        let mut url = self.url(&format!(
            "/repos/{repository}/actions/runners?per_page={PAGE_SIZE}"
        ));
        loop {
            let response = self.send(self.request(Method::GET, &url)).await?;
            let next = next_link(response.headers());
            let page: RunnersPage =
                response.json().await.map_err(|e| PlatformError::MalformedResponse {
                    message: e.to_string(),
                })?;
            runners.extend(page.runners.into_iter().map(|item| item.into_runner(loaded_at)));
            match next {
                Some(next) => url = next,
                None => break,
            }
        }
        Ok(runners)
    }

    async fn runner_ensure_absent(
        &self,
        repository: &str,
        runner_id: &str,
    ) -> Result<(), PlatformError> {
        let url = self.url(&format!("/repos/{repository}/actions/runners/{runner_id}"));
        match self.send(self.request(Method::DELETE, &url)).await {
            Ok(_) => Ok(()),
            Err(PlatformError::Http { status: 404, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn webhook_ensure_exists(
        &self,
        repository: &str,
        url: &str,
        secret: &str,
        events: &[&str],
    ) -> Result<(), PlatformError> {
        // Re-registering refreshes the secret, so drop any stale hook first.
        self.webhook_ensure_absent(repository, url).await?;
        let body = json!({
            "config": {
                "url": url,
                "content_type": "json",
                "secret": secret,
            },
            "events": events,
            "active": true,
        });
        let endpoint = self.url(&format!("/repos/{repository}/hooks"));
        match self
            .send(self.request(Method::POST, &endpoint).json(&body))
            .await
        {
            Ok(_) => Ok(()),
            Err(PlatformError::Http { message, .. }) if message.contains("Hook already exists") => {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn webhook_ensure_absent(
        &self,
        repository: &str,
        url: &str,
    ) -> Result<(), PlatformError> {
        for id in self.hook_ids_by_url(repository, url).await? {
            let endpoint = self.url(&format!("/repos/{repository}/hooks/{id}"));
            match self.send(self.request(Method::DELETE, &endpoint)).await {
                Ok(_) => {}
                Err(PlatformError::Http { status: 404, .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn webhook_ping(&self, repository: &str, url: &str) -> Result<(), PlatformError> {
        for id in self.hook_ids_by_url(repository, url).await? {
            let endpoint = self.url(&format!("/repos/{repository}/hooks/{id}/pings"));
            self.send(self.request(Method::POST, &endpoint)).await?;
        }
        Ok(())
    }

    async fn fetch_workflow(
        &self,
        repository: &str,
        sha: &str,
        path: &str,
    ) -> Result<Workflow, PlatformError> {
        let url = self.url(&format!("/repos/{repository}/contents/{path}?ref={sha}"));
        let response = self.send(self.request(Method::GET, &url)).await?;
        let file: ContentsFile =
            response.json().await.map_err(|e| PlatformError::MalformedResponse {
                message: e.to_string(),
            })?;
        if file.encoding != "base64" {
            return Err(PlatformError::MalformedResponse {
                message: format!("unexpected contents encoding: {}", file.encoding),
            });
        }
        let packed: String = file.content.chars().filter(|c| !c.is_whitespace()).collect();
        let bytes = BASE64_STANDARD
            .decode(packed)
            .map_err(|e| PlatformError::MalformedResponse {
                message: format!("contents are not valid base64: {e}"),
            })?;
        let text = String::from_utf8(bytes).map_err(|e| PlatformError::MalformedResponse {
            message: format!("workflow file is not UTF-8: {e}"),
        })?;
        Ok(Workflow::parse(&text)?)
    }

    async fn fetch_rate_limits(&self) -> Result<RateLimits, PlatformError> {
        let url = self.url("/rate_limit");
        let response = self.send(self.request(Method::GET, &url)).await?;
        Ok(RateLimits {
            limit: header_i64(response.headers(), "x-ratelimit-limit"),
            remaining: header_i64(response.headers(), "x-ratelimit-remaining"),
        })
    }

    fn webhook_secret(&self) -> Option<String> {
        self.token
            .as_ref()
            .map(|token| hex::encode(Sha256::digest(token.as_bytes())))
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct RunnersPage {
    runners: Vec<RunnerItem>,
}

#[derive(Debug, Deserialize)]
struct RunnerItem {
    id: u64,
    name: String,
    status: RunnerStatus,
    busy: bool,
    #[serde(default)]
    labels: Vec<RunnerLabel>,
}

#[derive(Debug, Deserialize)]
struct RunnerLabel {
    name: String,
    #[serde(rename = "type", default)]
    kind: String,
}

impl RunnerItem {
    /// Platform-owned labels (`self-hosted`, os/arch) are discarded; only
    /// custom labels take part in spec matching.
    fn into_runner(self, loaded_at: i64) -> Runner {
        Runner {
            id: self.id.to_string(),
            name: self.name,
            status: self.status,
            busy: self.busy,
            labels: self
                .labels
                .into_iter()
                .filter(|label| label.kind == "custom")
                .map(|label| label.name)
                .collect(),
            loaded_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct HookItem {
    id: u64,
    #[serde(default)]
    config: HookConfig,
}

#[derive(Debug, Default, Deserialize)]
struct HookConfig {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContentsFile {
    content: String,
    encoding: String,
}

// ============================================================================
// Helpers
// ============================================================================

/// The `rel="next"` target of a Link header, if any.
fn next_link(headers: &HeaderMap) -> Option<String> {
    let link = headers.get(LINK)?.to_str().ok()?;
    for part in link.split(',') {
        let mut sections = part.split(';');
        let url = sections
            .next()?
            .trim()
            .trim_start_matches('<')
            .trim_end_matches('>');
        if sections.any(|param| param.trim() == "rel=\"next\"") {
            return Some(url.to_string());
        }
    }
    None
}

fn header_i64(headers: &HeaderMap, name: &str) -> i64 {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
#[path = "github_tests.rs"]
mod tests;
