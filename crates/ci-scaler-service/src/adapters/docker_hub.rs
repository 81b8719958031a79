//! Docker Hub implementation of the [`ImageRegistry`] trait.
//!
//! Probes the anonymous pull rate limit the way the registry documents it:
//! fetch a token for the well-known `ratelimitpreview/test` repository, then
//! HEAD its manifest and read the `ratelimit-*` headers. The HEAD request
//! does not consume any of the budget it measures.

use async_trait::async_trait;
use ci_scaler_core::{ImageRegistry, RateLimits, RegistryError};
use reqwest::header::HeaderMap;
use serde::Deserialize;
use std::time::Duration;

const DEFAULT_TOKEN_URL: &str =
    "https://auth.docker.io/token?service=registry.docker.io&scope=repository:ratelimitpreview/test:pull";
const DEFAULT_MANIFEST_URL: &str =
    "https://registry-1.docker.io/v2/ratelimitpreview/test/manifests/latest";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// The Docker Hub rate-limit probe.
pub struct DockerHubRegistry {
    http: reqwest::Client,
    token_url: String,
    manifest_url: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: String,
}

impl DockerHubRegistry {
    pub fn new() -> Result<Self, RegistryError> {
        Self::with_urls(DEFAULT_TOKEN_URL, DEFAULT_MANIFEST_URL)
    }

    pub fn with_urls(
        token_url: impl Into<String>,
        manifest_url: impl Into<String>,
    ) -> Result<Self, RegistryError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| RegistryError::Network {
                message: e.to_string(),
            })?;
        Ok(Self {
            http,
            token_url: token_url.into(),
            manifest_url: manifest_url.into(),
        })
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response, RegistryError> {
        let response = builder.send().await.map_err(|e| RegistryError::Network {
            message: e.to_string(),
        })?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(RegistryError::Http {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl ImageRegistry for DockerHubRegistry {
    async fn fetch_rate_limits(&self) -> Result<RateLimits, RegistryError> {
        let response = self.send(self.http.get(&self.token_url)).await?;
        let token: TokenResponse =
            response.json().await.map_err(|e| RegistryError::MalformedResponse {
                message: e.to_string(),
            })?;

        let response = self
            .send(self.http.head(&self.manifest_url).bearer_auth(&token.token))
            .await?;
        Ok(RateLimits {
            limit: limit_header(response.headers(), "ratelimit-limit"),
            remaining: limit_header(response.headers(), "ratelimit-remaining"),
        })
    }
}

/// Parse headers shaped like `100;w=21600`: the budget, then the window.
fn limit_header(headers: &HeaderMap, name: &str) -> i64 {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
#[path = "docker_hub_tests.rs"]
mod tests;
