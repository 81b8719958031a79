//! Tests for the Docker Hub rate-limit probe against a wiremock server.

use super::*;
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// The probe exchanges the anonymous token and reads the windowed headers.
#[tokio::test]
async fn test_reads_windowed_rate_limit_headers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "tok-123"})))
        .mount(&server)
        .await;
    Mock::given(method("HEAD"))
        .and(path("/v2/ratelimitpreview/test/manifests/latest"))
        .and(header("authorization", "Bearer tok-123"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("ratelimit-limit", "100;w=21600")
                .insert_header("ratelimit-remaining", "93;w=21600"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let registry = DockerHubRegistry::with_urls(
        format!("{}/token", server.uri()),
        format!("{}/v2/ratelimitpreview/test/manifests/latest", server.uri()),
    )
    .unwrap();

    let limits = registry.fetch_rate_limits().await.unwrap();
    assert_eq!(
        limits,
        RateLimits {
            limit: 100,
            remaining: 93,
        }
    );
}

/// Missing headers degrade to zero rather than failing the handler.
#[tokio::test]
async fn test_missing_headers_read_as_zero() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;
    Mock::given(method("HEAD"))
        .and(path("/v2/ratelimitpreview/test/manifests/latest"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let registry = DockerHubRegistry::with_urls(
        format!("{}/token", server.uri()),
        format!("{}/v2/ratelimitpreview/test/manifests/latest", server.uri()),
    )
    .unwrap();

    assert_eq!(registry.fetch_rate_limits().await.unwrap(), RateLimits::default());
}
