//! Adapter traits for the cloud, the CI platform, and the image registry.
//!
//! The core depends only on these traits; the service crate injects the real
//! AWS / GitHub / Docker Hub implementations at runtime, and tests inject
//! recording mocks.

use crate::workflow::Workflow;
use crate::{AsgDescription, RateLimits, Runner};
use async_trait::async_trait;

/// Appended to log lines and response messages whenever a cloud operation
/// was skipped because no region is discoverable.
pub const DRY_RUN_ANNOTATION: &str = "(DRY-RUN: no AWS metadata service)";

/// Errors from the cloud provider's APIs.
#[derive(Debug, thiserror::Error)]
pub enum CloudError {
    #[error("auto-scaling group {name} not found")]
    AsgNotFound { name: String },

    #[error("cloud API call failed: {message}")]
    Api { message: String },
}

/// Errors from the CI platform's REST API.
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("platform API responded with HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("platform returned a malformed response: {message}")]
    MalformedResponse { message: String },

    #[error("network error talking to the platform: {message}")]
    Network { message: String },

    #[error(transparent)]
    Workflow(#[from] crate::workflow::WorkflowError),
}

/// Errors from the image registry's rate-limit probe.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("registry responded with HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("registry returned a malformed response: {message}")]
    MalformedResponse { message: String },

    #[error("network error talking to the registry: {message}")]
    Network { message: String },
}

/// The auto-scaling and metrics surface of the cloud provider.
///
/// Every operation returns `Ok(None)` in dry-run mode (no region could be
/// discovered): callers annotate their logs with [`DRY_RUN_ANNOTATION`] and
/// continue. The corrective retries (clamp-then-retry-at-max on capacity
/// increments, retry-without-decrement on terminations, not-found treated as
/// success) are obligations of the implementation, so callers stay oblivious
/// to the cloud's conflict semantics.
#[async_trait]
pub trait CloudAutoscaler: Send + Sync {
    /// The resolved region, or `None` in dry-run mode.
    fn region(&self) -> Option<&str>;

    async fn describe_asg(&self, name: &str) -> Result<Option<AsgDescription>, CloudError>;

    /// Raise the group's desired capacity by `inc`, clamped to
    /// `[min_size, max_size]`.
    async fn increment_desired_capacity(
        &self,
        name: &str,
        inc: i64,
    ) -> Result<Option<()>, CloudError>;

    /// Terminate an instance, preferring to shrink desired capacity with it.
    async fn terminate_instance(&self, instance_id: &str) -> Result<Option<()>, CloudError>;

    /// Publish one batch of integer gauges under the fixed metric namespace.
    async fn put_metric_data(
        &self,
        metrics: &[(String, i64)],
        dimensions: &[(String, String)],
    ) -> Result<Option<()>, CloudError>;
}

/// The slice of the CI platform's REST API the core consumes.
#[async_trait]
pub trait CiPlatform: Send + Sync {
    /// All runners registered in a repository. Platform-owned labels are
    /// discarded; `loaded_at` is the fetch time.
    async fn fetch_runners(&self, repository: &str) -> Result<Vec<Runner>, PlatformError>;

    /// Remove a runner registration; deleting an unknown id succeeds.
    async fn runner_ensure_absent(
        &self,
        repository: &str,
        runner_id: &str,
    ) -> Result<(), PlatformError>;

    /// Create the webhook if it is not registered yet.
    async fn webhook_ensure_exists(
        &self,
        repository: &str,
        url: &str,
        secret: &str,
        events: &[&str],
    ) -> Result<(), PlatformError>;

    /// Delete every webhook whose configured URL matches.
    async fn webhook_ensure_absent(&self, repository: &str, url: &str)
        -> Result<(), PlatformError>;

    /// Trigger the platform's test delivery for the webhook.
    async fn webhook_ping(&self, repository: &str, url: &str) -> Result<(), PlatformError>;

    /// Download and parse a workflow file at a specific commit.
    async fn fetch_workflow(
        &self,
        repository: &str,
        sha: &str,
        path: &str,
    ) -> Result<Workflow, PlatformError>;

    async fn fetch_rate_limits(&self) -> Result<RateLimits, PlatformError>;

    /// The webhook secret derived from the API token, or `None` when no
    /// token is available (webhook registration is skipped then).
    fn webhook_secret(&self) -> Option<String>;
}

/// The image registry's rate-limit probe.
#[async_trait]
pub trait ImageRegistry: Send + Sync {
    async fn fetch_rate_limits(&self) -> Result<RateLimits, RegistryError>;
}
