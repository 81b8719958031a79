//! Concrete adapter implementations injected into the core at runtime.

/// AWS auto-scaling and CloudWatch metrics.
pub mod aws;

/// Docker Hub rate-limit probe.
pub mod docker_hub;

/// GitHub REST API client.
pub mod github;

pub use aws::AwsCloud;
pub use docker_hub::DockerHubRegistry;
pub use github::GitHubClient;
