//! Binary entry point for ci-scaler.
//!
//! Parses the CLI, initialises tracing, builds the AWS / GitHub / Docker Hub
//! adapters, and runs the service. Exit codes: 1 after an interrupting
//! signal, 2 on configuration errors or malformed external responses, 3 on
//! adapter or server failures.

use ci_scaler_core::{CiPlatform, CloudAutoscaler, ImageRegistry, PlatformError, DRY_RUN_ANNOTATION};
use ci_scaler_service::adapters::{AwsCloud, DockerHubRegistry, GitHubClient};
use ci_scaler_service::{run, CliArgs, RunExit, ServiceConfig, ServiceError};
use clap::Parser;
use std::sync::Arc;
use tracing::{error, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ci_scaler_service=info,ci_scaler_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = CliArgs::parse();
    let config = match ServiceConfig::from_args(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("invalid configuration: {e}");
            std::process::exit(2);
        }
    };

    let platform: Arc<dyn CiPlatform> = match GitHubClient::from_env() {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!("building the GitHub client failed: {e}");
            std::process::exit(3);
        }
    };
    let registry: Arc<dyn ImageRegistry> = match DockerHubRegistry::new() {
        Ok(registry) => Arc::new(registry),
        Err(e) => {
            error!("building the Docker Hub client failed: {e}");
            std::process::exit(3);
        }
    };
    let cloud = AwsCloud::connect().await;
    if cloud.region().is_none() {
        warn!("no AWS region discoverable, continuing {DRY_RUN_ANNOTATION}");
    }
    let cloud: Arc<dyn CloudAutoscaler> = Arc::new(cloud);

    match run(config, cloud, platform, registry).await {
        Ok(RunExit::Interrupted) => std::process::exit(1),
        Err(e) => {
            error!("service failed: {e}");
            let exit_code = match &e {
                ServiceError::Platform(PlatformError::MalformedResponse { .. }) => 2,
                _ => 3,
            };
            std::process::exit(exit_code);
        }
    }
}
