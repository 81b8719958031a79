//! CLI arguments and their validation into a [`ServiceConfig`].

use ci_scaler_core::{AsgSpec, SpecError};
use clap::Parser;
use std::time::Duration;

/// Adds runner instances to auto-scaling groups upon receiving workflow
/// webhook events, removes instances that idle for too long, de-registers
/// offline runners, and publishes CloudWatch metrics about the fleet.
///
/// Each --asgs spec "{owner}/{repo}:{label}:{asg_name}" means: "when a
/// workflow in {owner}/{repo} asks for runners labelled {label}, grow the
/// auto-scaling group {asg_name}". The specs also define which repositories
/// are subject to reconciliation.
#[derive(Parser, Debug)]
#[command(name = "ci-scaler", version)]
pub struct CliArgs {
    /// Port to listen on for webhook events
    #[arg(long, default_value_t = 8088)]
    pub port: u16,

    /// Domain of the HTTPS gateway that forwards webhook deliveries to this
    /// process (scheme and path are stripped)
    #[arg(long)]
    pub domain: String,

    /// Space-delimited auto-scaling specs, each formatted
    /// {owner}/{repo}:{label}:{asg_name}; repeatable
    #[arg(long = "asgs", required = true)]
    pub asgs: Vec<String>,

    /// Poll the platform for the list of runners this often; also the
    /// metrics publication interval
    #[arg(long, default_value_t = 120)]
    pub poll_interval_sec: u64,

    /// Idle runner instances are removed from their group after this time
    /// if they are not needed for elasticity
    #[arg(long, default_value_t = 300)]
    pub max_idle_age_sec: i64,

    /// Offline runners are de-registered after this time
    #[arg(long, default_value_t = 120)]
    pub max_offline_age_sec: i64,
}

/// Validated service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub port: u16,
    pub domain: String,
    pub asg_specs: Vec<AsgSpec>,
    pub poll_interval: Duration,
    pub max_idle_age_sec: i64,
    pub max_offline_age_sec: i64,
}

/// Errors that abort startup before anything is served.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Spec(#[from] SpecError),

    #[error("--domain must not be empty")]
    EmptyDomain,

    #[error("at least one --asgs spec is required")]
    NoAsgSpecs,
}

impl ServiceConfig {
    pub fn from_args(args: &CliArgs) -> Result<Self, ConfigError> {
        let domain = strip_domain(&args.domain);
        if domain.is_empty() {
            return Err(ConfigError::EmptyDomain);
        }
        let asg_specs = args
            .asgs
            .join(" ")
            .split_whitespace()
            .map(str::parse)
            .collect::<Result<Vec<AsgSpec>, SpecError>>()?;
        if asg_specs.is_empty() {
            return Err(ConfigError::NoAsgSpecs);
        }
        Ok(Self {
            port: args.port,
            domain,
            asg_specs,
            poll_interval: Duration::from_secs(args.poll_interval_sec),
            max_idle_age_sec: args.max_idle_age_sec,
            max_offline_age_sec: args.max_offline_age_sec,
        })
    }
}

/// Reduce a domain argument to its bare host: drop a `scheme://` prefix and
/// anything from the first `/` on.
fn strip_domain(raw: &str) -> String {
    let rest = match raw.find("//") {
        Some(at) if !raw[..at].contains('/') => &raw[at + 2..],
        _ => raw,
    };
    rest.split('/').next().unwrap_or("").to_string()
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
