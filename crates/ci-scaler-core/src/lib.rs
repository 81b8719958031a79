//! # ci-scaler Core
//!
//! Domain logic for the ci-scaler runner-fleet autoscaler.
//!
//! ci-scaler watches workflow webhook events from the CI platform, predicts
//! how many runners an incoming workflow will consume, and grows the matching
//! auto-scaling groups. A reconciliation loop polls the platform for the
//! registered runners and shrinks the fleet again: long-idle instances are
//! terminated, long-offline runner registrations are removed, and fleet
//! metrics are published to the cloud metrics service.
//!
//! ## Architecture
//!
//! The core depends only on trait abstractions for its external
//! collaborators:
//! - [`CloudAutoscaler`] for the auto-scaling and metrics APIs
//! - [`CiPlatform`] for the CI platform's REST API
//! - [`ImageRegistry`] for the container registry's rate-limit probe
//!
//! Concrete implementations live in the service crate and are injected at
//! runtime.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Seconds since the unix epoch, as reported by the wall clock.
pub type UnixSeconds = i64;

// ============================================================================
// Auto-scaling specs
// ============================================================================

/// One `{owner}/{repo}:{label}:{asg_name}` autoscaling spec.
///
/// A spec binds a runner label in one repository to the auto-scaling group
/// that backs it. The list of specs also defines which repositories are
/// subject to reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AsgSpec {
    pub repository: String,
    pub label: String,
    pub asg_name: String,
}

impl FromStr for AsgSpec {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        match parts.as_slice() {
            [repository, label, asg_name]
                if !repository.is_empty() && !label.is_empty() && !asg_name.is_empty() =>
            {
                Ok(Self {
                    repository: repository.to_string(),
                    label: label.to_string(),
                    asg_name: asg_name.to_string(),
                })
            }
            _ => Err(SpecError::InvalidAsgSpec {
                spec: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for AsgSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.label)
    }
}

// ============================================================================
// Runners
// ============================================================================

/// Connectivity status the platform reports for a registered runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerStatus {
    Online,
    #[serde(other)]
    Offline,
}

/// One runner registration as observed via the platform API.
///
/// `loaded_at` is the first time this process saw the runner; the registries
/// preserve it across polls so it anchors "how long has this runner been
/// idle/offline from our viewpoint".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Runner {
    pub id: String,
    pub name: String,
    pub status: RunnerStatus,
    pub busy: bool,
    pub labels: Vec<String>,
    pub loaded_at: UnixSeconds,
}

impl Runner {
    /// An online runner that is not executing a job.
    pub fn is_idle(&self) -> bool {
        self.status == RunnerStatus::Online && !self.busy
    }

    /// Derive the backing cloud instance id from the runner name.
    ///
    /// Runner names follow the shape `ci-storage-<suffix>...` where the
    /// suffix is the instance id without its `i-` prefix.
    pub fn instance_id(&self) -> Result<String, SpecError> {
        let suffix: String = self
            .name
            .strip_prefix("ci-storage-")
            .unwrap_or("")
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
            .collect();
        if suffix.is_empty() {
            return Err(SpecError::BadRunnerName {
                name: self.name.clone(),
            });
        }
        Ok(format!("i-{suffix}"))
    }
}

// ============================================================================
// External-service views
// ============================================================================

/// The subset of auto-scaling group attributes the core consults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AsgDescription {
    pub desired_capacity: i64,
    pub min_size: i64,
    pub max_size: i64,
}

/// One rate-limit bucket of an external API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RateLimits {
    pub limit: i64,
    pub remaining: i64,
}

// ============================================================================
// Error Types
// ============================================================================

/// Errors in statically-configured inputs and name derivations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpecError {
    #[error("invalid ASG spec '{spec}': expected {{owner}}/{{repo}}:{{label}}:{{asg_name}}")]
    InvalidAsgSpec { spec: String },

    #[error("cannot derive an instance id from runner name '{name}'")]
    BadRunnerName { name: String },
}

// ============================================================================
// Module declarations
// ============================================================================

/// Adapter traits for the cloud, the CI platform, and the image registry.
pub mod adapters;

/// TTL-keyed map with lazy expiry.
pub mod expiring;

/// Webhook ingress pipeline and webhook registration lifecycle.
pub mod ingress;

/// Typed extraction of webhook payloads.
pub mod payload;

/// The reconciliation loop and its per-ASG handlers.
pub mod reconcile;

/// Id-keyed runner set with differential assignment.
pub mod registry;

/// Scoped action logging with optional error swallowing.
pub mod scope;

/// Per-job timing metrics.
pub mod timing;

/// Workflow file parsing and runner-demand prediction.
pub mod workflow;

// Re-export key types for convenience
pub use adapters::{
    CiPlatform, CloudAutoscaler, CloudError, ImageRegistry, PlatformError, RegistryError,
    DRY_RUN_ANNOTATION,
};
pub use expiring::ExpiringMap;
pub use ingress::{IngressRequest, IngressResponse, WebhookService};
pub use payload::{WebhookPayload, WorkflowJobPayload, WorkflowRunPayload};
pub use reconcile::{AsgHandler, ReconcileError, Reconciler, ReconcilerConfig};
pub use registry::RunnersRegistry;
pub use scope::ActionScope;
pub use timing::{normalize_job_name, JobPhase, JobTimings};
pub use workflow::{Workflow, WorkflowError};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
