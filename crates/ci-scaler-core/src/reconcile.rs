//! The reconciliation loop and its per-ASG handlers.
//!
//! Every tick the loop fetches the registered runners once per repository,
//! fans the label-filtered list out to each ASG spec's handlers, and finally
//! publishes API rate-limit metrics. Every handler call is wrapped in an
//! error-swallowing scope, so one failing handler stops neither the
//! iteration nor the next tick.

use crate::adapters::{
    CiPlatform, CloudAutoscaler, CloudError, ImageRegistry, PlatformError, RegistryError,
    DRY_RUN_ANNOTATION,
};
use crate::expiring::ExpiringMap;
use crate::registry::RunnersRegistry;
use crate::scope::ActionScope;
use crate::{AsgSpec, Runner, RunnerStatus, SpecError};
use async_trait::async_trait;
use chrono::Utc;
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

/// A terminated instance is remembered this long, because the platform keeps
/// reporting the runner for a while after the instance is gone.
const REVISIT_TERMINATED_INSTANCE_TTL: Duration = Duration::from_secs(600);

/// Errors a reconciliation handler can surface; all of them are swallowed
/// and retried on the next tick.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Spec(#[from] SpecError),
}

/// Reacts to the freshly-fetched list of runners belonging to one ASG spec
/// (the runners in the spec's repository carrying the spec's label).
#[async_trait]
pub trait AsgHandler: Send + Sync {
    fn name(&self) -> String;

    async fn handle(&self, runners: &[Runner]) -> Result<(), ReconcileError>;
}

/// Knobs for building the standard handler set.
#[derive(Debug, Clone, Copy)]
pub struct ReconcilerConfig {
    pub poll_interval: Duration,
    pub max_idle_age_sec: i64,
    pub max_offline_age_sec: i64,
}

// ============================================================================
// Runner metrics handler
// ============================================================================

/// Publishes the runner population and the ASG's size settings.
pub struct RunnerMetricsHandler {
    asg_spec: AsgSpec,
    cloud: Arc<dyn CloudAutoscaler>,
}

impl RunnerMetricsHandler {
    pub fn new(asg_spec: AsgSpec, cloud: Arc<dyn CloudAutoscaler>) -> Self {
        Self { asg_spec, cloud }
    }
}

#[async_trait]
impl AsgHandler for RunnerMetricsHandler {
    fn name(&self) -> String {
        format!("RunnerMetricsHandler({})", self.asg_spec)
    }

    async fn handle(&self, runners: &[Runner]) -> Result<(), ReconcileError> {
        let online = runners
            .iter()
            .filter(|r| r.status == RunnerStatus::Online)
            .count() as i64;
        let active = runners
            .iter()
            .filter(|r| r.status == RunnerStatus::Online && r.busy)
            .count() as i64;
        let idle = online - active;
        let offline = runners.len() as i64 - online;
        let active_percent = if online == 0 {
            0
        } else {
            ((active as f64 / online as f64) * 100.0).round() as i64
        };

        let mut metrics: Vec<(String, i64)> = vec![
            ("IdleRunnersCount".to_string(), idle),
            ("ActiveRunnersCount".to_string(), active),
            ("OfflineRunnersCount".to_string(), offline),
            ("OnlineRunnersCount".to_string(), online),
            ("AllRunnersCount".to_string(), runners.len() as i64),
            ("ActiveRunnersPercent".to_string(), active_percent),
        ];
        if let Some(description) = self.cloud.describe_asg(&self.asg_spec.asg_name).await? {
            metrics.push(("AsgDesiredCapacity".to_string(), description.desired_capacity));
            metrics.push(("AsgMinSize".to_string(), description.min_size));
            metrics.push(("AsgMaxSize".to_string(), description.max_size));
        }

        let dimensions = vec![
            ("GH_REPOSITORY".to_string(), self.asg_spec.repository.clone()),
            ("GH_LABEL".to_string(), self.asg_spec.label.clone()),
        ];
        let published = self.cloud.put_metric_data(&metrics, &dimensions).await?;

        let summary = metrics
            .iter()
            .map(|(name, value)| {
                let short = name
                    .replace("Runners", "")
                    .replace("Count", "")
                    .replace("Capacity", "");
                format!("{short}={value}")
            })
            .collect::<Vec<_>>()
            .join(" ");
        let line = format!("{}: {summary}", self.asg_spec);
        if published.is_some() {
            info!("{line}");
        } else {
            info!("{line} {DRY_RUN_ANNOTATION}");
        }
        Ok(())
    }
}

// ============================================================================
// Idle runners handler
// ============================================================================

struct IdleState {
    idle_runners: RunnersRegistry,
    terminated_instance_ids: ExpiringMap<String, ()>,
}

/// Terminates instances whose runner sat idle for too long, never dipping
/// below the group's minimum size.
pub struct IdleRunnersHandler {
    asg_spec: AsgSpec,
    cloud: Arc<dyn CloudAutoscaler>,
    max_idle_age_sec: i64,
    state: Mutex<IdleState>,
}

impl IdleRunnersHandler {
    pub fn new(asg_spec: AsgSpec, cloud: Arc<dyn CloudAutoscaler>, max_idle_age_sec: i64) -> Self {
        Self {
            asg_spec,
            cloud,
            max_idle_age_sec,
            state: Mutex::new(IdleState {
                idle_runners: RunnersRegistry::new(),
                terminated_instance_ids: ExpiringMap::new(REVISIT_TERMINATED_INSTANCE_TTL),
            }),
        }
    }
}

#[async_trait]
impl AsgHandler for IdleRunnersHandler {
    fn name(&self) -> String {
        format!("IdleRunnersHandler({})", self.asg_spec)
    }

    async fn handle(&self, runners: &[Runner]) -> Result<(), ReconcileError> {
        let now = Utc::now().timestamp();
        let mut old_idle_runners: Vec<Runner> = {
            let mut state = self.state.lock().unwrap();
            state
                .idle_runners
                .assign_if_not_exists(runners.iter().filter(|r| r.is_idle()).cloned());
            state
                .idle_runners
                .values()
                .filter(|r| {
                    !state.terminated_instance_ids.contains_key(r.id.as_str())
                        && now > r.loaded_at + self.max_idle_age_sec
                })
                .cloned()
                .collect()
        };
        // Oldest runners last, so the slice below keeps the newest.
        old_idle_runners.sort_by_key(|r| Reverse(r.loaded_at));

        let description = self.cloud.describe_asg(&self.asg_spec.asg_name).await?;
        let min_size = description.map(|d| d.min_size.max(0)).unwrap_or(1) as usize;

        for runner in old_idle_runners.iter().skip(min_size) {
            let mut doing = format!(
                "terminating old idle instance {} in {}",
                runner.name, self.asg_spec
            );
            if self.cloud.region().is_none() {
                doing.push_str(&format!(" {DRY_RUN_ANNOTATION}"));
            }
            let terminated = ActionScope::doing(doing)
                .swallow(async {
                    let instance_id = runner.instance_id()?;
                    self.cloud.terminate_instance(&instance_id).await?;
                    Ok::<_, ReconcileError>(())
                })
                .await;
            if terminated.is_some() {
                self.state
                    .lock()
                    .unwrap()
                    .terminated_instance_ids
                    .insert(runner.id.clone(), ());
            }
        }
        Ok(())
    }
}

// ============================================================================
// Offline runners handler
// ============================================================================

/// De-registers runners that have been offline for too long.
pub struct OfflineRunnersHandler {
    asg_spec: AsgSpec,
    platform: Arc<dyn CiPlatform>,
    max_offline_age_sec: i64,
    offline_runners: Mutex<RunnersRegistry>,
}

impl OfflineRunnersHandler {
    pub fn new(
        asg_spec: AsgSpec,
        platform: Arc<dyn CiPlatform>,
        max_offline_age_sec: i64,
    ) -> Self {
        Self {
            asg_spec,
            platform,
            max_offline_age_sec,
            offline_runners: Mutex::new(RunnersRegistry::new()),
        }
    }
}

#[async_trait]
impl AsgHandler for OfflineRunnersHandler {
    fn name(&self) -> String {
        format!("OfflineRunnersHandler({})", self.asg_spec)
    }

    async fn handle(&self, runners: &[Runner]) -> Result<(), ReconcileError> {
        let now = Utc::now().timestamp();
        let stale: Vec<Runner> = {
            let mut registry = self.offline_runners.lock().unwrap();
            registry.assign_if_not_exists(
                runners
                    .iter()
                    .filter(|r| r.status == RunnerStatus::Offline)
                    .cloned(),
            );
            registry
                .values()
                .filter(|r| now > r.loaded_at + self.max_offline_age_sec)
                .cloned()
                .collect()
        };
        for runner in stale {
            ActionScope::doing(format!(
                "removing offline runner {} from {}",
                runner.name, self.asg_spec
            ))
            .failure("failed (will retry)")
            .swallow(
                self.platform
                    .runner_ensure_absent(&self.asg_spec.repository, &runner.id),
            )
            .await;
        }
        Ok(())
    }
}

// ============================================================================
// Rate limits handler
// ============================================================================

/// Publishes the platform's and the image registry's rate-limit budgets as
/// one metric batch with no dimensions.
pub struct RateLimitsHandler {
    platform: Arc<dyn CiPlatform>,
    registry: Arc<dyn ImageRegistry>,
    cloud: Arc<dyn CloudAutoscaler>,
}

impl RateLimitsHandler {
    pub fn new(
        platform: Arc<dyn CiPlatform>,
        registry: Arc<dyn ImageRegistry>,
        cloud: Arc<dyn CloudAutoscaler>,
    ) -> Self {
        Self {
            platform,
            registry,
            cloud,
        }
    }

    pub async fn handle(&self) -> Result<(), ReconcileError> {
        let platform = self.platform.fetch_rate_limits().await?;
        let registry = self.registry.fetch_rate_limits().await?;
        let metrics: Vec<(String, i64)> = vec![
            ("GitHubLimit".to_string(), platform.limit),
            ("GitHubRemaining".to_string(), platform.remaining),
            ("DockerHubLimit".to_string(), registry.limit),
            ("DockerHubRemaining".to_string(), registry.remaining),
        ];
        let published = self.cloud.put_metric_data(&metrics, &[]).await?;

        let summary = metrics
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join(" ");
        if published.is_some() {
            info!("{summary}");
        } else {
            info!("{summary} {DRY_RUN_ANNOTATION}");
        }
        Ok(())
    }
}

// ============================================================================
// The loop
// ============================================================================

/// The periodic reconciliation worker.
pub struct Reconciler {
    platform: Arc<dyn CiPlatform>,
    handlers: Vec<(AsgSpec, Vec<Arc<dyn AsgHandler>>)>,
    rate_limits: RateLimitsHandler,
    poll_interval: Duration,
}

impl Reconciler {
    /// Build the standard handler set: runner metrics, idle termination and
    /// offline deregistration per spec, plus one rate-limit handler.
    pub fn new(
        platform: Arc<dyn CiPlatform>,
        cloud: Arc<dyn CloudAutoscaler>,
        registry: Arc<dyn ImageRegistry>,
        asg_specs: Vec<AsgSpec>,
        config: ReconcilerConfig,
    ) -> Self {
        let handlers = asg_specs
            .into_iter()
            .map(|spec| {
                let set: Vec<Arc<dyn AsgHandler>> = vec![
                    Arc::new(RunnerMetricsHandler::new(spec.clone(), cloud.clone())),
                    Arc::new(IdleRunnersHandler::new(
                        spec.clone(),
                        cloud.clone(),
                        config.max_idle_age_sec,
                    )),
                    Arc::new(OfflineRunnersHandler::new(
                        spec.clone(),
                        platform.clone(),
                        config.max_offline_age_sec,
                    )),
                ];
                (spec, set)
            })
            .collect();
        Self {
            platform: platform.clone(),
            handlers,
            rate_limits: RateLimitsHandler::new(platform, registry, cloud),
            poll_interval: config.poll_interval,
        }
    }

    /// Replace the standard handler set (used by tests).
    pub fn with_handlers(
        platform: Arc<dyn CiPlatform>,
        rate_limits: RateLimitsHandler,
        handlers: Vec<(AsgSpec, Vec<Arc<dyn AsgHandler>>)>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            platform,
            handlers,
            rate_limits,
            poll_interval,
        }
    }

    fn repositories(&self) -> Vec<String> {
        self.handlers
            .iter()
            .map(|(spec, _)| spec.repository.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// One full iteration: fetch runners per repository, fan out to the
    /// handlers, publish rate limits.
    pub async fn run_once(&self) {
        let mut runners_by_repo: HashMap<String, Vec<Runner>> = HashMap::new();
        for repository in self.repositories() {
            let fetched = ActionScope::new()
                .failure(format!("fetching runners for {repository} failed, will retry"))
                .swallow(self.platform.fetch_runners(&repository))
                .await;
            if let Some(runners) = fetched {
                runners_by_repo.insert(repository, runners);
            }
        }

        for (spec, handlers) in &self.handlers {
            let Some(repo_runners) = runners_by_repo.get(&spec.repository) else {
                continue;
            };
            let labelled: Vec<Runner> = repo_runners
                .iter()
                .filter(|r| r.labels.contains(&spec.label))
                .cloned()
                .collect();
            for handler in handlers {
                ActionScope::new()
                    .failure(format!("error in {}", handler.name()))
                    .swallow(handler.handle(&labelled))
                    .await;
            }
        }

        ActionScope::new()
            .failure("error in RateLimitsHandler")
            .swallow(self.rate_limits.handle())
            .await;
    }

    /// Run forever; the caller aborts the task on shutdown.
    pub async fn run(&self) {
        loop {
            self.run_once().await;
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
#[path = "reconcile_tests.rs"]
mod tests;
