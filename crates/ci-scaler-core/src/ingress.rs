//! Webhook ingress pipeline and webhook registration lifecycle.
//!
//! One [`WebhookService`] owns everything the ingress path needs: the
//! registered webhooks, the event dedup map, the workflow cache, and the
//! per-job timing state. The HTTP layer stays a thin shell that parses the
//! body and forwards an [`IngressRequest`] here.
//!
//! Ordering guarantees:
//! - capacity increments are applied before the response is sent;
//! - the workflow-run dedup key is recorded only after the increments
//!   succeed, so a redelivery can repair a failed first attempt;
//! - the workflow-job dedup key is recorded up front because the timing
//!   logic is idempotent on its own.

use crate::adapters::{CiPlatform, CloudAutoscaler, CloudError, PlatformError, DRY_RUN_ANNOTATION};
use crate::expiring::ExpiringMap;
use crate::payload::WebhookPayload;
use crate::scope::ActionScope;
use crate::timing::{normalize_job_name, JobPhase, JobTimings};
use crate::workflow::Workflow;
use crate::{AsgSpec, UnixSeconds};
use bytes::Bytes;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};

type HmacSha256 = Hmac<Sha256>;

/// Path under the public domain that webhook deliveries arrive on.
pub const WEBHOOK_PATH: &str = "/ci-storage";

/// Event types the registered webhooks subscribe to.
pub const WEBHOOK_EVENTS: [&str; 2] = ["workflow_run", "workflow_job"];

const DUPLICATED_EVENTS_TTL: Duration = Duration::from_secs(3600);
const WORKFLOWS_TTL: Duration = Duration::from_secs(3600);
const SERVICE_TICK_MIN_INTERVAL: Duration = Duration::from_secs(10);

// ============================================================================
// Request / response types
// ============================================================================

/// One webhook delivery as seen by the HTTP layer.
#[derive(Debug, Clone)]
pub struct IngressRequest {
    pub path: String,
    pub client_ip: IpAddr,
    /// The `X-Hub-Signature-256` header, verbatim.
    pub signature: Option<String>,
    /// The body parsed as a JSON object.
    pub payload: Value,
    /// The exact bytes the signature covers.
    pub raw_body: Bytes,
}

/// What the HTTP layer should answer, plus the access-log suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressResponse {
    pub status: u16,
    pub message: String,
    pub log_suffix: String,
}

impl IngressResponse {
    /// The JSON envelope for the response body.
    pub fn body(&self) -> Value {
        if self.status >= 400 {
            json!({ "error": self.message })
        } else {
            json!({ "message": self.message })
        }
    }
}

fn respond(status: u16, message: impl Into<String>, base_suffix: &str) -> IngressResponse {
    let message = message.into();
    let log_suffix = if base_suffix.is_empty() {
        message.clone()
    } else {
        format!("{base_suffix}; {message}")
    };
    IngressResponse {
        status,
        message,
        log_suffix,
    }
}

// ============================================================================
// Webhook service
// ============================================================================

/// A webhook registered on the platform for one repository.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Webhook {
    url: String,
    last_delivery_at: Option<UnixSeconds>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum DedupKey {
    Run { run_id: i64, run_attempt: i64 },
    Job { job_id: i64, action: String },
}

struct IngressState {
    webhooks: HashMap<String, Webhook>,
    duplicated_events: ExpiringMap<DedupKey, UnixSeconds>,
    workflows: ExpiringMap<(String, String), Workflow>,
    job_timings: JobTimings,
    last_service_tick: Option<Instant>,
    ping_cursor: usize,
}

/// The webhook ingress core: signature verification, dedup, workflow label
/// prediction, capacity increments, job timing metrics, and the webhook
/// registration lifecycle.
pub struct WebhookService {
    cloud: Arc<dyn CloudAutoscaler>,
    platform: Arc<dyn CiPlatform>,
    domain: String,
    asg_specs: Vec<AsgSpec>,
    secret: Option<String>,
    state: Mutex<IngressState>,
}

impl WebhookService {
    pub fn new(
        cloud: Arc<dyn CloudAutoscaler>,
        platform: Arc<dyn CiPlatform>,
        domain: impl Into<String>,
        asg_specs: Vec<AsgSpec>,
    ) -> Self {
        let secret = platform.webhook_secret();
        Self {
            cloud,
            platform,
            domain: domain.into(),
            asg_specs,
            secret,
            state: Mutex::new(IngressState {
                webhooks: HashMap::new(),
                duplicated_events: ExpiringMap::new(DUPLICATED_EVENTS_TTL),
                workflows: ExpiringMap::new(WORKFLOWS_TTL),
                job_timings: JobTimings::new(),
                last_service_tick: None,
                ping_cursor: 0,
            }),
        }
    }

    /// The public URL webhook deliveries are sent to.
    pub fn webhook_url(&self) -> String {
        format!("https://{}{}", self.domain, WEBHOOK_PATH)
    }

    /// Every distinct repository referenced by an ASG spec, in stable order.
    fn repositories(&self) -> Vec<String> {
        self.asg_specs
            .iter()
            .map(|spec| spec.repository.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Register the webhook on every configured repository.
    ///
    /// Skipped entirely when no secret is available (no token), because an
    /// unverifiable webhook is worse than none.
    pub async fn register_webhooks(&self) -> Result<(), PlatformError> {
        let Some(secret) = self.secret.clone() else {
            warn!("no platform token available, skipping webhook registration");
            return Ok(());
        };
        let url = self.webhook_url();
        for repository in self.repositories() {
            info!(%repository, %url, "registering webhook");
            self.platform
                .webhook_ensure_exists(&repository, &url, &secret, &WEBHOOK_EVENTS)
                .await?;
            self.state.lock().unwrap().webhooks.insert(
                repository,
                Webhook {
                    url: url.clone(),
                    last_delivery_at: None,
                },
            );
        }
        Ok(())
    }

    /// Delete every webhook this process registered. Errors are swallowed;
    /// the platform prunes dead webhooks on its own eventually.
    pub async fn unregister_webhooks(&self) {
        let webhooks: Vec<(String, Webhook)> =
            self.state.lock().unwrap().webhooks.drain().collect();
        for (repository, webhook) in webhooks {
            ActionScope::doing(format!(
                "deleting webhook {} for {repository}",
                webhook.url
            ))
            .swallow(self.platform.webhook_ensure_absent(&repository, &webhook.url))
            .await;
        }
    }

    /// Periodic compensation for webhooks that never fire (e.g. a
    /// misconfigured gateway): at most every 10 seconds, pick the next
    /// repository round-robin and ping its webhook if no delivery has been
    /// seen yet.
    pub async fn service_tick(&self) {
        let target = {
            let mut state = self.state.lock().unwrap();
            let throttled = state
                .last_service_tick
                .is_some_and(|at| at.elapsed() < SERVICE_TICK_MIN_INTERVAL);
            if throttled {
                return;
            }
            state.last_service_tick = Some(Instant::now());

            let repositories = self.repositories();
            if repositories.is_empty() {
                return;
            }
            let repository = repositories[state.ping_cursor % repositories.len()].clone();
            state.ping_cursor = state.ping_cursor.wrapping_add(1);
            match state.webhooks.get(&repository) {
                Some(webhook) if webhook.last_delivery_at.is_none() => {
                    Some((repository, webhook.url.clone()))
                }
                _ => None,
            }
        };
        if let Some((repository, url)) = target {
            ActionScope::doing(format!(
                "pinging webhook for {repository} (no deliveries seen yet)"
            ))
            .swallow(self.platform.webhook_ping(&repository, &url))
            .await;
        }
    }

    // ------------------------------------------------------------------
    // Per-request pipeline
    // ------------------------------------------------------------------

    pub async fn handle(&self, request: IngressRequest) -> IngressResponse {
        let now = Utc::now().timestamp();
        let payload = WebhookPayload::from_json(&request.payload);
        let suffix = payload.log_suffix();

        // Loopback requests carrying no recognizable payload are debug
        // commands addressed by path.
        if request.client_ip.is_loopback()
            && payload.workflow_run.is_none()
            && payload.workflow_job.is_none()
            && payload.repository.is_none()
            && !payload.is_hook_test
        {
            return self.handle_debug(&request.path, &suffix, now).await;
        }

        // Any delivery for a registered repository proves the webhook works.
        if let Some(repository) = &payload.repository {
            let mut state = self.state.lock().unwrap();
            if let Some(webhook) = state.webhooks.get_mut(repository) {
                webhook.last_delivery_at = Some(now);
            }
        }

        if payload.is_hook_test {
            return respond(202, "ignoring service \"hook\" event", &suffix);
        }
        let Some(repository) = payload.repository.clone() else {
            return respond(202, "no repository in payload", &suffix);
        };

        let Some(secret) = &self.secret else {
            return respond(403, "no webhook secret available to verify the request", &suffix);
        };
        if let Err(reason) = verify_signature(secret, request.signature.as_deref(), &request.raw_body)
        {
            return respond(403, reason, &suffix);
        }

        if let Some(run) = &payload.workflow_run {
            let action = payload.action.as_deref().unwrap_or("");
            if action != "requested" && action != "in_progress" {
                return respond(
                    202,
                    format!("ignoring \"{action}\" workflow_run event"),
                    &suffix,
                );
            }

            let dedup_key = DedupKey::Run {
                run_id: run.id,
                run_attempt: run.run_attempt,
            };
            if self
                .state
                .lock()
                .unwrap()
                .duplicated_events
                .contains_key(&dedup_key)
            {
                return respond(202, "this event has already been processed", &suffix);
            }

            let workflow = match self
                .cached_workflow(&repository, &run.head_sha, &run.path)
                .await
            {
                Ok(workflow) => workflow,
                Err(e) => {
                    return respond(
                        500,
                        format!(
                            "{repository}: downloading {} and parsing jobs list failed: {e}",
                            basename(&run.path)
                        ),
                        &suffix,
                    );
                }
            };
            let labels = workflow.predict_labels();
            info!(
                "{repository}: {} predicts {}",
                basename(&run.path),
                labels
                    .iter()
                    .map(|(label, inc)| format!("{label}:+{inc}"))
                    .collect::<Vec<_>>()
                    .join(" ")
            );

            return match self.scale_up(&repository, &labels).await {
                Ok((status, message)) => {
                    // Dedup only once the increments went through, so a
                    // redelivery can retry a failed attempt.
                    self.state
                        .lock()
                        .unwrap()
                        .duplicated_events
                        .insert(dedup_key, now);
                    respond(status, message, &suffix)
                }
                Err(e) => respond(
                    500,
                    format!("incrementing desired capacity failed: {e}"),
                    &suffix,
                ),
            };
        }

        if let Some(job) = &payload.workflow_job {
            let action = payload.action.as_deref().unwrap_or("");
            let Some(phase) = JobPhase::from_action(action) else {
                return respond(
                    202,
                    format!("ignoring \"{action}\" workflow_job event"),
                    &suffix,
                );
            };

            let dedup_key = DedupKey::Job {
                job_id: job.id,
                action: action.to_string(),
            };
            {
                let mut state = self.state.lock().unwrap();
                if state.duplicated_events.contains_key(&dedup_key) {
                    return respond(202, "this event has already been processed", &suffix);
                }
                state.duplicated_events.insert(dedup_key, now);
            }

            let (status, message) = self
                .observe_job(&repository, job.id, job.name.as_deref(), &job.labels, phase, now)
                .await;
            return respond(status, message, &suffix);
        }

        respond(202, "no workflow_run/workflow_job payload", &suffix)
    }

    // ------------------------------------------------------------------
    // Debug bypass
    // ------------------------------------------------------------------

    async fn handle_debug(&self, path: &str, suffix: &str, now: UnixSeconds) -> IngressResponse {
        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        match segments.as_slice() {
            ["workflow_run", owner, repo, label] => {
                let repository = format!("{owner}/{repo}");
                let labels = BTreeMap::from([((*label).to_string(), 1u32)]);
                match self.scale_up(&repository, &labels).await {
                    Ok((status, message)) => respond(status, message, suffix),
                    Err(e) => respond(
                        500,
                        format!("incrementing desired capacity failed: {e}"),
                        suffix,
                    ),
                }
            }
            ["workflow_job", owner, repo, label, action, job_id] => {
                let (Some(phase), Ok(job_id)) =
                    (JobPhase::from_action(action), job_id.parse::<i64>())
                else {
                    return debug_usage(path, suffix);
                };
                let repository = format!("{owner}/{repo}");
                let labels = vec![(*label).to_string()];
                let (status, message) = self
                    .observe_job(&repository, job_id, None, &labels, phase, now)
                    .await;
                respond(status, message, suffix)
            }
            _ => debug_usage(path, suffix),
        }
    }

    // ------------------------------------------------------------------
    // Shared branch logic
    // ------------------------------------------------------------------

    /// Increment the desired capacity of every ASG whose spec matches the
    /// repository and one of the predicted labels.
    async fn scale_up(
        &self,
        repository: &str,
        labels: &BTreeMap<String, u32>,
    ) -> Result<(u16, String), CloudError> {
        let mut notes = Vec::new();
        let mut any_live = false;
        for spec in &self.asg_specs {
            if spec.repository != repository {
                continue;
            }
            let Some(&inc) = labels.get(&spec.label) else {
                continue;
            };
            if inc == 0 {
                continue;
            }
            let result = self
                .cloud
                .increment_desired_capacity(&spec.asg_name, i64::from(inc))
                .await?;
            any_live = any_live || result.is_some();
            notes.push(format!("{}:+{inc}", spec.label));
        }
        if notes.is_empty() {
            Ok((
                202,
                format!(
                    "no matching auto-scaling group for repository {repository} and labels {:?}",
                    labels.keys().collect::<Vec<_>>()
                ),
            ))
        } else {
            let annotation = if any_live {
                String::new()
            } else {
                format!(" {DRY_RUN_ANNOTATION}")
            };
            Ok((
                200,
                format!("{repository} desired capacity: {}{annotation}", notes.join(", ")),
            ))
        }
    }

    /// Record one job phase and publish whatever timing metrics became
    /// derivable.
    async fn observe_job(
        &self,
        repository: &str,
        job_id: i64,
        job_name: Option<&str>,
        labels: &[String],
        phase: JobPhase,
        now: UnixSeconds,
    ) -> (u16, String) {
        let Some(spec) = self
            .asg_specs
            .iter()
            .find(|spec| spec.repository == repository && labels.contains(&spec.label))
        else {
            return (
                202,
                format!(
                    "no matching auto-scaling group for repository {repository} and labels {labels:?}"
                ),
            );
        };

        let metrics = self
            .state
            .lock()
            .unwrap()
            .job_timings
            .observe(job_id, phase, now);
        if metrics.is_empty() {
            return (202, "no new job timing metrics".to_string());
        }

        let mut dimensions = vec![
            ("GH_REPOSITORY".to_string(), spec.repository.clone()),
            ("GH_LABEL".to_string(), spec.label.clone()),
        ];
        if let Some(name) = job_name {
            dimensions.push(("GH_JOB_NAME".to_string(), normalize_job_name(name)));
        }
        let batch: Vec<(String, i64)> = metrics
            .iter()
            .map(|(name, value)| (name.to_string(), *value))
            .collect();
        let published = ActionScope::new()
            .failure(format!("publishing job timing metrics for {spec} failed"))
            .swallow(self.cloud.put_metric_data(&batch, &dimensions))
            .await;

        let summary = metrics
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join(" ");
        let annotation = match published {
            Some(None) => format!(" {DRY_RUN_ANNOTATION}"),
            _ => String::new(),
        };
        (202, format!("{spec}: {summary}{annotation}"))
    }

    /// The workflow file, cached per `(repository, path)` so a burst of runs
    /// of the same workflow downloads it once.
    async fn cached_workflow(
        &self,
        repository: &str,
        sha: &str,
        path: &str,
    ) -> Result<Workflow, PlatformError> {
        let key = (repository.to_string(), path.to_string());
        if let Some(workflow) = self.state.lock().unwrap().workflows.get(&key) {
            return Ok(workflow.clone());
        }
        let workflow = self.platform.fetch_workflow(repository, sha, path).await?;
        self.state
            .lock()
            .unwrap()
            .workflows
            .insert(key, workflow.clone());
        Ok(workflow)
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Verify the HMAC-SHA-256 signature over the raw body in constant time.
fn verify_signature(
    secret: &str,
    header: Option<&str>,
    body: &[u8],
) -> Result<(), &'static str> {
    const MISMATCH: &str = "request signatures didn't match";
    let Some(header) = header else {
        return Err("X-Hub-Signature-256 header is missing");
    };
    let Some(hex_digest) = header.strip_prefix("sha256=") else {
        return Err(MISMATCH);
    };
    let Ok(signature) = hex::decode(hex_digest) else {
        return Err(MISMATCH);
    };
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| MISMATCH)?;
    mac.update(body);
    mac.verify_slice(&signature).map_err(|_| MISMATCH)
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn debug_usage(path: &str, suffix: &str) -> IngressResponse {
    respond(
        404,
        format!(
            "when accessing from localhost for debugging, the path must look like \
             /workflow_run/{{owner}}/{{repo}}/{{label}} or \
             /workflow_job/{{owner}}/{{repo}}/{{label}}/{{queued|in_progress|completed}}/{{job_id}}, \
             but got {path}"
        ),
        suffix,
    )
}

#[cfg(test)]
#[path = "ingress_tests.rs"]
mod tests;
