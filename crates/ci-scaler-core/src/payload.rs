//! Typed extraction of webhook payloads.
//!
//! Webhook JSON arrives deeply untyped; the pipeline extracts the few fields
//! it consumes into small typed records once, up front, and leaves everything
//! else opaque. A sub-payload that is missing a required field is treated as
//! absent rather than failing the whole delivery.

use serde_json::Value;

/// Top-level keys that carry no signal for the access-log suffix.
const IGNORED_KEYS: [&str; 7] = [
    "zen",
    "hook_id",
    "repository",
    "sender",
    "organization",
    "enterprise",
    "action",
];

/// The `workflow_run` sub-payload fields the pipeline consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowRunPayload {
    pub id: i64,
    pub run_attempt: i64,
    pub name: Option<String>,
    pub head_sha: String,
    pub path: String,
}

/// The `workflow_job` sub-payload fields the pipeline consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowJobPayload {
    pub id: i64,
    pub name: Option<String>,
    pub labels: Vec<String>,
}

/// One webhook delivery, reduced to the fields the pipeline dispatches on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebhookPayload {
    pub action: Option<String>,
    /// `repository.full_name`.
    pub repository: Option<String>,
    /// The platform's webhook test delivery carries a `hook` key.
    pub is_hook_test: bool,
    pub workflow_run: Option<WorkflowRunPayload>,
    pub workflow_job: Option<WorkflowJobPayload>,
    /// Top-level keys that are worth mentioning in the access log.
    pub interesting_keys: Vec<String>,
}

impl WebhookPayload {
    pub fn from_json(data: &Value) -> Self {
        let action = data
            .get("action")
            .and_then(Value::as_str)
            .map(str::to_owned);
        let repository = data
            .pointer("/repository/full_name")
            .and_then(Value::as_str)
            .map(str::to_owned);
        let interesting_keys = data
            .as_object()
            .map(|object| {
                object
                    .keys()
                    .filter(|key| !IGNORED_KEYS.contains(&key.as_str()))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        Self {
            action,
            repository,
            is_hook_test: data.get("hook").is_some(),
            workflow_run: data.get("workflow_run").and_then(parse_workflow_run),
            workflow_job: data.get("workflow_job").and_then(parse_workflow_job),
            interesting_keys,
        }
    }

    /// The access-log suffix: `{keys} action=... name="..."`.
    ///
    /// Empty when the payload has no unignored top-level keys.
    pub fn log_suffix(&self) -> String {
        if self.interesting_keys.is_empty() {
            return String::new();
        }
        let mut suffix = format!("{{{}}}", self.interesting_keys.join(","));
        if let Some(action) = &self.action {
            suffix.push_str(&format!(" action={action}"));
        }
        let name = self
            .workflow_run
            .as_ref()
            .and_then(|run| run.name.as_deref())
            .or_else(|| {
                self.workflow_job
                    .as_ref()
                    .and_then(|job| job.name.as_deref())
            });
        if let Some(name) = name {
            suffix.push_str(&format!(" name=\"{name}\""));
        }
        suffix
    }
}

fn parse_workflow_run(value: &Value) -> Option<WorkflowRunPayload> {
    Some(WorkflowRunPayload {
        id: value.get("id")?.as_i64()?,
        run_attempt: value.get("run_attempt")?.as_i64()?,
        name: value.get("name").and_then(Value::as_str).map(str::to_owned),
        head_sha: value.get("head_sha")?.as_str()?.to_string(),
        path: value.get("path")?.as_str()?.to_string(),
    })
}

fn parse_workflow_job(value: &Value) -> Option<WorkflowJobPayload> {
    let labels = value
        .get("labels")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|v| v.as_str().map(str::to_owned))
                .collect()
        })
        .unwrap_or_default();
    Some(WorkflowJobPayload {
        id: value.get("id")?.as_i64()?,
        name: value.get("name").and_then(Value::as_str).map(str::to_owned),
        labels,
    })
}

#[cfg(test)]
#[path = "payload_tests.rs"]
mod tests;
