//! Tests for typed webhook payload extraction.

use super::*;
use serde_json::json;

/// A realistic workflow_run delivery extracts all consumed fields.
#[test]
fn test_extracts_workflow_run_fields() {
    let data = json!({
        "action": "requested",
        "workflow_run": {
            "id": 42,
            "run_attempt": 2,
            "name": "CI",
            "head_sha": "abc123",
            "path": ".github/workflows/ci.yml",
            "unrelated": {"left": "opaque"},
        },
        "repository": {"full_name": "own/repo"},
        "sender": {"login": "someone"},
    });
    let payload = WebhookPayload::from_json(&data);

    assert_eq!(payload.action.as_deref(), Some("requested"));
    assert_eq!(payload.repository.as_deref(), Some("own/repo"));
    assert!(!payload.is_hook_test);
    assert_eq!(
        payload.workflow_run,
        Some(WorkflowRunPayload {
            id: 42,
            run_attempt: 2,
            name: Some("CI".to_string()),
            head_sha: "abc123".to_string(),
            path: ".github/workflows/ci.yml".to_string(),
        })
    );
    assert!(payload.workflow_job.is_none());
}

/// A workflow_job delivery extracts id, name and labels.
#[test]
fn test_extracts_workflow_job_fields() {
    let data = json!({
        "action": "queued",
        "workflow_job": {
            "id": 7,
            "name": "test 6",
            "labels": ["lab", "self-hosted"],
        },
        "repository": {"full_name": "own/repo"},
    });
    let payload = WebhookPayload::from_json(&data);

    assert_eq!(
        payload.workflow_job,
        Some(WorkflowJobPayload {
            id: 7,
            name: Some("test 6".to_string()),
            labels: vec!["lab".to_string(), "self-hosted".to_string()],
        })
    );
}

/// A sub-payload missing a required field reads as absent, not as an error.
#[test]
fn test_malformed_sub_payload_reads_as_absent() {
    let data = json!({
        "action": "requested",
        "workflow_run": {"id": "not-a-number"},
        "repository": {"full_name": "own/repo"},
    });
    let payload = WebhookPayload::from_json(&data);
    assert!(payload.workflow_run.is_none());
}

/// The test delivery the platform sends after registration carries `hook`.
#[test]
fn test_detects_hook_test_delivery() {
    let data = json!({
        "zen": "Anything added dilutes everything else.",
        "hook_id": 1,
        "hook": {"id": 1},
        "repository": {"full_name": "own/repo"},
    });
    let payload = WebhookPayload::from_json(&data);
    assert!(payload.is_hook_test);
}

/// The log suffix lists unignored keys plus action and workflow name.
#[test]
fn test_log_suffix_shape() {
    let data = json!({
        "action": "requested",
        "workflow_run": {
            "id": 1,
            "run_attempt": 1,
            "name": "CI",
            "head_sha": "abc",
            "path": "wf.yml",
        },
        "repository": {"full_name": "own/repo"},
        "sender": {},
    });
    let payload = WebhookPayload::from_json(&data);
    assert_eq!(payload.log_suffix(), "{workflow_run} action=requested name=\"CI\"");

    let boring = WebhookPayload::from_json(&json!({"zen": "ok", "action": "ping"}));
    assert_eq!(boring.log_suffix(), "");
}
