//! Tests for CLI argument validation.

use super::*;

fn args(domain: &str, asgs: &[&str]) -> CliArgs {
    CliArgs {
        port: 8088,
        domain: domain.to_string(),
        asgs: asgs.iter().map(|s| s.to_string()).collect(),
        poll_interval_sec: 120,
        max_idle_age_sec: 300,
        max_offline_age_sec: 120,
    }
}

/// Scheme and path are stripped off the domain argument.
#[test]
fn test_domain_normalization() {
    for raw in [
        "ci.example.com",
        "https://ci.example.com",
        "https://ci.example.com/hooks",
        "ci.example.com/hooks/deep",
    ] {
        let config = ServiceConfig::from_args(&args(raw, &["o/r:lab:asg"])).unwrap();
        assert_eq!(config.domain, "ci.example.com", "raw input: {raw}");
    }
}

/// Each --asgs value may carry several space-delimited specs.
#[test]
fn test_asgs_split_on_whitespace() {
    let config = ServiceConfig::from_args(&args(
        "ci.example.com",
        &["o/r:lab:asg1 o/r:lab2:asg2", "o/other:lab:asg3"],
    ))
    .unwrap();
    assert_eq!(config.asg_specs.len(), 3);
    assert_eq!(config.asg_specs[2].repository, "o/other");
}

/// A malformed spec aborts startup.
#[test]
fn test_bad_spec_is_fatal() {
    let result = ServiceConfig::from_args(&args("ci.example.com", &["o/r:lab"]));
    assert!(matches!(result, Err(ConfigError::Spec(_))));
}

/// Whitespace-only specs and empty domains are rejected.
#[test]
fn test_empty_inputs_rejected() {
    assert!(matches!(
        ServiceConfig::from_args(&args("ci.example.com", &["  "])),
        Err(ConfigError::NoAsgSpecs)
    ));
    assert!(matches!(
        ServiceConfig::from_args(&args("https:///", &["o/r:lab:asg"])),
        Err(ConfigError::EmptyDomain)
    ));
}
