//! Loading and validating target manifests from a config directory.

mod common;

use std::path::PathBuf;

use common::TestHarness;
use convergent::{ConfigError, TargetLoader, TargetValidator};
use serde_json::json;

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures/targets")
        .join(name)
}

#[test]
fn test_load_valid_fixture() {
    let loaded = TargetLoader::new(fixture("valid")).load().unwrap();
    TargetValidator::new().validate(&loaded).unwrap();

    let settings = loaded.controller_settings();
    assert_eq!(settings.sync_interval, 60);
    assert_eq!(settings.worker_count, 4);
    assert_eq!(settings.history_limit, 20);
    assert_eq!(settings.live_cache_ttl_secs, 10);
    assert_eq!(settings.readiness_timeout_secs, 60);

    let targets = loaded.to_targets();
    let names: Vec<&str> = targets.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["billing", "web"]);

    let billing = &targets[0];
    assert_eq!(billing.revision, "HEAD");
    assert!(!billing.policy.automated);
    assert!(billing.policy.create_namespace);
    assert_eq!(billing.policy.retry_limit, 1);

    let web = &targets[1];
    assert_eq!(web.revision, "main");
    assert_eq!(web.source.path, "web");
    assert_eq!(web.destination.namespace, "web");
    assert!(web.policy.automated && web.policy.prune && web.policy.self_heal);
    assert_eq!(web.policy.retry_limit, 3);
    assert_eq!(web.parameters["replicas"], json!(3));
    assert_eq!(web.parameters["image"]["tag"], json!("2.1"));
}

#[test]
fn test_conflicting_fixture_reports_every_problem() {
    let loaded = TargetLoader::new(fixture("conflicting")).load().unwrap();
    let err = TargetValidator::new().validate(&loaded).unwrap_err();

    let ConfigError::Validation(message) = err else {
        panic!("expected validation error, got {:?}", err);
    };
    assert!(message.contains("Target 'web-copy': syncPolicy.selfHeal requires automated sync"));
    assert!(message.contains(
        "Targets 'web' and 'web-copy' share source 'https://git.example.com/platform/apps.git' \
         and destination 'https://cluster.example.com/web'"
    ));
}

#[test]
fn test_schema_rejects_unknown_policy_field() {
    let harness = TestHarness::new();
    harness.write_config(
        "web.yaml",
        "apiVersion: convergent.io/v1
kind: Target
metadata:
  name: web
spec:
  source:
    repoURL: /srv/apps
  destination:
    server: local
    namespace: web
  syncPolicy:
    autoSync: true
",
    );

    let err = TargetLoader::new(&harness.config_dir).load().unwrap_err();
    assert!(matches!(err, ConfigError::SchemaValidation { .. }), "{:?}", err);
}

#[test]
fn test_duplicate_target_names_across_files() {
    let harness = TestHarness::new();
    let manifest = |namespace: &str| {
        format!(
            "apiVersion: convergent.io/v1
kind: Target
metadata:
  name: web
spec:
  source:
    repoURL: /srv/apps
  destination:
    server: local
    namespace: {namespace}
"
        )
    };
    harness.write_config("a.yaml", &manifest("one"));
    harness.write_config("nested/b.yaml", &manifest("two"));

    let err = TargetLoader::new(&harness.config_dir).load().unwrap_err();
    assert!(matches!(
        err,
        ConfigError::DuplicateName { ref kind, ref name } if kind == "Target" && name == "web"
    ));
}

#[test]
fn test_missing_config_dir() {
    let harness = TestHarness::new();
    let missing = harness.temp_dir.path().join("absent");
    let err = TargetLoader::new(&missing).load().unwrap_err();
    assert!(matches!(err, ConfigError::ConfigDirNotFound(path) if path == missing));
}
