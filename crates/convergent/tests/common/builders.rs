#![allow(dead_code)]

use std::collections::BTreeMap;

use convergent::resource::OWNER_LABEL;
use convergent::{Destination, ObservedResource, SourceLocator, SyncPolicy, Target};
use serde_json::{json, Map, Value};

/// Builder for test targets.
pub struct TargetBuilder {
    name: String,
    repo_url: String,
    path: String,
    revision: String,
    server: String,
    namespace: String,
    policy: SyncPolicy,
    parameters: Map<String, Value>,
}

impl TargetBuilder {
    pub fn new(name: &str, repo_url: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            repo_url: repo_url.into(),
            path: String::new(),
            revision: "HEAD".to_string(),
            server: "local".to_string(),
            namespace: "apps".to_string(),
            policy: automated(),
            parameters: Map::new(),
        }
    }

    pub fn path(mut self, path: &str) -> Self {
        self.path = path.to_string();
        self
    }

    pub fn namespace(mut self, namespace: &str) -> Self {
        self.namespace = namespace.to_string();
        self
    }

    pub fn policy(mut self, policy: SyncPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn parameter(mut self, key: &str, value: Value) -> Self {
        self.parameters.insert(key.to_string(), value);
        self
    }

    pub fn build(self) -> Target {
        let mut target = Target::new(
            self.name,
            SourceLocator {
                repo_url: self.repo_url,
                path: self.path,
            },
            self.revision,
            Destination {
                server: self.server,
                namespace: self.namespace,
            },
        )
        .with_policy(self.policy);
        target.parameters = self.parameters;
        target
    }
}

/// Fully automated, pruning policy without self-heal.
pub fn automated() -> SyncPolicy {
    SyncPolicy {
        automated: true,
        prune: true,
        ..Default::default()
    }
}

/// Policy that only acts on manual syncs.
pub fn manual() -> SyncPolicy {
    SyncPolicy::default()
}

pub fn deployment_yaml(name: &str, replicas: u32) -> String {
    format!(
        "apiVersion: apps/v1
kind: Deployment
metadata:
  name: {name}
spec:
  replicas: {replicas}
  template:
    spec:
      containers:
        - name: {name}
          image: registry.local/{name}:1.0
"
    )
}

pub fn config_map_yaml(name: &str, value: &str) -> String {
    format!(
        "apiVersion: v1
kind: ConfigMap
metadata:
  name: {name}
data:
  value: \"{value}\"
"
    )
}

/// A ConfigMap that must be applied after `dependency`.
pub fn dependent_config_map_yaml(name: &str, dependency: &str) -> String {
    format!(
        "apiVersion: v1
kind: ConfigMap
metadata:
  name: {name}
  annotations:
    convergent.io/depends-on: {dependency}
data:
  value: \"{name}\"
"
    )
}

/// A live object carrying `target`'s ownership label.
pub fn owned_observed(kind: &str, namespace: Option<&str>, name: &str, target: &str) -> ObservedResource {
    ObservedResource {
        api_version: if kind == "Deployment" { "apps/v1" } else { "v1" }.into(),
        kind: kind.into(),
        namespace: namespace.map(str::to_string),
        name: name.into(),
        labels: BTreeMap::from([(OWNER_LABEL.to_string(), target.to_string())]),
        annotations: BTreeMap::new(),
        spec: json!({ "data": { "value": name } })
            .as_object()
            .cloned()
            .unwrap_or_default(),
        resource_version: 0,
        generation: 1,
        status: None,
    }
}
