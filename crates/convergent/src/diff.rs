//! Structured comparison of desired and observed state.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DiffError;
use crate::resource::{
    is_cluster_scoped, kind_rank, DesiredResource, ObservedResource, ResourceKey, NAMESPACE_KIND,
};
use crate::target::{SyncPolicy, Target};

/// Differing paths reported per update.
const MAX_DRIFT_PATHS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verb {
    Create,
    Update,
    Delete,
    NoOp,
}

impl std::fmt::Display for Verb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verb::Create => write!(f, "create"),
            Verb::Update => write!(f, "update"),
            Verb::Delete => write!(f, "delete"),
            Verb::NoOp => write!(f, "no-op"),
        }
    }
}

/// One required change to a single resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    pub key: ResourceKey,
    pub verb: Verb,
    /// Document to apply, for Create and Update.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<DesiredResource>,
    /// Coarse install order of the kind.
    pub rank: u8,
    /// Raw depends-on references of the resource.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_wave: Option<String>,
    /// Kind introduced by a CRD.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub defines_kind: Option<String>,
    /// Readiness must be confirmed before the action counts as succeeded.
    pub await_ready: bool,
    /// Namespace created on behalf of `createNamespace`, not rendered.
    pub implicit: bool,
    /// For a delete, the new resource that takes over the same name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replaced_by: Option<ResourceKey>,
    /// Managed paths that differ, for updates.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub drift: Vec<String>,
}

impl Action {
    /// A bare action with no payload or ordering hints.
    pub fn new(key: ResourceKey, verb: Verb) -> Self {
        Self {
            rank: kind_rank(&key.kind),
            key,
            verb,
            payload: None,
            depends_on: Vec::new(),
            sync_wave: None,
            defines_kind: None,
            await_ready: false,
            implicit: false,
            replaced_by: None,
            drift: Vec::new(),
        }
    }

    fn for_desired(resource: &DesiredResource, verb: Verb) -> Self {
        let mut action = Self::new(resource.key(), verb);
        action.depends_on = resource.depends_on().into_iter().map(str::to_string).collect();
        action.sync_wave = resource.sync_wave().map(str::to_string);
        action.defines_kind = resource.defined_kind().map(str::to_string);
        if verb != Verb::NoOp {
            action.payload = Some(resource.clone());
        }
        action
    }

    fn for_orphan(resource: &ObservedResource) -> Self {
        let mut action = Self::new(resource.key(), Verb::Delete);
        action.depends_on = resource.depends_on().into_iter().map(str::to_string).collect();
        action.defines_kind = resource.defined_kind().map(str::to_string);
        action
    }

    pub fn is_noop(&self) -> bool {
        self.verb == Verb::NoOp
    }
}

/// A live resource that diverges from desired state without a corrective action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutOfSyncRecord {
    pub key: ResourceKey,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffReport {
    /// Actions sorted by resource key.
    pub actions: Vec<Action>,
    pub out_of_sync: Vec<OutOfSyncRecord>,
}

impl DiffReport {
    /// Actions that change something.
    pub fn changes(&self) -> impl Iterator<Item = &Action> {
        self.actions.iter().filter(|a| !a.is_noop())
    }
}

/// Compares desired and observed state for one target.
pub struct Differ<'a> {
    target: &'a str,
    destination_namespace: &'a str,
    policy: &'a SyncPolicy,
}

impl<'a> Differ<'a> {
    pub fn new(target: &'a Target) -> Self {
        Self {
            target: &target.name,
            destination_namespace: &target.destination.namespace,
            policy: &target.policy,
        }
    }

    pub fn diff(
        &self,
        desired: &[DesiredResource],
        observed: &[ObservedResource],
    ) -> Result<DiffReport, DiffError> {
        let custom_cluster_kinds: BTreeSet<&str> = desired
            .iter()
            .filter_map(DesiredResource::cluster_scoped_kind)
            .chain(observed.iter().filter_map(ObservedResource::cluster_scoped_kind))
            .collect();

        let mut desired_by_key = BTreeMap::new();
        for resource in desired {
            check_scope(&resource.key(), &custom_cluster_kinds)?;
            if desired_by_key.insert(resource.key(), resource).is_some() {
                return Err(DiffError::DuplicateIdentity(resource.key().to_string(), "desired"));
            }
        }

        let mut observed_by_key = BTreeMap::new();
        for resource in observed {
            if observed_by_key.insert(resource.key(), resource).is_some() {
                return Err(DiffError::DuplicateIdentity(resource.key().to_string(), "observed"));
            }
        }

        // Owned live resources about to be replaced by a different kind under the same name
        let mut replaced: BTreeMap<(Option<&str>, &str), ResourceKey> = BTreeMap::new();
        for (key, resource) in &observed_by_key {
            if !desired_by_key.contains_key(key) && resource.owned_by(self.target) {
                replaced.insert(key.identity(), key.clone());
            }
        }

        let mut report = DiffReport::default();

        for (key, resource) in &desired_by_key {
            let action = match observed_by_key.get(key) {
                None => {
                    let mut action = Action::for_desired(resource, Verb::Create);
                    action.await_ready =
                        replaced.contains_key(&key.identity()) && !self.policy.replace;
                    action
                }
                Some(live) => {
                    let drift = managed_drift(resource, live);
                    if drift.is_empty() {
                        Action::for_desired(resource, Verb::NoOp)
                    } else {
                        let mut action = Action::for_desired(resource, Verb::Update);
                        action.drift = drift;
                        action
                    }
                }
            };
            report.actions.push(action);
        }

        for (key, resource) in &observed_by_key {
            if desired_by_key.contains_key(key) || !resource.owned_by(self.target) {
                continue;
            }
            if self.policy.prune {
                let mut action = Action::for_orphan(resource);
                action.replaced_by = desired_by_key
                    .keys()
                    .find(|k| k.identity() == key.identity())
                    .cloned();
                report.actions.push(action);
            } else {
                report.out_of_sync.push(OutOfSyncRecord {
                    key: key.clone(),
                    reason: "not in desired state and pruning is disabled".to_string(),
                });
            }
        }

        let namespace_key = ResourceKey::namespace_object(self.destination_namespace);
        if self.policy.create_namespace
            && !desired_by_key.contains_key(&namespace_key)
            && !observed_by_key.contains_key(&namespace_key)
        {
            let mut action = Action::new(namespace_key, Verb::Create);
            action.payload = Some(namespace_document(self.destination_namespace));
            action.implicit = true;
            report.actions.push(action);
        }

        report.actions.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(report)
    }
}

/// `custom_cluster_kinds` holds kinds that CRDs declare cluster-scoped.
fn check_scope(key: &ResourceKey, custom_cluster_kinds: &BTreeSet<&str>) -> Result<(), DiffError> {
    let cluster_scoped =
        is_cluster_scoped(&key.kind) || custom_cluster_kinds.contains(key.kind.as_str());
    match (cluster_scoped, &key.namespace) {
        (true, Some(_)) => Err(DiffError::InvalidResource {
            key: key.to_string(),
            message: "cluster-scoped kind carries a namespace".to_string(),
        }),
        (false, None) => Err(DiffError::InvalidResource {
            key: key.to_string(),
            message: "namespaced kind has no namespace".to_string(),
        }),
        _ => Ok(()),
    }
}

fn namespace_document(name: &str) -> DesiredResource {
    DesiredResource {
        api_version: "v1".to_string(),
        kind: NAMESPACE_KIND.to_string(),
        namespace: None,
        name: name.to_string(),
        labels: BTreeMap::new(),
        annotations: BTreeMap::new(),
        spec: Map::new(),
        extensions: BTreeMap::new(),
    }
}

/// Paths of managed fields whose live value differs from the desired value.
///
/// Only fields present in the desired document are managed; anything the
/// live system adds on its own (status, defaults) is ignored.
pub fn managed_drift(desired: &DesiredResource, observed: &ObservedResource) -> Vec<String> {
    let mut drift = Vec::new();

    if desired.api_version != observed.api_version {
        drift.push("apiVersion".to_string());
    }
    for (key, value) in &desired.labels {
        if observed.labels.get(key) != Some(value) {
            drift.push(format!("metadata.labels.{}", key));
        }
    }
    for (key, value) in &desired.annotations {
        if observed.annotations.get(key) != Some(value) {
            drift.push(format!("metadata.annotations.{}", key));
        }
    }
    compare_maps("", &desired.spec, &observed.spec, &mut drift);

    drift.truncate(MAX_DRIFT_PATHS);
    drift
}

fn compare_maps(
    path: &str,
    desired: &Map<String, Value>,
    observed: &Map<String, Value>,
    drift: &mut Vec<String>,
) {
    for (key, value) in desired {
        let child = if path.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", path, key)
        };
        compare(&child, value, observed.get(key), drift);
    }
}

fn compare(path: &str, desired: &Value, observed: Option<&Value>, drift: &mut Vec<String>) {
    match (desired, observed) {
        (Value::Object(d), Some(Value::Object(o))) => compare_maps(path, d, o, drift),
        (Value::Array(d), Some(Value::Array(o))) if d.len() == o.len() => {
            for (index, (dv, ov)) in d.iter().zip(o).enumerate() {
                compare(&format!("{}[{}]", path, index), dv, Some(ov), drift);
            }
        }
        (Value::Null, None) => {}
        (Value::Number(d), Some(Value::Number(o))) => {
            if d != o && d.as_f64() != o.as_f64() {
                drift.push(path.to_string());
            }
        }
        (d, Some(o)) if d == o => {}
        _ => drift.push(path.to_string()),
    }
}
