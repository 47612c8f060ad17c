//! Resource identities and the desired/observed resource documents the
//! reconciler compares.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::RenderError;

/// Label marking a live resource as owned by a target.
pub const OWNER_LABEL: &str = "convergent.io/target";

/// Annotation listing explicit dependencies: `"Kind/namespace/name, Kind/name"`.
pub const DEPENDS_ON_ANNOTATION: &str = "convergent.io/depends-on";

/// Annotation carrying an integer sync wave hint.
pub const SYNC_WAVE_ANNOTATION: &str = "convergent.io/sync-wave";

pub const NAMESPACE_KIND: &str = "Namespace";
pub const CRD_KIND: &str = "CustomResourceDefinition";

/// Kinds that live outside any namespace.
const CLUSTER_SCOPED_KINDS: &[&str] = &[
    NAMESPACE_KIND,
    CRD_KIND,
    "ClusterRole",
    "ClusterRoleBinding",
    "PersistentVolume",
    "StorageClass",
    "PriorityClass",
    "IngressClass",
    "MutatingWebhookConfiguration",
    "ValidatingWebhookConfiguration",
    "APIService",
];

/// Metadata fields maintained by the live system; dropped from rendered documents.
const SERVER_MANAGED_METADATA: &[&str] = &[
    "resourceVersion",
    "generation",
    "managedFields",
    "creationTimestamp",
    "uid",
    "selfLink",
];

/// Returns true if resources of `kind` are not namespaced.
pub fn is_cluster_scoped(kind: &str) -> bool {
    CLUSTER_SCOPED_KINDS.contains(&kind)
}

/// Coarse install order used to break ties when no explicit edge exists.
pub fn kind_rank(kind: &str) -> u8 {
    match kind {
        NAMESPACE_KIND => 0,
        CRD_KIND => 1,
        "ServiceAccount" | "ClusterRole" | "ClusterRoleBinding" | "Role" | "RoleBinding"
        | "PriorityClass" | "StorageClass" => 2,
        "ConfigMap" | "Secret" | "PersistentVolume" | "PersistentVolumeClaim" => 3,
        "Service" => 4,
        "Deployment" | "StatefulSet" | "DaemonSet" | "ReplicaSet" | "Job" | "CronJob" | "Pod" => 5,
        "Ingress" | "HorizontalPodAutoscaler" | "PodDisruptionBudget" => 6,
        _ => 7,
    }
}

/// Identity of a resource: `(kind, namespace, name)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceKey {
    pub fn new(kind: impl Into<String>, namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            namespace: namespace.map(str::to_string),
            name: name.into(),
        }
    }

    /// Key of the Namespace object itself.
    pub fn namespace_object(name: impl Into<String>) -> Self {
        Self::new(NAMESPACE_KIND, None, name)
    }

    /// Parses `Kind/namespace/name` or `Kind/name`.
    ///
    /// A two-part reference to a namespaced kind resolves against
    /// `default_namespace`.
    pub fn parse(reference: &str, default_namespace: Option<&str>) -> Option<Self> {
        let parts: Vec<&str> = reference.trim().split('/').map(str::trim).collect();
        if parts.iter().any(|p| p.is_empty()) {
            return None;
        }
        match parts.as_slice() {
            [kind, name] if is_cluster_scoped(kind) => Some(Self::new(*kind, None, *name)),
            [kind, name] => Some(Self::new(*kind, default_namespace, *name)),
            [kind, namespace, name] => Some(Self::new(*kind, Some(namespace), *name)),
            _ => None,
        }
    }

    /// The `(namespace, name)` pair, independent of kind.
    pub fn identity(&self) -> (Option<&str>, &str) {
        (self.namespace.as_deref(), &self.name)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// A fully rendered resource document.
///
/// `spec` holds the managed body: every top-level field except `apiVersion`,
/// `kind`, `metadata` and `status`. Metadata fields other than name,
/// namespace, labels and annotations are kept in `extensions` and passed
/// through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesiredResource {
    pub api_version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    pub spec: Map<String, Value>,
    #[serde(default)]
    pub extensions: BTreeMap<String, Value>,
}

impl DesiredResource {
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(&self.kind, self.namespace.as_deref(), &self.name)
    }

    /// Builds a typed resource from a parsed manifest document.
    pub fn from_document(document: &str, value: Value) -> Result<Self, RenderError> {
        let invalid = |message: String| RenderError::InvalidDocument {
            document: document.to_string(),
            message,
        };

        let Value::Object(mut body) = value else {
            return Err(invalid("document is not a mapping".to_string()));
        };

        let api_version = take_string(&mut body, "apiVersion")
            .ok_or_else(|| invalid("missing apiVersion".to_string()))?;
        let kind =
            take_string(&mut body, "kind").ok_or_else(|| invalid("missing kind".to_string()))?;

        let Some(Value::Object(mut metadata)) = body.remove("metadata") else {
            return Err(invalid(format!("{} has no metadata", kind)));
        };
        let name = take_string(&mut metadata, "name")
            .filter(|n| !n.is_empty())
            .ok_or_else(|| invalid(format!("{} has no metadata.name", kind)))?;
        let namespace = take_string(&mut metadata, "namespace").filter(|n| !n.is_empty());
        let labels = take_string_map(&mut metadata, "labels").map_err(&invalid)?;
        let annotations = take_string_map(&mut metadata, "annotations").map_err(&invalid)?;
        for field in SERVER_MANAGED_METADATA {
            metadata.remove(*field);
        }
        let extensions = metadata.into_iter().collect();

        body.remove("status");

        Ok(Self {
            api_version,
            kind,
            namespace,
            name,
            labels,
            annotations,
            spec: body,
            extensions,
        })
    }

    /// Reassembles the full manifest document.
    pub fn to_document(&self) -> Value {
        let mut metadata = Map::new();
        for (key, value) in &self.extensions {
            metadata.insert(key.clone(), value.clone());
        }
        metadata.insert("name".into(), Value::String(self.name.clone()));
        if let Some(ns) = &self.namespace {
            metadata.insert("namespace".into(), Value::String(ns.clone()));
        }
        if !self.labels.is_empty() {
            metadata.insert("labels".into(), string_map_value(&self.labels));
        }
        if !self.annotations.is_empty() {
            metadata.insert("annotations".into(), string_map_value(&self.annotations));
        }

        let mut document = Map::new();
        document.insert("apiVersion".into(), Value::String(self.api_version.clone()));
        document.insert("kind".into(), Value::String(self.kind.clone()));
        document.insert("metadata".into(), Value::Object(metadata));
        for (key, value) in &self.spec {
            document.insert(key.clone(), value.clone());
        }
        Value::Object(document)
    }

    /// Target that owns this resource, from the ownership label.
    pub fn owner(&self) -> Option<&str> {
        self.labels.get(OWNER_LABEL).map(String::as_str)
    }

    /// Raw dependency references from the depends-on annotation.
    pub fn depends_on(&self) -> Vec<&str> {
        split_references(self.annotations.get(DEPENDS_ON_ANNOTATION))
    }

    /// Raw sync wave hint, if annotated.
    pub fn sync_wave(&self) -> Option<&str> {
        self.annotations.get(SYNC_WAVE_ANNOTATION).map(String::as_str)
    }

    /// For a CRD, the kind it introduces (`spec.names.kind`).
    pub fn defined_kind(&self) -> Option<&str> {
        crd_defined_kind(&self.kind, &self.spec)
    }

    /// For a CRD declaring `spec.scope: Cluster`, the kind it introduces.
    pub fn cluster_scoped_kind(&self) -> Option<&str> {
        crd_cluster_scoped_kind(&self.kind, &self.spec)
    }
}

/// A resource as currently reported by the live system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservedResource {
    pub api_version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    pub spec: Map<String, Value>,
    pub resource_version: u64,
    pub generation: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Value>,
}

impl ObservedResource {
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(&self.kind, self.namespace.as_deref(), &self.name)
    }

    /// Returns true if the resource carries `target`'s ownership marker.
    pub fn owned_by(&self, target: &str) -> bool {
        self.labels.get(OWNER_LABEL).map(String::as_str) == Some(target)
    }

    pub fn depends_on(&self) -> Vec<&str> {
        split_references(self.annotations.get(DEPENDS_ON_ANNOTATION))
    }

    pub fn defined_kind(&self) -> Option<&str> {
        crd_defined_kind(&self.kind, &self.spec)
    }

    pub fn cluster_scoped_kind(&self) -> Option<&str> {
        crd_cluster_scoped_kind(&self.kind, &self.spec)
    }
}

fn crd_cluster_scoped_kind<'a>(kind: &str, body: &'a Map<String, Value>) -> Option<&'a str> {
    let scope = body.get("spec").and_then(|s| s.get("scope"));
    if scope.and_then(Value::as_str) == Some("Cluster") {
        crd_defined_kind(kind, body)
    } else {
        None
    }
}

fn crd_defined_kind<'a>(kind: &str, body: &'a Map<String, Value>) -> Option<&'a str> {
    if kind != CRD_KIND {
        return None;
    }
    body.get("spec")
        .and_then(|s| s.get("names"))
        .and_then(|n| n.get("kind"))
        .and_then(Value::as_str)
}

fn split_references(raw: Option<&String>) -> Vec<&str> {
    raw.map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect()
    })
    .unwrap_or_default()
}

fn take_string(map: &mut Map<String, Value>, field: &str) -> Option<String> {
    match map.remove(field) {
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
        None => None,
    }
}

fn take_string_map(
    map: &mut Map<String, Value>,
    field: &str,
) -> Result<BTreeMap<String, String>, String> {
    match map.remove(field) {
        None | Some(Value::Null) => Ok(BTreeMap::new()),
        Some(Value::Object(entries)) => entries
            .into_iter()
            .map(|(k, v)| match v {
                Value::String(s) => Ok((k, s)),
                Value::Number(_) | Value::Bool(_) => Ok((k, v.to_string())),
                _ => Err(format!("metadata.{}.{} must be a string", field, k)),
            })
            .collect(),
        Some(_) => Err(format!("metadata.{} must be a mapping", field)),
    }
}

fn string_map_value(map: &BTreeMap<String, String>) -> Value {
    Value::Object(
        map.iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    )
}
