//! K8s-style manifest types for controller configuration.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;

use super::settings::ControllerSettings;
use crate::target::{Destination, SourceLocator, SyncPolicy, Target};

/// The API version for all convergent manifests.
pub const API_VERSION: &str = "convergent.io/v1";

/// The kind of configuration manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ManifestKind {
    Settings,
    Target,
}

impl std::fmt::Display for ManifestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ManifestKind::Settings => write!(f, "Settings"),
            ManifestKind::Target => write!(f, "Target"),
        }
    }
}

impl std::str::FromStr for ManifestKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "settings" => Ok(ManifestKind::Settings),
            "target" => Ok(ManifestKind::Target),
            _ => Err(format!("Unknown manifest kind: {}", s)),
        }
    }
}

/// Metadata for a manifest, following K8s conventions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
}

impl ObjectMeta {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            labels: HashMap::new(),
            annotations: HashMap::new(),
        }
    }
}

/// A generic K8s-style manifest wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest<T> {
    /// API version, should always be `convergent.io/v1`.
    pub api_version: String,
    pub kind: ManifestKind,
    pub metadata: ObjectMeta,
    pub spec: T,
}

impl<T> Manifest<T> {
    pub fn new(kind: ManifestKind, name: impl Into<String>, spec: T) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind,
            metadata: ObjectMeta::new(name),
            spec,
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }
}

/// Source section of a Target manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSpec {
    #[serde(rename = "repoURL")]
    pub repo_url: String,

    #[serde(default = "default_revision")]
    pub target_revision: String,

    #[serde(default)]
    pub path: String,
}

fn default_revision() -> String {
    "HEAD".to_string()
}

/// Target specification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetSpec {
    pub source: SourceSpec,

    pub destination: Destination,

    /// Render parameters, merged over the bundle's `values.yaml`.
    #[serde(default)]
    pub parameters: Map<String, Value>,

    #[serde(default)]
    pub sync_policy: SyncPolicy,
}

pub type TargetManifest = Manifest<TargetSpec>;
pub type SettingsManifest = Manifest<ControllerSettings>;

impl TargetManifest {
    /// Converts the manifest into the runtime target model.
    pub fn to_target(&self) -> Target {
        Target {
            name: self.metadata.name.clone(),
            source: SourceLocator {
                repo_url: self.spec.source.repo_url.clone(),
                path: self.spec.source.path.clone(),
            },
            revision: self.spec.source.target_revision.clone(),
            destination: self.spec.destination.clone(),
            parameters: self.spec.parameters.clone(),
            policy: self.spec.sync_policy.clone(),
        }
    }
}

/// A manifest that can be any of the supported kinds.
#[derive(Debug, Clone)]
pub enum AnyManifest {
    Settings(SettingsManifest),
    Target(TargetManifest),
}

impl AnyManifest {
    pub fn kind(&self) -> ManifestKind {
        match self {
            AnyManifest::Settings(_) => ManifestKind::Settings,
            AnyManifest::Target(_) => ManifestKind::Target,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            AnyManifest::Settings(m) => &m.metadata.name,
            AnyManifest::Target(m) => &m.metadata.name,
        }
    }
}

/// Intermediate struct for parsing manifests before determining their type.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestHeader {
    pub api_version: String,
    pub kind: ManifestKind,
    pub metadata: ObjectMeta,
}

/// A manifest along with the file it was loaded from.
#[derive(Debug, Clone)]
pub struct ManifestWithPath<T> {
    pub manifest: T,
    /// The file path relative to the config directory.
    pub path: PathBuf,
}

impl<T> ManifestWithPath<T> {
    pub fn new(manifest: T, path: impl Into<PathBuf>) -> Self {
        Self {
            manifest,
            path: path.into(),
        }
    }
}
