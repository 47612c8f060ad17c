//! Base-plus-patches overlays described by `kustomization.yaml`.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;

use super::values::deep_merge;
use crate::error::RenderError;
use crate::resource::DesiredResource;

pub const KUSTOMIZATION_FILE: &str = "kustomization.yaml";

/// Overlay description.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Kustomization {
    /// Files or directories holding the base resources.
    #[serde(default)]
    pub resources: Vec<String>,

    #[serde(default)]
    pub patches: Vec<PatchRef>,

    /// Namespace forced onto every namespaced resource.
    #[serde(default)]
    pub namespace: Option<String>,

    #[serde(default)]
    pub common_labels: BTreeMap<String, String>,
}

/// A patch entry: either a bare path or `{ path: ... }`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PatchRef {
    Path(String),
    Entry { path: String },
}

impl PatchRef {
    pub fn path(&self) -> &str {
        match self {
            PatchRef::Path(p) | PatchRef::Entry { path: p } => p,
        }
    }
}

impl Kustomization {
    /// Resolves `resources` entries against the bundle file list.
    ///
    /// A directory entry expands to every YAML file below it, in path order.
    pub fn resource_files<'a>(
        &self,
        files: impl Iterator<Item = &'a String> + Clone,
    ) -> Result<Vec<String>, RenderError> {
        let mut resolved = Vec::new();
        for entry in &self.resources {
            let entry = normalize(entry);
            let prefix = format!("{}/", entry);
            let matched: Vec<String> = files
                .clone()
                .filter(|f| **f == entry || (f.starts_with(&prefix) && is_yaml(f)))
                .cloned()
                .collect();
            if matched.is_empty() {
                return Err(RenderError::InvalidDocument {
                    document: KUSTOMIZATION_FILE.to_string(),
                    message: format!("resource '{}' not found in source", entry),
                });
            }
            for file in matched {
                if !resolved.contains(&file) {
                    resolved.push(file);
                }
            }
        }
        Ok(resolved)
    }
}

/// Strategic-merge-style patch keyed by kind, name and (optionally) namespace.
pub fn apply_patch(
    resources: &mut [DesiredResource],
    patch_name: &str,
    patch: &Value,
) -> Result<(), RenderError> {
    let patch_error = |message: String| RenderError::Patch {
        patch: patch_name.to_string(),
        message,
    };

    let kind = patch
        .get("kind")
        .and_then(Value::as_str)
        .ok_or_else(|| patch_error("patch has no kind".to_string()))?;
    let metadata = patch.get("metadata");
    let name = metadata
        .and_then(|m| m.get("name"))
        .and_then(Value::as_str)
        .ok_or_else(|| patch_error("patch has no metadata.name".to_string()))?;
    let namespace = metadata
        .and_then(|m| m.get("namespace"))
        .and_then(Value::as_str);

    let target = resources
        .iter_mut()
        .find(|r| {
            r.kind == kind
                && r.name == name
                && (namespace.is_none() || r.namespace.as_deref() == namespace)
        })
        .ok_or_else(|| patch_error(format!("no resource {}/{} to patch", kind, name)))?;

    let mut document = target.to_document();
    deep_merge(&mut document, patch);
    *target = DesiredResource::from_document(patch_name, document)
        .map_err(|e| patch_error(e.to_string()))?;
    Ok(())
}

pub(crate) fn is_yaml(path: &str) -> bool {
    path.ends_with(".yaml") || path.ends_with(".yml")
}

fn normalize(path: &str) -> String {
    path.trim_start_matches("./").trim_end_matches('/').to_string()
}
