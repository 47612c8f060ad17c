//! Expands a source bundle into concrete, fully resolved resources.
//!
//! Rendering is a pure function of `(bundle, target)`: documents are parsed
//! into typed trees, expressions are evaluated over those trees, overlays are
//! merged, and the result is sorted into a canonical order.

pub mod expr;
pub mod overlay;
pub mod values;

use std::collections::BTreeSet;

use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::error::RenderError;
use crate::resource::{is_cluster_scoped, kind_rank, DesiredResource, OWNER_LABEL};
use crate::source::SourceBundle;
use crate::target::Target;
use expr::Context;
use overlay::{apply_patch, is_yaml, Kustomization, KUSTOMIZATION_FILE};

pub const VALUES_FILE: &str = "values.yaml";

/// Renders desired resources for a target.
#[derive(Debug, Clone, Default)]
pub struct Renderer;

impl Renderer {
    pub fn new() -> Self {
        Self
    }

    pub fn render(
        &self,
        target: &Target,
        bundle: &SourceBundle,
    ) -> Result<Vec<DesiredResource>, RenderError> {
        let values = self.values(target, bundle)?;
        let context = Context::new(
            values,
            json!({
                "name": target.name,
                "namespace": target.destination.namespace,
                "server": target.destination.server,
            }),
            json!({
                "name": target.name,
                "revision": bundle.revision,
            }),
        );

        let kustomization = match bundle.files.get(KUSTOMIZATION_FILE) {
            Some(content) => Some(parse_kustomization(content)?),
            None => None,
        };

        let resource_files = match &kustomization {
            Some(k) => k.resource_files(bundle.files.keys())?,
            None => bundle
                .files
                .keys()
                .filter(|path| is_yaml(path) && path.as_str() != VALUES_FILE)
                .cloned()
                .collect(),
        };

        let mut resources = Vec::new();
        for path in &resource_files {
            for (document, value) in parse_documents(path, &bundle.files[path])? {
                let value = expr::evaluate_tree(&value, &context)
                    .map_err(|e| e.into_render_error(&document))?;
                resources.push(DesiredResource::from_document(&document, value)?);
            }
        }

        if let Some(k) = &kustomization {
            for patch in &k.patches {
                let path = patch.path().trim_start_matches("./");
                let content = bundle.files.get(path).ok_or_else(|| RenderError::Patch {
                    patch: path.to_string(),
                    message: "patch file not found in source".to_string(),
                })?;
                for (document, value) in parse_documents(path, content)? {
                    let value = expr::evaluate_tree(&value, &context)
                        .map_err(|e| e.into_render_error(&document))?;
                    apply_patch(&mut resources, &document, &value)?;
                }
            }
        }

        let forced_namespace = kustomization.as_ref().and_then(|k| k.namespace.clone());
        let common_labels = kustomization
            .map(|k| k.common_labels)
            .unwrap_or_default();

        let custom_cluster_kinds: BTreeSet<String> = resources
            .iter()
            .filter_map(DesiredResource::cluster_scoped_kind)
            .map(str::to_string)
            .collect();

        for resource in &mut resources {
            if is_cluster_scoped(&resource.kind) || custom_cluster_kinds.contains(&resource.kind) {
                resource.namespace = None;
            } else if let Some(ns) = &forced_namespace {
                resource.namespace = Some(ns.clone());
            } else if resource.namespace.is_none() {
                resource.namespace = Some(target.destination.namespace.clone());
            }

            for (key, value) in &common_labels {
                resource.labels.insert(key.clone(), value.clone());
            }
            resource
                .labels
                .insert(OWNER_LABEL.to_string(), target.name.clone());
        }

        let mut seen = BTreeSet::new();
        for resource in &resources {
            if !seen.insert(resource.key()) {
                return Err(RenderError::DuplicateIdentity(resource.key().to_string()));
            }
        }

        resources.sort_by(|a, b| {
            (kind_rank(&a.kind), a.key()).cmp(&(kind_rank(&b.kind), b.key()))
        });

        tracing::debug!(
            target = %target.name,
            revision = %bundle.revision,
            resources = resources.len(),
            "Rendered desired state"
        );
        Ok(resources)
    }

    /// `values.yaml` defaults with the target's parameters merged on top.
    fn values(&self, target: &Target, bundle: &SourceBundle) -> Result<Value, RenderError> {
        let mut values = match bundle.files.get(VALUES_FILE) {
            Some(content) => {
                let parsed: Value =
                    serde_yaml::from_str(content).map_err(|e| RenderError::Parse {
                        document: VALUES_FILE.to_string(),
                        message: e.to_string(),
                    })?;
                match parsed {
                    Value::Null => Value::Object(Map::new()),
                    Value::Object(_) => parsed,
                    _ => {
                        return Err(RenderError::InvalidDocument {
                            document: VALUES_FILE.to_string(),
                            message: "values must be a mapping".to_string(),
                        })
                    }
                }
            }
            None => Value::Object(Map::new()),
        };
        values::deep_merge(&mut values, &Value::Object(target.parameters.clone()));
        Ok(values)
    }
}

fn parse_kustomization(content: &str) -> Result<Kustomization, RenderError> {
    serde_yaml::from_str::<Option<Kustomization>>(content)
        .map(Option::unwrap_or_default)
        .map_err(|e| RenderError::Parse {
            document: KUSTOMIZATION_FILE.to_string(),
            message: e.to_string(),
        })
}

/// Splits a multi-document file; documents are named `path#index`.
fn parse_documents(path: &str, content: &str) -> Result<Vec<(String, Value)>, RenderError> {
    let mut documents = Vec::new();
    for (index, document) in serde_yaml::Deserializer::from_str(content).enumerate() {
        let name = if index == 0 {
            path.to_string()
        } else {
            format!("{}#{}", path, index)
        };
        let value = Value::deserialize(document).map_err(|e| RenderError::Parse {
            document: name.clone(),
            message: e.to_string(),
        })?;
        if !value.is_null() {
            documents.push((name, value));
        }
    }
    Ok(documents)
}
