//! Loads Target and Settings manifests from a configuration directory.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use serde::Deserialize;
use walkdir::WalkDir;

use super::resource::{
    AnyManifest, ManifestHeader, ManifestKind, ManifestWithPath, SettingsManifest,
    TargetManifest, API_VERSION,
};
use super::settings::ControllerSettings;
use crate::error::ConfigError;
use crate::target::Target;

const SCHEMA_JSON: &str = include_str!("../../schema/target-v1.json");

static SCHEMA: LazyLock<Result<jsonschema::Validator, String>> = LazyLock::new(|| {
    let schema: serde_json::Value = serde_json::from_str(SCHEMA_JSON)
        .map_err(|e| format!("Invalid embedded schema JSON: {}", e))?;
    jsonschema::validator_for(&schema).map_err(|e| format!("Failed to compile JSON schema: {}", e))
});

/// Manifests loaded from the config directory.
#[derive(Debug, Clone, Default)]
pub struct LoadedTargets {
    /// The optional settings manifest.
    pub settings: Option<ManifestWithPath<SettingsManifest>>,
    /// Target manifests sorted by name.
    pub targets: Vec<ManifestWithPath<TargetManifest>>,
}

impl LoadedTargets {
    /// Controller settings, falling back to defaults when no Settings manifest exists.
    pub fn controller_settings(&self) -> ControllerSettings {
        self.settings
            .as_ref()
            .map(|s| s.manifest.spec.clone())
            .unwrap_or_default()
    }

    /// Runtime targets in name order.
    pub fn to_targets(&self) -> Vec<Target> {
        self.targets.iter().map(|t| t.manifest.to_target()).collect()
    }
}

/// Configuration loader for target manifests.
pub struct TargetLoader {
    config_dir: PathBuf,
}

impl TargetLoader {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Loads every manifest below the config directory.
    pub fn load(&self) -> Result<LoadedTargets, ConfigError> {
        if !self.config_dir.exists() {
            return Err(ConfigError::ConfigDirNotFound(self.config_dir.clone()));
        }

        let mut loaded = LoadedTargets::default();

        for entry in WalkDir::new(&self.config_dir)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter()
        {
            let entry = entry.map_err(|e| ConfigError::ReadDirectory {
                path: self.config_dir.clone(),
                source: e.into(),
            })?;
            let path = entry.path();

            if !path.is_file() {
                continue;
            }

            // Skip hidden files and anything under a hidden directory
            if let Ok(relative) = path.strip_prefix(&self.config_dir) {
                let has_hidden_component = relative.components().any(|c| {
                    c.as_os_str()
                        .to_str()
                        .map(|s| s.starts_with('.'))
                        .unwrap_or(false)
                });
                if has_hidden_component {
                    continue;
                }
            }

            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
            if ext != "yaml" && ext != "yml" {
                continue;
            }

            let relative_path = path
                .strip_prefix(&self.config_dir)
                .unwrap_or(path)
                .to_path_buf();

            let manifests = self.load_file(path).inspect_err(|e| {
                log::warn!("Failed to load {}: {}", path.display(), e);
            })?;

            for manifest in manifests {
                match manifest {
                    AnyManifest::Settings(m) => {
                        if let Some(existing) = &loaded.settings {
                            return Err(ConfigError::DuplicateName {
                                kind: "Settings".to_string(),
                                name: format!("{} and {}", existing.manifest.name(), m.name()),
                            });
                        }
                        loaded.settings = Some(ManifestWithPath::new(m, relative_path.clone()));
                    }
                    AnyManifest::Target(m) => {
                        if loaded
                            .targets
                            .iter()
                            .any(|t| t.manifest.metadata.name == m.metadata.name)
                        {
                            return Err(ConfigError::DuplicateName {
                                kind: "Target".to_string(),
                                name: m.metadata.name.clone(),
                            });
                        }
                        loaded
                            .targets
                            .push(ManifestWithPath::new(m, relative_path.clone()));
                    }
                }
            }
        }

        loaded
            .targets
            .sort_by(|a, b| a.manifest.metadata.name.cmp(&b.manifest.metadata.name));

        log::info!(
            "Loaded {} target(s) from {}",
            loaded.targets.len(),
            self.config_dir.display()
        );

        Ok(loaded)
    }

    /// Loads all manifests in a single (possibly multi-document) file.
    pub fn load_file(&self, path: &Path) -> Result<Vec<AnyManifest>, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;

        self.parse_manifests(&content, path)
    }

    /// Parses every YAML document in `content`.
    pub fn parse_manifests(&self, content: &str, path: &Path) -> Result<Vec<AnyManifest>, ConfigError> {
        let mut manifests = Vec::new();
        for document in serde_yaml::Deserializer::from_str(content) {
            let value =
                serde_json::Value::deserialize(document).map_err(|e| ConfigError::ParseYaml {
                    path: path.to_path_buf(),
                    message: e.to_string(),
                })?;
            if value.is_null() {
                continue;
            }
            manifests.push(self.parse_manifest(value, path)?);
        }
        Ok(manifests)
    }

    /// Parses one manifest document after schema validation.
    pub fn parse_manifest(
        &self,
        value: serde_json::Value,
        path: &Path,
    ) -> Result<AnyManifest, ConfigError> {
        let parse_error = |e: serde_json::Error| ConfigError::ParseYaml {
            path: path.to_path_buf(),
            message: e.to_string(),
        };

        // Check the header first so a wrong apiVersion gets a precise error
        let header: ManifestHeader = serde_json::from_value(value.clone()).map_err(parse_error)?;
        if header.api_version != API_VERSION {
            return Err(ConfigError::InvalidApiVersion {
                version: header.api_version,
                expected: API_VERSION.to_string(),
            });
        }

        validate_schema(&value, path)?;

        match header.kind {
            ManifestKind::Settings => Ok(AnyManifest::Settings(
                serde_json::from_value(value).map_err(parse_error)?,
            )),
            ManifestKind::Target => Ok(AnyManifest::Target(
                serde_json::from_value(value).map_err(parse_error)?,
            )),
        }
    }
}

fn validate_schema(value: &serde_json::Value, path: &Path) -> Result<(), ConfigError> {
    let validator = SCHEMA.as_ref().map_err(|e| ConfigError::Validation(e.clone()))?;

    let error_messages: Vec<String> = validator.iter_errors(value).map(|e| e.to_string()).collect();
    if !error_messages.is_empty() {
        return Err(ConfigError::SchemaValidation {
            path: path.to_path_buf(),
            errors: error_messages.join("; "),
        });
    }

    Ok(())
}
