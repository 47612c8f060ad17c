//! Cross-target validation for loaded configuration.

use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use super::loader::LoadedTargets;
use super::resource::TargetManifest;
use super::settings::ControllerSettings;
use crate::error::ConfigError;

// DNS-1123 label, the shape names take in the target system
static RE_DNS_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]{0,61}[a-z0-9])?$").unwrap());

/// Upper bound on per-action retries.
pub const MAX_RETRY_LIMIT: u32 = 10;

/// Validator for target configuration.
pub struct TargetValidator {
    errors: Vec<String>,
}

impl TargetValidator {
    pub fn new() -> Self {
        Self { errors: Vec::new() }
    }

    /// Validates all loaded manifests, reporting every problem at once.
    pub fn validate(&mut self, loaded: &LoadedTargets) -> Result<(), ConfigError> {
        self.errors.clear();

        self.validate_settings(&loaded.controller_settings());

        for target in &loaded.targets {
            self.validate_target(&target.manifest);
        }

        self.validate_unique_placement(loaded);

        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(self.errors.join("; ")))
        }
    }

    fn validate_settings(&mut self, settings: &ControllerSettings) {
        if settings.sync_interval == 0 {
            self.errors
                .push("Settings: syncInterval must be greater than 0".to_string());
        }

        if settings.worker_count == 0 {
            self.errors
                .push("Settings: workerCount must be greater than 0".to_string());
        }

        if settings.history_limit == 0 {
            self.errors
                .push("Settings: historyLimit must be greater than 0".to_string());
        }

        if settings.retry_max_delay_ms < settings.retry_base_delay_ms {
            self.errors.push(
                "Settings: retryMaxDelayMs must not be smaller than retryBaseDelayMs".to_string(),
            );
        }
    }

    fn validate_target(&mut self, target: &TargetManifest) {
        let name = &target.metadata.name;

        if !RE_DNS_LABEL.is_match(name) {
            self.errors.push(format!(
                "Target '{}': name must be a lowercase DNS label (letters, digits, hyphens)",
                name
            ));
        }

        let spec = &target.spec;
        if spec.source.repo_url.trim().is_empty() {
            self.errors
                .push(format!("Target '{}': source.repoURL is required", name));
        }

        if spec.source.path.split('/').any(|part| part == "..") {
            self.errors.push(format!(
                "Target '{}': source.path must not escape the repository",
                name
            ));
        }

        if spec.destination.server.trim().is_empty() {
            self.errors
                .push(format!("Target '{}': destination.server is required", name));
        }

        if !RE_DNS_LABEL.is_match(&spec.destination.namespace) {
            self.errors.push(format!(
                "Target '{}': destination.namespace '{}' is not a valid namespace name",
                name, spec.destination.namespace
            ));
        }

        if spec.sync_policy.retry_limit > MAX_RETRY_LIMIT {
            self.errors.push(format!(
                "Target '{}': syncPolicy.retryLimit must be at most {}",
                name, MAX_RETRY_LIMIT
            ));
        }

        if spec.sync_policy.self_heal && !spec.sync_policy.automated {
            self.errors.push(format!(
                "Target '{}': syncPolicy.selfHeal requires automated sync",
                name
            ));
        }
    }

    /// Each (source locator, destination) pair may be managed by only one target.
    fn validate_unique_placement(&mut self, loaded: &LoadedTargets) {
        let mut seen: HashMap<(String, String, String, String), &str> = HashMap::new();
        let mut reported = HashSet::new();

        for target in &loaded.targets {
            let spec = &target.manifest.spec;
            let placement = (
                spec.source.repo_url.clone(),
                spec.source.path.clone(),
                spec.destination.server.clone(),
                spec.destination.namespace.clone(),
            );
            let name = target.manifest.name();
            if let Some(first) = seen.get(&placement) {
                if reported.insert(placement.clone()) {
                    self.errors.push(format!(
                        "Targets '{}' and '{}' share source '{}' and destination '{}/{}'",
                        first, name, placement.0, placement.2, placement.3
                    ));
                }
            } else {
                seen.insert(placement, name);
            }
        }
    }
}

impl Default for TargetValidator {
    fn default() -> Self {
        Self::new()
    }
}
