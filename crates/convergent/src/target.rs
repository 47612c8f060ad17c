//! The deployable unit managed by the reconciler.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Where a target's desired state is read from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceLocator {
    /// Repository URL, or `file://`/plain path for a local directory.
    #[serde(rename = "repoURL")]
    pub repo_url: String,

    /// Directory inside the repository holding the manifests.
    #[serde(default)]
    pub path: String,
}

impl SourceLocator {
    /// Returns the local directory for `file://` and plain-path locators.
    pub fn local_path(&self) -> Option<std::path::PathBuf> {
        if let Some(rest) = self.repo_url.strip_prefix("file://") {
            return Some(std::path::PathBuf::from(rest));
        }
        if self.repo_url.contains("://") || self.repo_url.contains('@') {
            return None;
        }
        Some(std::path::PathBuf::from(&self.repo_url))
    }
}

impl std::fmt::Display for SourceLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.repo_url)
        } else {
            write!(f, "{}//{}", self.repo_url, self.path)
        }
    }
}

/// Cluster endpoint and namespace a target deploys into.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Destination {
    pub server: String,
    pub namespace: String,
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.server, self.namespace)
    }
}

/// Governs what the reconciler may do for a target without a human.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPolicy {
    #[serde(default)]
    pub automated: bool,

    #[serde(default)]
    pub prune: bool,

    #[serde(default)]
    pub self_heal: bool,

    /// Retries per action after the first attempt.
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,

    #[serde(default)]
    pub create_namespace: bool,

    /// Replaced identities may be deleted without waiting for readiness.
    #[serde(default)]
    pub replace: bool,
}

fn default_retry_limit() -> u32 {
    3
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            automated: false,
            prune: false,
            self_heal: false,
            retry_limit: default_retry_limit(),
            create_namespace: false,
            replace: false,
        }
    }
}

/// One deployable unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    pub name: String,
    pub source: SourceLocator,
    /// Branch, tag or commit. Re-resolved every cycle.
    pub revision: String,
    pub destination: Destination,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub policy: SyncPolicy,
}

impl Target {
    pub fn new(
        name: impl Into<String>,
        source: SourceLocator,
        revision: impl Into<String>,
        destination: Destination,
    ) -> Self {
        Self {
            name: name.into(),
            source,
            revision: revision.into(),
            destination,
            parameters: Map::new(),
            policy: SyncPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: SyncPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    /// The `(source, destination)` pair that must be unique across targets.
    pub fn placement(&self) -> (&SourceLocator, &Destination) {
        (&self.source, &self.destination)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_policy_defaults() {
        let policy: SyncPolicy = serde_yaml::from_str("automated: true").unwrap();
        assert!(policy.automated);
        assert!(!policy.prune);
        assert!(!policy.self_heal);
        assert_eq!(policy.retry_limit, 3);
    }

    #[test]
    fn test_local_path() {
        let file = SourceLocator {
            repo_url: "file:///srv/manifests".into(),
            path: String::new(),
        };
        assert_eq!(
            file.local_path(),
            Some(std::path::PathBuf::from("/srv/manifests"))
        );

        let remote = SourceLocator {
            repo_url: "https://git.example.com/org/deploy.git".into(),
            path: "apps/web".into(),
        };
        assert_eq!(remote.local_path(), None);
        assert_eq!(
            remote.to_string(),
            "https://git.example.com/org/deploy.git//apps/web"
        );

        let scp = SourceLocator {
            repo_url: "git@example.com:org/deploy.git".into(),
            path: String::new(),
        };
        assert_eq!(scp.local_path(), None);
    }
}
