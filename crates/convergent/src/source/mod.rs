//! Retrieval of desired-state bundles from versioned sources.

pub mod git;
pub mod local;
pub mod watcher;

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::error::FetchError;
use crate::target::SourceLocator;

pub use git::GitSource;
pub use local::LocalSource;
pub use watcher::{SourceChangeEvent, SourceWatcher};

/// A raw desired-state bundle: the file tree of one source at one revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceBundle {
    /// Resolved revision (commit id or content digest).
    pub revision: String,
    /// File contents keyed by `/`-separated path relative to the bundle root.
    pub files: BTreeMap<String, String>,
}

impl SourceBundle {
    pub fn new(revision: impl Into<String>, files: BTreeMap<String, String>) -> Self {
        Self {
            revision: revision.into(),
            files,
        }
    }

    /// Reads every non-hidden UTF-8 file below `root`.
    pub fn read_tree(root: &Path) -> Result<BTreeMap<String, String>, FetchError> {
        if !root.is_dir() {
            return Err(FetchError::NotFound(root.display().to_string()));
        }

        let mut files = BTreeMap::new();
        let walker = WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'));

        for entry in walker {
            let entry = entry.map_err(|e| FetchError::Io {
                path: root.display().to_string(),
                message: e.to_string(),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }

            let relative = entry
                .path()
                .strip_prefix(root)
                .unwrap_or(entry.path())
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");

            let bytes = std::fs::read(entry.path()).map_err(|e| FetchError::Io {
                path: entry.path().display().to_string(),
                message: e.to_string(),
            })?;
            match String::from_utf8(bytes) {
                Ok(content) => {
                    files.insert(relative, content);
                }
                Err(_) => tracing::debug!(path = %relative, "Skipping non UTF-8 file"),
            }
        }

        Ok(files)
    }

    /// Stable digest of the bundle contents, used as the revision of
    /// unversioned sources.
    pub fn content_digest(files: &BTreeMap<String, String>) -> String {
        let mut hasher = Sha256::new();
        for (path, content) in files {
            hasher.update(path.as_bytes());
            hasher.update([0u8]);
            hasher.update(content.as_bytes());
            hasher.update([0u8]);
        }
        let digest = hasher.finalize();
        let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        format!("sha256:{}", &hex[..16])
    }
}

/// Retrieves a desired-state bundle from a versioned source.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, locator: &SourceLocator, revision: &str)
        -> Result<SourceBundle, FetchError>;
}

/// Dispatches local paths to [`LocalSource`] and everything else to [`GitSource`].
pub struct RoutingFetcher {
    local: LocalSource,
    git: GitSource,
}

impl RoutingFetcher {
    pub fn new(git: GitSource) -> Self {
        Self {
            local: LocalSource::new(),
            git,
        }
    }
}

#[async_trait]
impl SourceFetcher for RoutingFetcher {
    async fn fetch(
        &self,
        locator: &SourceLocator,
        revision: &str,
    ) -> Result<SourceBundle, FetchError> {
        match locator.local_path() {
            Some(path) if !path.join(".git").exists() => self.local.fetch(locator, revision).await,
            _ => self.git.fetch(locator, revision).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_read_tree_skips_hidden_and_uses_slashes() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("base/nested")).unwrap();
        std::fs::create_dir_all(temp.path().join(".git")).unwrap();
        std::fs::write(temp.path().join("values.yaml"), "a: 1").unwrap();
        std::fs::write(temp.path().join("base/nested/cm.yaml"), "kind: X").unwrap();
        std::fs::write(temp.path().join(".git/HEAD"), "ref").unwrap();
        std::fs::write(temp.path().join(".hidden.yaml"), "x").unwrap();

        let files = SourceBundle::read_tree(temp.path()).unwrap();
        let paths: Vec<_> = files.keys().cloned().collect();
        assert_eq!(paths, vec!["base/nested/cm.yaml", "values.yaml"]);
    }

    #[test]
    fn test_read_tree_missing_root() {
        let err = SourceBundle::read_tree(Path::new("/no/such/bundle")).unwrap_err();
        assert!(matches!(err, FetchError::NotFound(_)));
    }

    #[test]
    fn test_content_digest_changes_with_content() {
        let mut files = BTreeMap::new();
        files.insert("a.yaml".to_string(), "x: 1".to_string());
        let first = SourceBundle::content_digest(&files);
        assert_eq!(first, SourceBundle::content_digest(&files.clone()));

        files.insert("a.yaml".to_string(), "x: 2".to_string());
        assert_ne!(first, SourceBundle::content_digest(&files));
        assert!(first.starts_with("sha256:"));
    }
}
