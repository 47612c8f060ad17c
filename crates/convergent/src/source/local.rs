//! Unversioned directory sources.

use async_trait::async_trait;

use super::{SourceBundle, SourceFetcher};
use crate::error::FetchError;
use crate::target::SourceLocator;

/// Reads a bundle straight from a local directory.
///
/// A directory has no history, so the revision reference is ignored and the
/// resolved revision is a digest of the file contents.
#[derive(Debug, Clone, Default)]
pub struct LocalSource;

impl LocalSource {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SourceFetcher for LocalSource {
    async fn fetch(
        &self,
        locator: &SourceLocator,
        _revision: &str,
    ) -> Result<SourceBundle, FetchError> {
        let root = locator
            .local_path()
            .ok_or_else(|| FetchError::NotFound(format!("{} is not a local path", locator)))?;
        let dir = if locator.path.is_empty() {
            root
        } else {
            root.join(&locator.path)
        };

        let files = tokio::task::spawn_blocking(move || SourceBundle::read_tree(&dir))
            .await
            .map_err(|e| FetchError::Io {
                path: locator.to_string(),
                message: e.to_string(),
            })??;

        let revision = SourceBundle::content_digest(&files);
        tracing::debug!(source = %locator, %revision, files = files.len(), "Read local source");
        Ok(SourceBundle::new(revision, files))
    }
}
