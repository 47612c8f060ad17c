//! Git-backed sources.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::process::Command;
use tokio::sync::Mutex;

use super::{SourceBundle, SourceFetcher};
use crate::error::{classify_git_error, FetchError};
use crate::target::SourceLocator;

/// Maximum number of retries for transient errors.
const MAX_RETRIES: u32 = 3;
/// Base delay for exponential backoff.
const RETRY_BASE_DELAY: Duration = Duration::from_secs(2);
/// Timeout for a single git invocation.
const GIT_TIMEOUT: Duration = Duration::from_secs(120);

/// Fetches bundles from git repositories, keeping one cached checkout per
/// repository URL under a work directory.
pub struct GitSource {
    work_dir: PathBuf,
    retry_base_delay: Duration,
    timeout: Duration,
    /// Serializes operations on the same checkout.
    repo_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl GitSource {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            retry_base_delay: RETRY_BASE_DELAY,
            timeout: GIT_TIMEOUT,
            repo_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Cache directory for a repository URL.
    pub fn checkout_dir(&self, repo_url: &str) -> PathBuf {
        let digest = Sha256::digest(repo_url.as_bytes());
        let name: String = digest.iter().take(8).map(|b| format!("{:02x}", b)).collect();
        self.work_dir.join(name)
    }

    async fn repo_lock(&self, repo_url: &str) -> Arc<Mutex<()>> {
        let mut locks = self.repo_locks.lock().await;
        Arc::clone(locks.entry(repo_url.to_string()).or_default())
    }

    /// Brings the cached checkout up to date and detaches it at `revision`.
    /// Returns the resolved commit id.
    async fn sync_checkout(&self, repo_url: &str, revision: &str) -> Result<String, FetchError> {
        let checkout = self.checkout_dir(repo_url);

        if checkout.join(".git").exists() {
            self.run_git(&checkout, &["fetch", "--prune", "--tags", "--force", "origin"])
                .await?;
        } else {
            tokio::fs::create_dir_all(&self.work_dir)
                .await
                .map_err(|e| FetchError::Io {
                    path: self.work_dir.display().to_string(),
                    message: e.to_string(),
                })?;
            let target = checkout.to_string_lossy().into_owned();
            let result = self
                .run_git(&self.work_dir, &["clone", "--no-checkout", repo_url, &target])
                .await;
            if let Err(e) = result {
                // A half-written clone would be mistaken for a cache hit next time
                let _ = tokio::fs::remove_dir_all(&checkout).await;
                return Err(e);
            }
        }

        let commit = self.resolve(&checkout, revision).await?;
        self.run_git(&checkout, &["checkout", "--force", "--detach", &commit])
            .await?;
        Ok(commit)
    }

    /// Resolves a branch, tag or commit reference to a commit id.
    async fn resolve(&self, checkout: &Path, revision: &str) -> Result<String, FetchError> {
        let candidates = [format!("origin/{}", revision), revision.to_string()];
        for candidate in &candidates {
            let spec = format!("{}^{{commit}}", candidate);
            if let Ok(output) = self
                .run_git(checkout, &["rev-parse", "--verify", "--quiet", &spec])
                .await
            {
                let commit = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if !commit.is_empty() {
                    return Ok(commit);
                }
            }
        }
        Err(FetchError::NotFound(format!("unknown revision '{}'", revision)))
    }

    async fn run_git(&self, dir: &Path, args: &[&str]) -> Result<Output, FetchError> {
        log::debug!("git {} (in {})", args.join(" "), dir.display());

        let mut cmd = Command::new("git");
        cmd.current_dir(dir)
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| FetchError::Timeout(self.timeout.as_secs()))?
            .map_err(|e| FetchError::Git(e.to_string()))?;

        if output.status.success() {
            Ok(output)
        } else {
            Err(classify_git_error(&format_git_error(&output)))
        }
    }
}

#[async_trait]
impl SourceFetcher for GitSource {
    /// Retries transient errors (network, timeout) with exponential backoff.
    async fn fetch(
        &self,
        locator: &SourceLocator,
        revision: &str,
    ) -> Result<SourceBundle, FetchError> {
        let lock = self.repo_lock(&locator.repo_url).await;
        let _guard = lock.lock().await;

        let mut attempt = 0;
        let commit = loop {
            if attempt > 0 {
                let delay = self.retry_base_delay * (1 << (attempt - 1));
                log::info!(
                    "Retrying fetch of {} (attempt {}/{}) after {:?}",
                    locator.repo_url,
                    attempt + 1,
                    MAX_RETRIES + 1,
                    delay
                );
                tokio::time::sleep(delay).await;
            }

            match self.sync_checkout(&locator.repo_url, revision).await {
                Ok(commit) => break commit,
                Err(e) if e.is_retryable() && attempt < MAX_RETRIES => {
                    log::warn!("Fetch of {} failed with retryable error: {}", locator.repo_url, e);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        };

        let checkout = self.checkout_dir(&locator.repo_url);
        let root = if locator.path.is_empty() {
            checkout
        } else {
            checkout.join(&locator.path)
        };
        let files = tokio::task::spawn_blocking(move || SourceBundle::read_tree(&root))
            .await
            .map_err(|e| FetchError::Git(e.to_string()))??;

        log::info!(
            "Fetched {} at {} ({} files)",
            locator,
            &commit[..commit.len().min(12)],
            files.len()
        );
        Ok(SourceBundle::new(commit, files))
    }
}

/// Formats a git error with both stdout and stderr.
fn format_git_error(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();

    match (stderr.is_empty(), stdout.is_empty()) {
        (true, true) => format!(
            "Command failed with exit code {}",
            output.status.code().unwrap_or(-1)
        ),
        (true, false) => stdout,
        (false, true) => stderr,
        (false, false) => format!("{}\n{}", stderr, stdout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn git(dir: &Path, args: &[&str]) {
        let status = std::process::Command::new("git")
            .current_dir(dir)
            .args(["-c", "user.name=test", "-c", "user.email=test@example.com"])
            .args(args)
            .output()
            .unwrap();
        assert!(status.status.success(), "git {:?} failed: {:?}", args, status);
    }

    fn commit_file(repo: &Path, path: &str, content: &str, message: &str) {
        let full = repo.join(path);
        std::fs::create_dir_all(full.parent().unwrap()).unwrap();
        std::fs::write(full, content).unwrap();
        git(repo, &["add", "."]);
        git(repo, &["commit", "-q", "-m", message]);
    }

    fn setup_origin() -> TempDir {
        let origin = TempDir::new().unwrap();
        git(origin.path(), &["init", "-q"]);
        commit_file(origin.path(), "apps/web/cm.yaml", "replicas: 1\n", "first");
        git(origin.path(), &["branch", "-M", "main"]);
        git(origin.path(), &["tag", "v1"]);
        commit_file(origin.path(), "apps/web/cm.yaml", "replicas: 2\n", "second");
        origin
    }

    fn locator(origin: &TempDir) -> SourceLocator {
        SourceLocator {
            repo_url: origin.path().display().to_string(),
            path: "apps/web".to_string(),
        }
    }

    #[tokio::test]
    async fn test_fetch_branch_and_tag() {
        let origin = setup_origin();
        let work = TempDir::new().unwrap();
        let source = GitSource::new(work.path());

        let head = source.fetch(&locator(&origin), "main").await.unwrap();
        assert_eq!(head.files.get("cm.yaml").unwrap(), "replicas: 2\n");
        assert_eq!(head.revision.len(), 40);

        let tagged = source.fetch(&locator(&origin), "v1").await.unwrap();
        assert_eq!(tagged.files.get("cm.yaml").unwrap(), "replicas: 1\n");
        assert_ne!(head.revision, tagged.revision);
    }

    #[tokio::test]
    async fn test_fetch_picks_up_new_commits() {
        let origin = setup_origin();
        let work = TempDir::new().unwrap();
        let source = GitSource::new(work.path());

        let first = source.fetch(&locator(&origin), "main").await.unwrap();
        commit_file(origin.path(), "apps/web/cm.yaml", "replicas: 3\n", "third");
        let second = source.fetch(&locator(&origin), "main").await.unwrap();

        assert_ne!(first.revision, second.revision);
        assert_eq!(second.files.get("cm.yaml").unwrap(), "replicas: 3\n");
    }

    #[tokio::test]
    async fn test_unknown_revision_is_not_found() {
        let origin = setup_origin();
        let work = TempDir::new().unwrap();
        let source = GitSource::new(work.path());

        let err = source
            .fetch(&locator(&origin), "does-not-exist")
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_missing_repository_is_not_retried() {
        let work = TempDir::new().unwrap();
        let source = GitSource::new(work.path()).with_retry_base_delay(Duration::from_millis(1));
        let locator = SourceLocator {
            repo_url: work.path().join("missing").display().to_string(),
            path: String::new(),
        };

        let err = source.fetch(&locator, "main").await.unwrap_err();
        assert!(!err.is_retryable());
        assert!(!source.checkout_dir(&locator.repo_url).exists());
    }
}
