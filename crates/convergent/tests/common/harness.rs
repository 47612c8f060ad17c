#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use convergent::{
    Controller, ControllerSettings, CyclePhase, InMemoryCluster, LiveStateReader, LocalSource,
    ObservedResource, SourceFetcher, StatusBoard, SyncEvent, Target, TargetReconciler,
};
use tempfile::TempDir;
use tokio::sync::broadcast;

use super::builders::TargetBuilder;

/// How long a test waits for a cycle before giving up.
pub const CYCLE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct TestHarness {
    pub temp_dir: TempDir,
    pub source_dir: PathBuf,
    pub config_dir: PathBuf,
    pub cluster: Arc<InMemoryCluster>,
}

impl TestHarness {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let source_dir = temp_dir.path().join("source");
        let config_dir = temp_dir.path().join("config");

        fs::create_dir_all(&source_dir).expect("Failed to create source dir");
        fs::create_dir_all(&config_dir).expect("Failed to create config dir");

        Self {
            temp_dir,
            source_dir,
            config_dir,
            cluster: Arc::new(InMemoryCluster::new()),
        }
    }

    pub fn write_source(&self, relative: &str, content: &str) -> PathBuf {
        write_file(&self.source_dir, relative, content)
    }

    pub fn remove_source(&self, relative: &str) {
        fs::remove_file(self.source_dir.join(relative)).expect("Failed to remove source file");
    }

    pub fn write_config(&self, relative: &str, content: &str) -> PathBuf {
        write_file(&self.config_dir, relative, content)
    }

    /// A target reading from this harness's source directory.
    pub fn target(&self, name: &str) -> TargetBuilder {
        TargetBuilder::new(name, self.source_dir.to_string_lossy())
    }

    /// A standalone reconciler over the local source and in-memory cluster.
    pub fn reconciler(&self, target: Target) -> TargetReconciler {
        let settings = fast_settings();
        let reader = Arc::new(LiveStateReader::new(
            self.cluster.clone(),
            settings.live_cache_ttl(),
        ));
        TargetReconciler::new(
            target,
            Arc::new(LocalSource::new()),
            reader,
            Arc::new(settings),
            StatusBoard::default(),
        )
    }

    pub fn controller(&self) -> Arc<Controller> {
        self.controller_with(Arc::new(LocalSource::new()))
    }

    pub fn controller_with(&self, fetcher: Arc<dyn SourceFetcher>) -> Arc<Controller> {
        Arc::new(Controller::new(
            fast_settings(),
            fetcher,
            self.cluster.clone(),
        ))
    }

    /// Creates a namespace owned by nobody, as a cluster admin would.
    pub async fn seed_namespace(&self, name: &str) {
        self.cluster
            .insert(ObservedResource {
                api_version: "v1".into(),
                kind: "Namespace".into(),
                namespace: None,
                name: name.into(),
                labels: Default::default(),
                annotations: Default::default(),
                spec: Default::default(),
                resource_version: 0,
                generation: 1,
                status: None,
            })
            .await;
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Settings that keep tests quick: no scheduled ticks after the first,
/// millisecond retries and short readiness waits.
pub fn fast_settings() -> ControllerSettings {
    ControllerSettings {
        sync_interval: 3600,
        worker_count: 4,
        retry_base_delay_ms: 1,
        retry_max_delay_ms: 5,
        readiness_timeout_secs: 1,
        readiness_poll_ms: 10,
        history_limit: 10,
        live_cache_ttl_secs: 60,
    }
}

/// Waits for the next finished cycle of `target`.
pub async fn next_cycle(events: &mut broadcast::Receiver<SyncEvent>, target: &str) -> SyncEvent {
    wait_for(events, |event| event.target == target && is_terminal(event.phase)).await
}

/// Waits for the first event matching `predicate`.
pub async fn wait_for<F>(events: &mut broadcast::Receiver<SyncEvent>, predicate: F) -> SyncEvent
where
    F: Fn(&SyncEvent) -> bool,
{
    tokio::time::timeout(CYCLE_TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("status stream closed"),
            }
        }
    })
    .await
    .expect("Timed out waiting for status event")
}

pub fn is_terminal(phase: CyclePhase) -> bool {
    matches!(
        phase,
        CyclePhase::Synced | CyclePhase::OutOfSync | CyclePhase::Degraded | CyclePhase::Error
    )
}

fn write_file(root: &Path, relative: &str, content: &str) -> PathBuf {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("Failed to create parent dir");
    }
    fs::write(&path, content).expect("Failed to write file");
    path
}
