//! Control loop behaviour: triggers, drift handling and shutdown.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use common::harness::{is_terminal, next_cycle, wait_for};
use common::*;
use convergent::{
    ConvergentError, CyclePhase, DriftEvent, FetchError, LocalSource, ResourceKey, SourceBundle,
    SourceChangeEvent, SourceFetcher, SourceLocator, Stage, SyncPolicy, SyncStatus, Trigger,
};
use serde_json::json;
use tokio::sync::{broadcast, Semaphore};

fn deployment_key() -> ResourceKey {
    ResourceKey::new("Deployment", Some("apps"), "api")
}

async fn scale_live(harness: &TestHarness, replicas: u32) {
    let changed = harness
        .cluster
        .mutate(&deployment_key(), |object| {
            if let Some(spec) = object.spec.get_mut("spec") {
                spec["replicas"] = json!(replicas);
            }
        })
        .await;
    assert!(changed);
}

async fn live_replicas(harness: &TestHarness) -> serde_json::Value {
    harness
        .cluster
        .object(&deployment_key())
        .await
        .unwrap()
        .spec["spec"]["replicas"]
        .clone()
}

fn source_change(target: &str, path: &str) -> SourceChangeEvent {
    SourceChangeEvent {
        target: target.to_string(),
        path: path.to_string(),
        detected_at: Utc::now(),
    }
}

#[tokio::test]
async fn test_register_runs_initial_cycle() {
    let harness = TestHarness::new();
    harness.seed_namespace("apps").await;
    harness.write_source("api.yaml", &deployment_yaml("api", 2));
    let controller = harness.controller();
    let mut events = controller.subscribe();

    controller
        .register(harness.target("web").build())
        .await
        .unwrap();
    let event = next_cycle(&mut events, "web").await;
    assert_eq!(event.phase, CyclePhase::Synced);
    assert_eq!(event.message, "1 applied, 0 unchanged, 0 out of sync");

    let status = controller.status("web").await.unwrap();
    assert_eq!(status.phase, CyclePhase::Synced);
    assert_eq!(status.history_len, 1);
    let current = status.current.unwrap();
    assert_eq!(current.trigger, Trigger::Scheduled);
    assert_eq!(current.cycle_id, event.cycle_id.unwrap());

    controller.shutdown().await;
}

#[tokio::test]
async fn test_manual_policy_waits_for_sync_now() {
    let harness = TestHarness::new();
    harness.seed_namespace("apps").await;
    harness.write_source("api.yaml", &deployment_yaml("api", 2));
    let controller = harness.controller();
    let mut events = controller.subscribe();

    controller
        .register(harness.target("web").policy(manual()).build())
        .await
        .unwrap();
    assert_eq!(
        next_cycle(&mut events, "web").await.phase,
        CyclePhase::OutOfSync
    );
    assert!(harness.cluster.object(&deployment_key()).await.is_none());

    controller.sync_now("web").await.unwrap();
    assert_eq!(next_cycle(&mut events, "web").await.phase, CyclePhase::Synced);
    assert_eq!(live_replicas(&harness).await, json!(2));

    let current = controller.status("web").await.unwrap().current.unwrap();
    assert_eq!(current.trigger, Trigger::Manual);
    controller.shutdown().await;
}

#[tokio::test]
async fn test_drift_is_healed_with_self_heal() {
    let harness = TestHarness::new();
    harness.seed_namespace("apps").await;
    harness.write_source("api.yaml", &deployment_yaml("api", 2));
    let controller = harness.controller();
    let mut events = controller.subscribe();
    let policy = SyncPolicy {
        self_heal: true,
        ..automated()
    };

    controller
        .register(harness.target("web").policy(policy).build())
        .await
        .unwrap();
    assert_eq!(next_cycle(&mut events, "web").await.phase, CyclePhase::Synced);

    scale_live(&harness, 9).await;
    assert!(controller.notify_drift(DriftEvent::now("web")).await.unwrap());
    assert_eq!(next_cycle(&mut events, "web").await.phase, CyclePhase::Synced);
    assert_eq!(live_replicas(&harness).await, json!(2));

    let current = controller.status("web").await.unwrap().current.unwrap();
    assert_eq!(current.trigger, Trigger::Drift);
    assert_eq!(current.applied(), 1);
    controller.shutdown().await;
}

#[tokio::test]
async fn test_drift_waits_for_schedule_without_self_heal() {
    let harness = TestHarness::new();
    harness.seed_namespace("apps").await;
    harness.write_source("api.yaml", &deployment_yaml("api", 2));
    let controller = harness.controller();
    let mut events = controller.subscribe();

    controller
        .register(harness.target("web").build())
        .await
        .unwrap();
    next_cycle(&mut events, "web").await;

    scale_live(&harness, 9).await;
    assert!(!controller.notify_drift(DriftEvent::now("web")).await.unwrap());
    assert_eq!(live_replicas(&harness).await, json!(9));
    assert_eq!(controller.status("web").await.unwrap().history_len, 1);
    controller.shutdown().await;
}

#[tokio::test]
async fn test_source_change_triggers_cycle() {
    let harness = TestHarness::new();
    harness.seed_namespace("apps").await;
    harness.write_source("api.yaml", &deployment_yaml("api", 2));
    let controller = harness.controller();
    let mut events = controller.subscribe();

    controller
        .register(harness.target("web").build())
        .await
        .unwrap();
    next_cycle(&mut events, "web").await;

    harness.write_source("flags.yaml", &config_map_yaml("flags", "beta"));
    controller
        .source_changed(source_change("web", "flags.yaml"))
        .await
        .unwrap();
    assert_eq!(next_cycle(&mut events, "web").await.phase, CyclePhase::Synced);

    let flags = ResourceKey::new("ConfigMap", Some("apps"), "flags");
    assert!(harness.cluster.object(&flags).await.is_some());
    let current = controller.status("web").await.unwrap().current.unwrap();
    assert_eq!(current.trigger, Trigger::SourceChange);
    controller.shutdown().await;
}

#[tokio::test]
async fn test_follow_sources_forwards_watcher_events() {
    let harness = TestHarness::new();
    harness.seed_namespace("apps").await;
    harness.write_source("api.yaml", &deployment_yaml("api", 2));
    let controller = harness.controller();
    let mut events = controller.subscribe();
    let (sender, receiver) = broadcast::channel(8);
    let follower = controller.follow_sources(receiver);

    controller
        .register(harness.target("web").build())
        .await
        .unwrap();
    next_cycle(&mut events, "web").await;

    harness.write_source("api.yaml", &deployment_yaml("api", 4));
    sender.send(source_change("web", "api.yaml")).unwrap();
    assert_eq!(next_cycle(&mut events, "web").await.phase, CyclePhase::Synced);
    assert_eq!(live_replicas(&harness).await, json!(4));

    drop(sender);
    follower.await.unwrap();
    controller.shutdown().await;
}

#[tokio::test]
async fn test_targets_are_isolated() {
    let harness = TestHarness::new();
    harness.seed_namespace("apps").await;
    harness.write_source("good/api.yaml", &deployment_yaml("api", 2));
    harness.write_source("bad/broken.yaml", "kind: [unclosed");
    let controller = harness.controller();
    let mut events = controller.subscribe();

    controller
        .register_all([
            harness.target("bad").path("bad").namespace("bad").build(),
            harness.target("good").path("good").build(),
        ])
        .await
        .unwrap();

    let mut finished = HashMap::new();
    while finished.len() < 2 {
        let event = wait_for(&mut events, |e| is_terminal(e.phase)).await;
        finished.entry(event.target).or_insert(event.phase);
    }
    assert_eq!(finished["bad"], CyclePhase::Error);
    assert_eq!(finished["good"], CyclePhase::Synced);

    let bad = controller.status("bad").await.unwrap().current.unwrap();
    assert_eq!(bad.error.unwrap().stage, Stage::Rendering);
    let good = controller.status("good").await.unwrap().current.unwrap();
    assert_eq!(good.status, SyncStatus::Synced);
    assert!(harness.cluster.object(&deployment_key()).await.is_some());

    let names: Vec<String> = controller
        .statuses()
        .await
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    assert_eq!(names, vec!["bad", "good"]);
    controller.shutdown().await;
}

#[tokio::test]
async fn test_unknown_target_and_shutdown_errors() {
    let harness = TestHarness::new();
    let controller = harness.controller();

    assert!(matches!(
        controller.sync_now("missing").await,
        Err(ConvergentError::UnknownTarget(name)) if name == "missing"
    ));
    assert!(matches!(
        controller.unregister("missing").await,
        Err(ConvergentError::UnknownTarget(_))
    ));

    controller.shutdown().await;
    assert!(matches!(
        controller.register(harness.target("web").build()).await,
        Err(ConvergentError::ShutDown)
    ));
    assert!(controller.statuses().await.iter().all(|(_, s)| s.current.is_none()));
}

#[tokio::test]
async fn test_unregister_removes_status() {
    let harness = TestHarness::new();
    harness.seed_namespace("apps").await;
    harness.write_source("api.yaml", &deployment_yaml("api", 1));
    let controller = harness.controller();
    let mut events = controller.subscribe();

    controller
        .register(harness.target("web").build())
        .await
        .unwrap();
    next_cycle(&mut events, "web").await;

    controller.unregister("web").await.unwrap();
    assert!(controller.status("web").await.is_none());
    assert!(matches!(
        controller.sync_now("web").await,
        Err(ConvergentError::UnknownTarget(_))
    ));
    controller.shutdown().await;
}

/// Local source whose fetches wait for a permit.
struct GatedSource {
    gate: Semaphore,
    inner: LocalSource,
}

#[async_trait]
impl SourceFetcher for GatedSource {
    async fn fetch(
        &self,
        source: &SourceLocator,
        revision: &str,
    ) -> Result<SourceBundle, FetchError> {
        self.gate.acquire().await.expect("gate closed").forget();
        self.inner.fetch(source, revision).await
    }
}

#[tokio::test]
async fn test_reregister_waits_for_running_cycle() {
    let harness = TestHarness::new();
    harness.seed_namespace("apps").await;
    harness.write_source("api.yaml", &deployment_yaml("api", 1));
    let source = Arc::new(GatedSource {
        gate: Semaphore::new(0),
        inner: LocalSource::new(),
    });
    let controller = harness.controller_with(source.clone());
    let mut events = controller.subscribe();

    controller
        .register(harness.target("web").build())
        .await
        .unwrap();
    let first = wait_for(&mut events, |e| {
        e.target == "web" && e.phase == CyclePhase::Fetching
    })
    .await;

    let replacing = {
        let controller = Arc::clone(&controller);
        let target = harness.target("web").build();
        tokio::spawn(async move { controller.register(target).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!replacing.is_finished());

    source.gate.add_permits(2);
    replacing.await.unwrap().unwrap();

    // The old cycle ends before the replacement starts its own
    let ended = next_cycle(&mut events, "web").await;
    assert_eq!(ended.cycle_id, first.cycle_id);
    assert_eq!(ended.phase, CyclePhase::Error);
    assert_eq!(ended.message, "fetching: superseded");

    let started = wait_for(&mut events, |e| {
        e.target == "web" && e.phase == CyclePhase::Fetching
    })
    .await;
    assert_ne!(started.cycle_id, first.cycle_id);
    let done = next_cycle(&mut events, "web").await;
    assert_eq!(done.cycle_id, started.cycle_id);
    assert_eq!(done.phase, CyclePhase::Synced);
    assert_eq!(controller.statuses().await.len(), 1);

    controller.shutdown().await;
}
