//! Runs one control loop per target and routes triggers to them.
//!
//! Each registered target gets its own tokio task that owns the target's
//! [`TargetReconciler`]. Cycles of different targets run in parallel; a
//! target never runs two cycles at once. Triggers arriving while a cycle is
//! running are queued and coalesced into the next cycle.

pub mod status;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::ControllerSettings;
use crate::error::{ConvergentError, Result};
use crate::live::{ClusterClient, LiveStateReader};
use crate::policy::{PolicyEngine, Trigger};
use crate::reconciler::TargetReconciler;
use crate::source::watcher::SourceChangeEvent;
use crate::source::SourceFetcher;
use crate::target::{SyncPolicy, Target};

pub use status::{StatusBoard, SyncEvent, TargetStatus};

/// Queued triggers per target before new ones are dropped as redundant.
const COMMAND_QUEUE: usize = 16;

/// Live state of a target changed outside a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriftEvent {
    pub target: String,
    pub detected_at: DateTime<Utc>,
}

impl DriftEvent {
    pub fn now(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            detected_at: Utc::now(),
        }
    }
}

enum Command {
    Run(Trigger),
}

struct Worker {
    commands: mpsc::Sender<Command>,
    cancel: Arc<AtomicBool>,
    policy: SyncPolicy,
    handle: JoinHandle<()>,
}

/// Owns the per-target control loops.
pub struct Controller {
    settings: Arc<ControllerSettings>,
    fetcher: Arc<dyn SourceFetcher>,
    reader: Arc<LiveStateReader>,
    status: StatusBoard,
    policy: PolicyEngine,
    workers: Mutex<HashMap<String, Worker>>,
    closed: AtomicBool,
}

impl Controller {
    pub fn new(
        settings: ControllerSettings,
        fetcher: Arc<dyn SourceFetcher>,
        client: Arc<dyn ClusterClient>,
    ) -> Self {
        let reader = Arc::new(LiveStateReader::new(client, settings.live_cache_ttl()));
        Self {
            settings: Arc::new(settings),
            fetcher,
            reader,
            status: StatusBoard::default(),
            policy: PolicyEngine::new(),
            workers: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    /// Starts the control loop for `target`; its first cycle runs immediately.
    ///
    /// Registering a name again stops the previous loop first: its in-flight
    /// cycle is cancelled and awaited before the replacement starts.
    pub async fn register(&self, target: Target) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ConvergentError::ShutDown);
        }

        let name = target.name.clone();
        let previous = self.workers.lock().await.remove(&name);
        if let Some(previous) = previous {
            tracing::info!(target = %name, "Replacing control loop");
            stop(&name, previous).await;
        }

        let policy = target.policy.clone();
        let (commands, receiver) = mpsc::channel(COMMAND_QUEUE);
        let cancel = Arc::new(AtomicBool::new(false));

        self.status.register(&name).await;
        let reconciler = TargetReconciler::new(
            target,
            Arc::clone(&self.fetcher),
            Arc::clone(&self.reader),
            Arc::clone(&self.settings),
            self.status.clone(),
        );
        let handle = tokio::spawn(run_worker(
            reconciler,
            receiver,
            Arc::clone(&cancel),
            self.settings.sync_interval(),
        ));

        let worker = Worker {
            commands,
            cancel,
            policy,
            handle,
        };
        let raced = self.workers.lock().await.insert(name.clone(), worker);
        if let Some(raced) = raced {
            stop(&name, raced).await;
        }
        tracing::info!(target = %name, "Registered target");
        Ok(())
    }

    /// Registers every target, stopping at the first error.
    pub async fn register_all(&self, targets: impl IntoIterator<Item = Target>) -> Result<()> {
        for target in targets {
            self.register(target).await?;
        }
        Ok(())
    }

    /// Stops and forgets a target's control loop.
    pub async fn unregister(&self, name: &str) -> Result<()> {
        let worker = self
            .workers
            .lock()
            .await
            .remove(name)
            .ok_or_else(|| ConvergentError::UnknownTarget(name.to_string()))?;
        stop(name, worker).await;
        self.status.remove(name).await;
        Ok(())
    }

    /// Requests an immediate cycle. Manual syncs also run actions that an
    /// unautomated policy would otherwise leave pending.
    pub async fn sync_now(&self, name: &str) -> Result<()> {
        self.send(name, Trigger::Manual).await
    }

    /// Reports drift. Starts a cycle right away only when the target heals
    /// drift; otherwise the next scheduled cycle corrects it. Returns whether
    /// a cycle was triggered.
    pub async fn notify_drift(&self, event: DriftEvent) -> Result<bool> {
        let heals = {
            let workers = self.workers.lock().await;
            let worker = workers
                .get(&event.target)
                .ok_or_else(|| ConvergentError::UnknownTarget(event.target.clone()))?;
            self.policy.heals_drift(&worker.policy)
        };
        if !heals {
            tracing::debug!(
                target = %event.target,
                "Drift noted, waiting for next scheduled cycle"
            );
            return Ok(false);
        }
        tracing::info!(
            target = %event.target,
            detected_at = %event.detected_at,
            "Drift detected, healing"
        );
        self.send(&event.target, Trigger::Drift).await?;
        Ok(true)
    }

    /// A new revision arrived: cancel the in-flight cycle and run again.
    pub async fn source_changed(&self, event: SourceChangeEvent) -> Result<()> {
        self.cancel(&event.target).await?;
        tracing::info!(target = %event.target, path = %event.path, "Source changed");
        self.send(&event.target, Trigger::SourceChange).await
    }

    /// Cooperatively cancels the in-flight cycle, if any. No new wave starts
    /// once the flag is seen and the cycle ends as superseded.
    pub async fn cancel(&self, name: &str) -> Result<()> {
        let workers = self.workers.lock().await;
        let worker = workers
            .get(name)
            .ok_or_else(|| ConvergentError::UnknownTarget(name.to_string()))?;
        worker.cancel.store(true, Ordering::Release);
        Ok(())
    }

    pub async fn status(&self, name: &str) -> Option<TargetStatus> {
        self.status.get(name).await
    }

    pub async fn statuses(&self) -> Vec<(String, TargetStatus)> {
        self.status.all().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.status.subscribe()
    }

    /// Forwards watcher events to [`Controller::source_changed`] until the
    /// watcher's channel closes.
    pub fn follow_sources(
        self: &Arc<Self>,
        mut events: broadcast::Receiver<SourceChangeEvent>,
    ) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if let Err(e) = controller.source_changed(event).await {
                            tracing::warn!("Ignoring source change: {}", e);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Source change events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Stops every control loop after its current cycle and waits for them.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let workers: Vec<(String, Worker)> = self.workers.lock().await.drain().collect();
        for (name, worker) in workers {
            stop(&name, worker).await;
        }
        tracing::info!("Controller shut down");
    }

    async fn send(&self, name: &str, trigger: Trigger) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ConvergentError::ShutDown);
        }
        let workers = self.workers.lock().await;
        let worker = workers
            .get(name)
            .ok_or_else(|| ConvergentError::UnknownTarget(name.to_string()))?;
        match worker.commands.try_send(Command::Run(trigger)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!(
                    target = %name,
                    %trigger,
                    "Trigger queue full, cycle already pending"
                );
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ConvergentError::ShutDown),
        }
    }
}

/// Cancels a worker's cycle, closes its queue and waits for the loop to end.
async fn stop(name: &str, worker: Worker) {
    worker.cancel.store(true, Ordering::Release);
    drop(worker.commands);
    if let Err(e) = worker.handle.await {
        tracing::warn!(target = %name, "Worker ended abnormally: {}", e);
    }
}

/// The per-target loop: wait for a trigger, run one cycle, repeat.
async fn run_worker(
    mut reconciler: TargetReconciler,
    mut commands: mpsc::Receiver<Command>,
    cancel: Arc<AtomicBool>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let trigger = tokio::select! {
            biased;
            command = commands.recv() => match command {
                Some(Command::Run(trigger)) => coalesce(trigger, &mut commands),
                None => break,
            },
            _ = ticker.tick() => Trigger::Scheduled,
        };

        cancel.store(false, Ordering::Release);
        reconciler.run_cycle(trigger, &cancel).await;
        if trigger != Trigger::Scheduled {
            ticker.reset();
        }
    }

    tracing::debug!(target = %reconciler.target().name, "Worker stopped");
}

/// Folds queued triggers into one; a manual request wins since it confirms
/// actions that would otherwise stay pending.
fn coalesce(first: Trigger, commands: &mut mpsc::Receiver<Command>) -> Trigger {
    let mut trigger = first;
    while let Ok(Command::Run(next)) = commands.try_recv() {
        if next == Trigger::Manual {
            trigger = Trigger::Manual;
        }
    }
    trigger
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live::InMemoryCluster;
    use crate::source::LocalSource;
    use crate::target::{Destination, SourceLocator};

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn test_worker_future_is_send() {
        let target = Target::new(
            "web",
            SourceLocator {
                repo_url: "/srv/web".into(),
                path: String::new(),
            },
            "main",
            Destination {
                server: "local".into(),
                namespace: "web".into(),
            },
        );
        let client: Arc<dyn ClusterClient> = Arc::new(InMemoryCluster::new());
        let reader = Arc::new(LiveStateReader::new(client, Duration::from_secs(60)));
        let reconciler = TargetReconciler::new(
            target,
            Arc::new(LocalSource::new()),
            reader,
            Arc::new(ControllerSettings::default()),
            StatusBoard::default(),
        );
        let (_commands, receiver) = mpsc::channel(1);

        let worker = run_worker(
            reconciler,
            receiver,
            Arc::new(AtomicBool::new(false)),
            Duration::from_secs(60),
        );
        assert_send(&worker);
    }

    #[test]
    fn test_coalesce_prefers_manual() {
        let (commands, mut receiver) = mpsc::channel(4);
        commands.try_send(Command::Run(Trigger::Drift)).unwrap();
        commands.try_send(Command::Run(Trigger::Manual)).unwrap();
        commands.try_send(Command::Run(Trigger::Scheduled)).unwrap();
        assert_eq!(coalesce(Trigger::Scheduled, &mut receiver), Trigger::Manual);
        assert!(receiver.try_recv().is_err());
    }
}
