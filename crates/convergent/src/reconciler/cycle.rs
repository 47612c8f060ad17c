//! One target's reconciliation cycle: fetch, render, diff, plan, sync.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tracing::Instrument;
use uuid::Uuid;

use super::executor::Executor;
use super::result::{CyclePhase, SyncResult, SyncStatus};
use crate::config::ControllerSettings;
use crate::controller::status::StatusBoard;
use crate::diff::Differ;
use crate::error::{Stage, StageError, SyncError};
use crate::live::{LiveStateReader, Scope};
use crate::plan::plan;
use crate::policy::Trigger;
use crate::render::Renderer;
use crate::resource::DesiredResource;
use crate::source::SourceFetcher;
use crate::target::Target;

type StageResult<T> = std::result::Result<T, (Stage, SyncError)>;

/// Owns one target's cycles and its append-only result history.
pub struct TargetReconciler {
    target: Target,
    fetcher: Arc<dyn SourceFetcher>,
    reader: Arc<LiveStateReader>,
    settings: Arc<ControllerSettings>,
    status: StatusBoard,
    renderer: Renderer,
    history: VecDeque<SyncResult>,
    /// Namespaces rendered by the previous cycle or still holding objects
    /// owned by this target, kept in scope to find orphans.
    tracked_namespaces: BTreeSet<String>,
}

impl TargetReconciler {
    pub fn new(
        target: Target,
        fetcher: Arc<dyn SourceFetcher>,
        reader: Arc<LiveStateReader>,
        settings: Arc<ControllerSettings>,
        status: StatusBoard,
    ) -> Self {
        Self {
            target,
            fetcher,
            reader,
            settings,
            status,
            renderer: Renderer::new(),
            history: VecDeque::new(),
            tracked_namespaces: BTreeSet::new(),
        }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Finished cycles, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &SyncResult> {
        self.history.iter()
    }

    pub fn last_result(&self) -> Option<&SyncResult> {
        self.history.back()
    }

    /// Runs a full cycle and records its result.
    ///
    /// Failures before the sync stage end the cycle in `Error` without
    /// touching the live system. Nothing here is retried; the next trigger
    /// starts over.
    pub async fn run_cycle(&mut self, trigger: Trigger, cancel: &AtomicBool) -> SyncResult {
        let cycle_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut result = SyncResult {
            cycle_id,
            target: self.target.name.clone(),
            revision: None,
            trigger,
            status: SyncStatus::Error,
            outcomes: Vec::new(),
            unchanged: 0,
            out_of_sync: Vec::new(),
            error: None,
            started_at,
            finished_at: started_at,
        };

        let span = tracing::info_span!(
            "reconcile.cycle",
            target = %self.target.name,
            cycle_id = %cycle_id,
            trigger = %trigger
        );
        let outcome = self.stages(&mut result, cancel).instrument(span.clone()).await;

        span.in_scope(|| match outcome {
            Ok(status) => {
                result.status = status;
                tracing::info!(
                    status = %status,
                    applied = result.applied(),
                    unchanged = result.unchanged,
                    "Cycle finished"
                );
            }
            Err((stage, error)) => {
                result.status = SyncStatus::Error;
                result.error = Some(StageError::new(stage, &error));
                tracing::error!(%stage, "Cycle failed: {}", error);
            }
        });
        result.finished_at = Utc::now();

        self.history.push_back(result.clone());
        while self.history.len() > self.settings.history_limit.max(1) {
            self.history.pop_front();
        }
        self.status
            .record(result.clone(), self.history.len())
            .await;
        result
    }

    async fn stages(
        &mut self,
        result: &mut SyncResult,
        cancel: &AtomicBool,
    ) -> StageResult<SyncStatus> {
        let cycle_id = result.cycle_id;

        self.enter(cycle_id, CyclePhase::Fetching).await;
        let bundle = self
            .fetcher
            .fetch(&self.target.source, &self.target.revision)
            .await
            .map_err(|e| (Stage::Fetching, e.into()))?;
        result.revision = Some(bundle.revision.clone());
        check_cancel(cancel, Stage::Fetching)?;

        self.enter(cycle_id, CyclePhase::Rendering).await;
        let desired = self
            .renderer
            .render(&self.target, &bundle)
            .map_err(|e| (Stage::Rendering, e.into()))?;
        tracing::debug!(resources = desired.len(), revision = %bundle.revision, "Rendered");
        check_cancel(cancel, Stage::Rendering)?;

        self.enter(cycle_id, CyclePhase::Diffing).await;
        let scope = self.scope(&desired);
        if result.trigger.wants_fresh_state() {
            self.reader.invalidate(&scope).await;
        }
        let observed = self
            .reader
            .read(&scope)
            .await
            .map_err(|e| (Stage::Diffing, e.into()))?;
        let mut tracked = namespaces_of(&desired);
        tracked.extend(
            observed
                .iter()
                .filter(|o| o.owned_by(&self.target.name))
                .filter_map(|o| o.namespace.clone()),
        );
        let report = Differ::new(&self.target)
            .diff(&desired, &observed)
            .map_err(|e| (Stage::Diffing, e.into()))?;
        result.out_of_sync = report.out_of_sync;
        check_cancel(cancel, Stage::Diffing)?;

        self.enter(cycle_id, CyclePhase::Planning).await;
        let plan = plan(report.actions).map_err(|e| (Stage::Planning, e.into()))?;
        result.unchanged = plan.unchanged.len();
        tracing::debug!(
            waves = plan.waves.len(),
            actions = plan.action_count(),
            unchanged = result.unchanged,
            "Planned"
        );
        check_cancel(cancel, Stage::Planning)?;

        self.enter(cycle_id, CyclePhase::Syncing).await;
        let execution = Executor::new(self.reader.client().clone(), Arc::clone(&self.settings))
            .execute(&self.target, &plan, result.trigger, cancel)
            .await;
        result.outcomes = execution.outcomes;

        if !plan.is_empty() {
            self.reader.invalidate(&scope).await;
        }
        self.tracked_namespaces = tracked;

        if execution.superseded {
            return Err((Stage::Syncing, SyncError::Superseded));
        }
        Ok(SyncStatus::classify(&result.outcomes, &result.out_of_sync))
    }

    async fn enter(&self, cycle_id: Uuid, phase: CyclePhase) {
        tracing::debug!(%phase, "Entering phase");
        self.status
            .set_phase(&self.target.name, cycle_id, phase, phase.to_string())
            .await;
    }

    /// Destination namespace, every rendered namespace and the tracked
    /// namespaces of earlier cycles. Cluster-scoped objects are always listed.
    /// A namespace leaves the scope only once no owned object remains in it.
    fn scope(&self, desired: &[DesiredResource]) -> Scope {
        let mut namespaces = namespaces_of(desired);
        namespaces.insert(self.target.destination.namespace.clone());
        namespaces.extend(self.tracked_namespaces.iter().cloned());
        Scope::new(self.target.destination.server.clone(), namespaces)
    }
}

fn namespaces_of(desired: &[DesiredResource]) -> BTreeSet<String> {
    desired.iter().filter_map(|r| r.namespace.clone()).collect()
}

fn check_cancel(cancel: &AtomicBool, stage: Stage) -> StageResult<()> {
    if cancel.load(Ordering::Acquire) {
        return Err((stage, SyncError::Superseded));
    }
    Ok(())
}
