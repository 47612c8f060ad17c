//! Drives a plan against the live system, wave by wave.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use tokio::time::Instant;
use tracing::Instrument;

use super::result::{ActionOutcome, Outcome};
use crate::config::ControllerSettings;
use crate::diff::{Action, Verb};
use crate::error::ApplyError;
use crate::live::ClusterClient;
use crate::plan::{Plan, PlannedAction};
use crate::policy::{Authorization, PolicyEngine, Trigger};
use crate::resource::ResourceKey;
use crate::target::Target;

/// What happened while executing a plan.
#[derive(Debug, Default)]
pub struct Execution {
    pub outcomes: Vec<ActionOutcome>,
    /// A cancellation was observed before all waves ran.
    pub superseded: bool,
}

/// Executes planned actions with bounded concurrency and per-action retries.
pub struct Executor {
    runner: Runner,
}

impl Executor {
    pub fn new(client: Arc<dyn ClusterClient>, settings: Arc<ControllerSettings>) -> Self {
        Self {
            runner: Runner {
                client,
                settings,
                policy: PolicyEngine::new(),
            },
        }
    }

    /// Runs every wave in order.
    ///
    /// Actions of a wave run concurrently, up to `worker_count` at a time,
    /// and the next wave starts only once all of them reached an outcome.
    /// `cancel` is checked before each wave; actions already running finish.
    pub async fn execute(
        &self,
        target: &Target,
        plan: &Plan,
        trigger: Trigger,
        cancel: &AtomicBool,
    ) -> Execution {
        let mut execution = Execution::default();
        let mut troubled: HashSet<ResourceKey> = HashSet::new();
        let workers = self.runner.settings.worker_count.max(1);
        let target = Arc::new(target.clone());

        for wave in &plan.waves {
            if cancel.load(Ordering::Acquire) {
                tracing::info!(wave = wave.index, "Cancellation observed, not starting wave");
                execution.superseded = true;
                break;
            }

            let span = tracing::info_span!("reconcile.wave", wave = wave.index);
            let troubled_before = Arc::new(troubled.clone());
            let runs: Vec<_> = wave
                .actions
                .iter()
                .map(|planned| {
                    self.runner.clone().run(
                        Arc::clone(&target),
                        planned.clone(),
                        wave.index,
                        trigger,
                        Arc::clone(&troubled_before),
                    )
                })
                .collect();
            let mut outcomes: Vec<ActionOutcome> = stream::iter(runs)
                .buffer_unordered(workers)
                .collect()
                .instrument(span)
                .await;
            outcomes.sort_by(|a, b| a.key.cmp(&b.key));

            for outcome in &outcomes {
                if outcome.outcome.is_degraded() {
                    troubled.insert(outcome.key.clone());
                }
            }
            execution.outcomes.extend(outcomes);
        }

        execution
    }
}

/// Carries one action from authorization to its outcome.
#[derive(Clone)]
struct Runner {
    client: Arc<dyn ClusterClient>,
    settings: Arc<ControllerSettings>,
    policy: PolicyEngine,
}

impl Runner {
    async fn run(
        self,
        target: Arc<Target>,
        planned: PlannedAction,
        wave: usize,
        trigger: Trigger,
        troubled: Arc<HashSet<ResourceKey>>,
    ) -> ActionOutcome {
        let action = &planned.action;
        let outcome = match self.policy.authorize(&target, action, trigger) {
            Authorization::Deny(reason) => {
                tracing::info!(resource = %action.key, %reason, "Action skipped by policy");
                Outcome::Skipped { reason }
            }
            Authorization::PendingManualSync => {
                tracing::debug!(resource = %action.key, "Action awaits manual sync");
                Outcome::PendingManualSync
            }
            Authorization::Permit => {
                let by: Vec<ResourceKey> = planned
                    .after
                    .iter()
                    .filter(|k| troubled.contains(*k))
                    .cloned()
                    .collect();
                if by.is_empty() {
                    self.attempt(action, target.policy.retry_limit).await
                } else {
                    tracing::warn!(resource = %action.key, blocked_by = by.len(), "Action blocked");
                    Outcome::Blocked { by }
                }
            }
        };

        ActionOutcome {
            key: action.key.clone(),
            verb: action.verb,
            wave,
            outcome,
        }
    }

    /// Runs an action, retrying any failure up to `retry_limit` times.
    async fn attempt(&self, action: &Action, retry_limit: u32) -> Outcome {
        let max_attempts = retry_limit.saturating_add(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.perform(action).await {
                Ok(()) => {
                    tracing::info!(
                        resource = %action.key,
                        verb = %action.verb,
                        attempt,
                        "Action succeeded"
                    );
                    return Outcome::Succeeded { attempts: attempt };
                }
                Err(e) if attempt < max_attempts => {
                    let delay = self.settings.retry_delay(attempt);
                    tracing::warn!(
                        resource = %action.key,
                        attempt,
                        max_attempts,
                        transient = e.is_retryable(),
                        delay_ms = delay.as_millis() as u64,
                        "Action failed, retrying: {}",
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    tracing::error!(resource = %action.key, attempt, "Action failed: {}", e);
                    return Outcome::Failed {
                        attempts: attempt,
                        error: e.to_string(),
                    };
                }
            }
        }
    }

    async fn perform(&self, action: &Action) -> Result<(), ApplyError> {
        match action.verb {
            Verb::Create | Verb::Update => {
                let payload = action.payload.as_ref().ok_or_else(|| ApplyError::Rejected {
                    key: action.key.clone(),
                    message: "no document to apply".to_string(),
                })?;
                self.client.apply(payload).await?;
                if action.await_ready {
                    self.wait_ready(&action.key).await?;
                }
                Ok(())
            }
            Verb::Delete => self.client.delete(&action.key).await,
            Verb::NoOp => Ok(()),
        }
    }

    /// Polls readiness until the configured timeout.
    async fn wait_ready(&self, key: &ResourceKey) -> Result<(), ApplyError> {
        let deadline = Instant::now() + self.settings.readiness_timeout();
        loop {
            if self.client.is_ready(key).await? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ApplyError::NotReady(key.clone()));
            }
            tokio::time::sleep(self.settings.readiness_poll()).await;
        }
    }
}
