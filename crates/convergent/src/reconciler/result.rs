//! Outcomes of reconciliation cycles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::diff::{OutOfSyncRecord, Verb};
use crate::error::StageError;
use crate::policy::Trigger;
use crate::resource::ResourceKey;

/// Terminal outcome of one action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum Outcome {
    Succeeded { attempts: u32 },
    Failed { attempts: u32, error: String },
    /// Denied by policy.
    Skipped { reason: String },
    PendingManualSync,
    /// Not attempted because an action it depends on did not succeed.
    Blocked { by: Vec<ResourceKey> },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Succeeded { .. })
    }

    /// Failed or blocked: the target did not reach desired state.
    pub fn is_degraded(&self) -> bool {
        matches!(self, Outcome::Failed { .. } | Outcome::Blocked { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionOutcome {
    pub key: ResourceKey,
    pub verb: Verb,
    pub wave: usize,
    #[serde(flatten)]
    pub outcome: Outcome,
}

/// Where a target's control loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CyclePhase {
    Idle,
    Fetching,
    Rendering,
    Diffing,
    Planning,
    Syncing,
    Synced,
    OutOfSync,
    Degraded,
    Error,
}

impl std::fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CyclePhase::Idle => write!(f, "Idle"),
            CyclePhase::Fetching => write!(f, "Fetching"),
            CyclePhase::Rendering => write!(f, "Rendering"),
            CyclePhase::Diffing => write!(f, "Diffing"),
            CyclePhase::Planning => write!(f, "Planning"),
            CyclePhase::Syncing => write!(f, "Syncing"),
            CyclePhase::Synced => write!(f, "Synced"),
            CyclePhase::OutOfSync => write!(f, "OutOfSync"),
            CyclePhase::Degraded => write!(f, "Degraded"),
            CyclePhase::Error => write!(f, "Error"),
        }
    }
}

/// Overall status of a finished cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    Synced,
    /// Live state differs but nothing failed: pending manual sync, denied
    /// actions or unpruned resources.
    OutOfSync,
    Degraded,
    Error,
}

impl SyncStatus {
    pub fn phase(self) -> CyclePhase {
        match self {
            SyncStatus::Synced => CyclePhase::Synced,
            SyncStatus::OutOfSync => CyclePhase::OutOfSync,
            SyncStatus::Degraded => CyclePhase::Degraded,
            SyncStatus::Error => CyclePhase::Error,
        }
    }

    /// Classifies a cycle that reached the sync stage.
    pub fn classify(outcomes: &[ActionOutcome], out_of_sync: &[OutOfSyncRecord]) -> Self {
        if outcomes.iter().any(|o| o.outcome.is_degraded()) {
            SyncStatus::Degraded
        } else if !out_of_sync.is_empty() || outcomes.iter().any(|o| !o.outcome.is_success()) {
            SyncStatus::OutOfSync
        } else {
            SyncStatus::Synced
        }
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.phase().fmt(f)
    }
}

/// Record of one reconciliation cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub cycle_id: Uuid,
    pub target: String,
    /// Resolved source revision, once fetched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    pub trigger: Trigger,
    pub status: SyncStatus,
    /// One entry per non-NoOp action, in wave order.
    pub outcomes: Vec<ActionOutcome>,
    /// Resources that needed no change.
    pub unchanged: usize,
    pub out_of_sync: Vec<OutOfSyncRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StageError>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SyncResult {
    /// Outcome recorded for `key`, if any.
    pub fn outcome(&self, key: &ResourceKey) -> Option<&ActionOutcome> {
        self.outcomes.iter().find(|o| &o.key == key)
    }

    /// Number of actions that changed the live system.
    pub fn applied(&self) -> usize {
        self.outcomes.iter().filter(|o| o.outcome.is_success()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(name: &str, outcome: Outcome) -> ActionOutcome {
        ActionOutcome {
            key: ResourceKey::new("ConfigMap", Some("web"), name),
            verb: Verb::Update,
            wave: 0,
            outcome,
        }
    }

    #[test]
    fn test_classify() {
        let ok = outcome("a", Outcome::Succeeded { attempts: 1 });
        assert_eq!(SyncStatus::classify(&[ok.clone()], &[]), SyncStatus::Synced);
        assert_eq!(SyncStatus::classify(&[], &[]), SyncStatus::Synced);

        let pending = outcome("b", Outcome::PendingManualSync);
        assert_eq!(
            SyncStatus::classify(&[ok.clone(), pending], &[]),
            SyncStatus::OutOfSync
        );

        let orphan = OutOfSyncRecord {
            key: ResourceKey::new("ConfigMap", Some("web"), "old"),
            reason: "not in desired state".into(),
        };
        assert_eq!(
            SyncStatus::classify(&[ok.clone()], &[orphan]),
            SyncStatus::OutOfSync
        );

        let blocked = outcome(
            "c",
            Outcome::Blocked {
                by: vec![ResourceKey::new("ConfigMap", Some("web"), "a")],
            },
        );
        assert_eq!(SyncStatus::classify(&[ok, blocked], &[]), SyncStatus::Degraded);
    }

    #[test]
    fn test_outcome_serializes_flat() {
        let value = serde_json::to_value(outcome(
            "a",
            Outcome::Failed {
                attempts: 4,
                error: "boom".into(),
            },
        ))
        .unwrap();
        assert_eq!(value["outcome"], "failed");
        assert_eq!(value["attempts"], 4);
        assert_eq!(value["verb"], "Update");
        assert_eq!(value["key"]["name"], "a");
    }
}
