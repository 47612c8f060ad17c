//! Gates what the reconciler may do on its own for a target.

use serde::{Deserialize, Serialize};

use crate::diff::{Action, Verb};
use crate::target::{SyncPolicy, Target};

/// What started a reconciliation cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Trigger {
    /// The sync interval elapsed.
    Scheduled,
    /// A human asked for a sync.
    Manual,
    /// Live state drifted outside a cycle.
    Drift,
    /// A new revision appeared in the source.
    SourceChange,
}

impl Trigger {
    /// Manual triggers count as human confirmation.
    pub fn is_confirmed(self) -> bool {
        self == Trigger::Manual
    }

    /// Cached live state must not be trusted for this cycle.
    pub fn wants_fresh_state(self) -> bool {
        matches!(self, Trigger::Manual | Trigger::Drift)
    }
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Trigger::Scheduled => write!(f, "scheduled"),
            Trigger::Manual => write!(f, "manual"),
            Trigger::Drift => write!(f, "drift"),
            Trigger::SourceChange => write!(f, "source-change"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
    Permit,
    Deny(String),
    /// Needs a human before it runs.
    PendingManualSync,
}

/// Evaluates a target's [`SyncPolicy`] against individual actions.
#[derive(Debug, Clone, Copy, Default)]
pub struct PolicyEngine;

impl PolicyEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn authorize(&self, target: &Target, action: &Action, trigger: Trigger) -> Authorization {
        let policy = &target.policy;

        if action.verb == Verb::NoOp {
            return Authorization::Permit;
        }
        if action.verb == Verb::Delete && !policy.prune {
            return Authorization::Deny("pruning disabled".to_string());
        }
        if !policy.automated && !trigger.is_confirmed() {
            return Authorization::PendingManualSync;
        }
        if action.implicit && !policy.create_namespace {
            return Authorization::Deny("namespace creation disabled".to_string());
        }
        Authorization::Permit
    }

    /// Whether drift detected between cycles starts an immediate cycle.
    pub fn heals_drift(&self, policy: &SyncPolicy) -> bool {
        policy.self_heal
    }
}
