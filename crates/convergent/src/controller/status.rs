//! Read-only status of every target, plus a live event stream.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::reconciler::{CyclePhase, SyncResult};

/// Snapshot of one target's control loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetStatus {
    /// Idle until the first cycle; the last terminal phase between cycles.
    pub phase: CyclePhase,
    /// Most recent finished cycle.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<SyncResult>,
    pub history_len: usize,
    pub updated_at: DateTime<Utc>,
}

impl Default for TargetStatus {
    fn default() -> Self {
        Self {
            phase: CyclePhase::Idle,
            current: None,
            history_len: 0,
            updated_at: Utc::now(),
        }
    }
}

/// Event emitted on every phase transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEvent {
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cycle_id: Option<Uuid>,
    pub phase: CyclePhase,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Shared status store. Cloning is cheap; clones see the same state.
#[derive(Clone)]
pub struct StatusBoard {
    targets: Arc<RwLock<HashMap<String, TargetStatus>>>,
    sender: broadcast::Sender<SyncEvent>,
}

impl StatusBoard {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            targets: Arc::new(RwLock::new(HashMap::new())),
            sender,
        }
    }

    /// Subscribe to phase transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    pub async fn register(&self, target: &str) {
        self.targets
            .write()
            .await
            .entry(target.to_string())
            .or_default();
        self.emit(target, None, CyclePhase::Idle, "registered".to_string());
    }

    pub async fn remove(&self, target: &str) {
        self.targets.write().await.remove(target);
    }

    pub async fn set_phase(
        &self,
        target: &str,
        cycle_id: Uuid,
        phase: CyclePhase,
        message: impl Into<String>,
    ) {
        {
            let mut targets = self.targets.write().await;
            let status = targets.entry(target.to_string()).or_default();
            status.phase = phase;
            status.updated_at = Utc::now();
        }
        self.emit(target, Some(cycle_id), phase, message.into());
    }

    /// Publishes a finished cycle.
    pub async fn record(&self, result: SyncResult, history_len: usize) {
        let phase = result.status.phase();
        let target = result.target.clone();
        let cycle_id = result.cycle_id;
        let message = match &result.error {
            Some(error) => error.to_string(),
            None => format!(
                "{} applied, {} unchanged, {} out of sync",
                result.applied(),
                result.unchanged,
                result.out_of_sync.len()
            ),
        };
        {
            let mut targets = self.targets.write().await;
            let status = targets.entry(target.clone()).or_default();
            status.phase = phase;
            status.updated_at = result.finished_at;
            status.current = Some(result);
            status.history_len = history_len;
        }
        self.emit(&target, Some(cycle_id), phase, message);
    }

    pub async fn get(&self, target: &str) -> Option<TargetStatus> {
        self.targets.read().await.get(target).cloned()
    }

    /// All targets, sorted by name.
    pub async fn all(&self) -> Vec<(String, TargetStatus)> {
        let mut all: Vec<(String, TargetStatus)> = self
            .targets
            .read()
            .await
            .iter()
            .map(|(name, status)| (name.clone(), status.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    fn emit(&self, target: &str, cycle_id: Option<Uuid>, phase: CyclePhase, message: String) {
        let event = SyncEvent {
            target: target.to_string(),
            cycle_id,
            phase,
            message,
            timestamp: Utc::now(),
        };
        if let Err(e) = self.sender.send(event) {
            tracing::trace!("No status subscribers: {}", e);
        }
    }
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Trigger;
    use crate::reconciler::SyncStatus;

    fn result(target: &str) -> SyncResult {
        SyncResult {
            cycle_id: Uuid::new_v4(),
            target: target.to_string(),
            revision: Some("abc".into()),
            trigger: Trigger::Manual,
            status: SyncStatus::Synced,
            outcomes: Vec::new(),
            unchanged: 2,
            out_of_sync: Vec::new(),
            error: None,
            started_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_phase_and_record() {
        let board = StatusBoard::new(16);
        let mut events = board.subscribe();
        board.register("web").await;
        assert_eq!(board.get("web").await.unwrap().phase, CyclePhase::Idle);

        let result = result("web");
        board
            .set_phase("web", result.cycle_id, CyclePhase::Fetching, "fetching")
            .await;
        assert_eq!(board.get("web").await.unwrap().phase, CyclePhase::Fetching);

        board.record(result.clone(), 1).await;
        let status = board.get("web").await.unwrap();
        assert_eq!(status.phase, CyclePhase::Synced);
        assert_eq!(status.history_len, 1);
        assert_eq!(status.current.unwrap().cycle_id, result.cycle_id);

        let phases: Vec<CyclePhase> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|e| e.phase)
            .collect();
        assert_eq!(
            phases,
            vec![CyclePhase::Idle, CyclePhase::Fetching, CyclePhase::Synced]
        );
    }

    #[tokio::test]
    async fn test_all_sorted() {
        let board = StatusBoard::default();
        board.register("b").await;
        board.register("a").await;
        let names: Vec<String> = board.all().await.into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["a", "b"]);
        board.remove("a").await;
        assert!(board.get("a").await.is_none());
    }
}
