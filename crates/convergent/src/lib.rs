//! GitOps reconciliation core.
//!
//! Drives live resources toward the desired state declared in a versioned
//! source: fetch, render, diff, plan and sync, once per target per cycle.

pub mod config;
pub mod controller;
pub mod diff;
pub mod error;
pub mod live;
pub mod plan;
pub mod policy;
pub mod reconciler;
pub mod render;
pub mod resource;
pub mod source;
pub mod target;
pub mod telemetry;

pub use config::{ControllerSettings, LoadedTargets, TargetLoader, TargetValidator};
pub use controller::{Controller, DriftEvent, StatusBoard, SyncEvent, TargetStatus};
pub use diff::{Action, DiffReport, Differ, OutOfSyncRecord, Verb};
pub use error::{
    ApplyError, ConfigError, ConvergentError, DiffError, FetchError, PlanError, RenderError,
    Result, Stage, StageError, SyncError,
};
pub use live::{ClusterClient, InMemoryCluster, LiveStateReader, Scope};
pub use plan::{plan, Plan, PlannedAction, Wave};
pub use policy::{Authorization, PolicyEngine, Trigger};
pub use reconciler::{
    ActionOutcome, CyclePhase, Outcome, SyncResult, SyncStatus, TargetReconciler,
};
pub use render::Renderer;
pub use resource::{DesiredResource, ObservedResource, ResourceKey};
pub use source::{
    GitSource, LocalSource, RoutingFetcher, SourceBundle, SourceChangeEvent, SourceFetcher,
    SourceWatcher,
};
pub use target::{Destination, SourceLocator, SyncPolicy, Target};
pub use telemetry::{init_logging, LogFormat};
