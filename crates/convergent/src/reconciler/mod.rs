//! The reconciliation core: runs cycles for a single target.

pub mod cycle;
pub mod executor;
pub mod result;

pub use cycle::TargetReconciler;
pub use executor::{Execution, Executor};
pub use result::{ActionOutcome, CyclePhase, Outcome, SyncResult, SyncStatus};
