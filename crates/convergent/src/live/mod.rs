//! The target resource system: reading observed state and applying changes.

pub mod memory;
pub mod reader;

use async_trait::async_trait;

use crate::error::ApplyError;
use crate::resource::{DesiredResource, ObservedResource, ResourceKey};

pub use memory::InMemoryCluster;
pub use reader::{LiveStateReader, Scope};

/// Client for the system that hosts live resources.
///
/// Implementations must be idempotent from the caller's perspective:
/// re-applying an identical resource and deleting a missing one are no-ops.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get(&self, key: &ResourceKey) -> Result<Option<ObservedResource>, ApplyError>;

    /// Lists resources in `namespace`, or cluster-scoped resources for `None`.
    async fn list(&self, namespace: Option<&str>) -> Result<Vec<ObservedResource>, ApplyError>;

    async fn apply(&self, resource: &DesiredResource) -> Result<ObservedResource, ApplyError>;

    async fn delete(&self, key: &ResourceKey) -> Result<(), ApplyError>;

    /// Whether the resource has converged (e.g. rolled out) after an apply.
    async fn is_ready(&self, key: &ResourceKey) -> Result<bool, ApplyError>;
}
