//! In-process cluster used for tests and dry runs.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use super::ClusterClient;
use crate::error::ApplyError;
use crate::resource::{DesiredResource, ObservedResource, ResourceKey};

/// Injected failure for a resource key.
#[derive(Debug, Clone)]
pub enum Fault {
    /// Fail the next `n` writes, then succeed.
    Times(u32, ApplyError),
    /// Fail every write.
    Always(ApplyError),
}

/// A recorded write against the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Apply(ResourceKey),
    Delete(ResourceKey),
}

/// Holds live objects in memory with monotonic resource versions.
#[derive(Default)]
pub struct InMemoryCluster {
    objects: RwLock<BTreeMap<ResourceKey, ObservedResource>>,
    version: AtomicU64,
    faults: Mutex<HashMap<ResourceKey, Fault>>,
    not_ready: RwLock<BTreeSet<ResourceKey>>,
    calls: Mutex<Vec<Call>>,
    unavailable: RwLock<Option<String>>,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Puts an object directly, bypassing faults and the call log.
    pub async fn insert(&self, mut resource: ObservedResource) {
        resource.resource_version = self.next_version();
        self.objects.write().await.insert(resource.key(), resource);
    }

    /// Mutates a live object out of band, as another actor would.
    pub async fn mutate<F>(&self, key: &ResourceKey, f: F) -> bool
    where
        F: FnOnce(&mut ObservedResource),
    {
        let mut objects = self.objects.write().await;
        match objects.get_mut(key) {
            Some(object) => {
                f(object);
                object.resource_version = self.next_version();
                true
            }
            None => false,
        }
    }

    pub async fn object(&self, key: &ResourceKey) -> Option<ObservedResource> {
        self.objects.read().await.get(key).cloned()
    }

    pub async fn keys(&self) -> Vec<ResourceKey> {
        self.objects.read().await.keys().cloned().collect()
    }

    pub async fn inject_fault(&self, key: ResourceKey, fault: Fault) {
        self.faults.lock().await.insert(key, fault);
    }

    pub async fn clear_fault(&self, key: &ResourceKey) {
        self.faults.lock().await.remove(key);
    }

    pub async fn set_ready(&self, key: &ResourceKey, ready: bool) {
        let mut not_ready = self.not_ready.write().await;
        if ready {
            not_ready.remove(key);
        } else {
            not_ready.insert(key.clone());
        }
    }

    /// Makes every call fail with `Unavailable` until cleared with `None`.
    pub async fn set_unavailable(&self, reason: Option<&str>) {
        *self.unavailable.write().await = reason.map(str::to_string);
    }

    /// Writes issued so far, in order.
    pub async fn calls(&self) -> Vec<Call> {
        self.calls.lock().await.clone()
    }

    pub async fn clear_calls(&self) {
        self.calls.lock().await.clear();
    }

    async fn check_available(&self) -> Result<(), ApplyError> {
        match self.unavailable.read().await.as_ref() {
            Some(reason) => Err(ApplyError::Unavailable(reason.clone())),
            None => Ok(()),
        }
    }

    async fn check_fault(&self, key: &ResourceKey) -> Result<(), ApplyError> {
        let mut faults = self.faults.lock().await;
        let Some(fault) = faults.get_mut(key) else {
            return Ok(());
        };
        match fault {
            Fault::Always(error) => Err(error.clone()),
            Fault::Times(remaining, error) => {
                let error = error.clone();
                *remaining = remaining.saturating_sub(1);
                if *remaining == 0 {
                    faults.remove(key);
                }
                Err(error)
            }
        }
    }
}

#[async_trait]
impl ClusterClient for InMemoryCluster {
    async fn get(&self, key: &ResourceKey) -> Result<Option<ObservedResource>, ApplyError> {
        self.check_available().await?;
        Ok(self.objects.read().await.get(key).cloned())
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<ObservedResource>, ApplyError> {
        self.check_available().await?;
        Ok(self
            .objects
            .read()
            .await
            .values()
            .filter(|o| o.namespace.as_deref() == namespace)
            .cloned()
            .collect())
    }

    async fn apply(&self, resource: &DesiredResource) -> Result<ObservedResource, ApplyError> {
        let key = resource.key();
        self.calls.lock().await.push(Call::Apply(key.clone()));
        self.check_available().await?;
        self.check_fault(&key).await?;

        if let Some(ns) = &resource.namespace {
            let ns_key = ResourceKey::namespace_object(ns);
            if !self.objects.read().await.contains_key(&ns_key) {
                return Err(ApplyError::Rejected {
                    key,
                    message: format!("namespace '{}' not found", ns),
                });
            }
        }

        let mut objects = self.objects.write().await;
        let existing = objects.get(&key);

        let unchanged = existing.is_some_and(|o| {
            o.spec == resource.spec
                && o.labels == resource.labels
                && o.annotations == resource.annotations
                && o.api_version == resource.api_version
        });
        if unchanged {
            if let Some(o) = existing {
                return Ok(o.clone());
            }
        }

        let (generation, status) = match existing {
            Some(o) if o.spec == resource.spec => (o.generation, o.status.clone()),
            Some(o) => (o.generation + 1, o.status.clone()),
            None => (1, None),
        };

        let observed = ObservedResource {
            api_version: resource.api_version.clone(),
            kind: resource.kind.clone(),
            namespace: resource.namespace.clone(),
            name: resource.name.clone(),
            labels: resource.labels.clone(),
            annotations: resource.annotations.clone(),
            spec: resource.spec.clone(),
            resource_version: self.next_version(),
            generation,
            status,
        };
        objects.insert(key, observed.clone());
        Ok(observed)
    }

    async fn delete(&self, key: &ResourceKey) -> Result<(), ApplyError> {
        self.calls.lock().await.push(Call::Delete(key.clone()));
        self.check_available().await?;
        self.check_fault(key).await?;

        let mut objects = self.objects.write().await;
        objects.remove(key);
        if key.kind == crate::resource::NAMESPACE_KIND {
            objects.retain(|k, _| k.namespace.as_deref() != Some(key.name.as_str()));
        }
        Ok(())
    }

    async fn is_ready(&self, key: &ResourceKey) -> Result<bool, ApplyError> {
        self.check_available().await?;
        if !self.objects.read().await.contains_key(key) {
            return Err(ApplyError::NotFound(key.clone()));
        }
        Ok(!self.not_ready.read().await.contains(key))
    }
}
