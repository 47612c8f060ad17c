//! Cached reads of observed state.
//!
//! Entries are keyed by [`Scope`]. Concurrent cycles of unrelated targets
//! share entries for the same scope, and `try_get_with` runs at most one
//! listing per key at a time, so an entry is never written concurrently.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;

use super::ClusterClient;
use crate::error::ApplyError;
use crate::resource::ObservedResource;

/// The slice of the live system a target's cycle observes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Scope {
    pub server: String,
    /// Namespaces whose objects are listed; cluster-scoped objects are always included.
    pub namespaces: BTreeSet<String>,
}

impl Scope {
    pub fn new(server: impl Into<String>, namespaces: impl IntoIterator<Item = String>) -> Self {
        Self {
            server: server.into(),
            namespaces: namespaces.into_iter().collect(),
        }
    }
}

pub type Snapshot = Arc<Vec<ObservedResource>>;

/// Reads observed resources through a shared cache.
pub struct LiveStateReader {
    client: Arc<dyn ClusterClient>,
    cache: Cache<Scope, Snapshot>,
}

impl LiveStateReader {
    pub fn new(client: Arc<dyn ClusterClient>, ttl: Duration) -> Self {
        Self {
            client,
            cache: Cache::builder().max_capacity(1024).time_to_live(ttl).build(),
        }
    }

    pub fn client(&self) -> &Arc<dyn ClusterClient> {
        &self.client
    }

    /// Observed resources in `scope`, sorted by key.
    pub async fn read(&self, scope: &Scope) -> Result<Snapshot, ApplyError> {
        let init = list(Arc::clone(&self.client), scope.clone());
        self.cache
            .try_get_with(scope.clone(), init)
            .await
            .map_err(|e| (*e).clone())
    }

    /// Drops the cached snapshot for `scope`; the next read lists again.
    pub async fn invalidate(&self, scope: &Scope) {
        self.cache.invalidate(scope).await;
    }

    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }
}

async fn list(client: Arc<dyn ClusterClient>, scope: Scope) -> Result<Snapshot, ApplyError> {
    let mut objects = client.list(None).await?;
    for namespace in &scope.namespaces {
        objects.extend(client.list(Some(namespace.as_str())).await?);
    }
    objects.sort_by_key(|o| o.key());

    tracing::debug!(
        server = %scope.server,
        namespaces = scope.namespaces.len(),
        objects = objects.len(),
        "Listed live state"
    );
    Ok(Arc::new(objects))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live::InMemoryCluster;
    use crate::resource::DesiredResource;
    use serde_json::json;

    fn doc(kind: &str, namespace: Option<&str>, name: &str) -> DesiredResource {
        let mut metadata = json!({"name": name});
        if let Some(ns) = namespace {
            metadata["namespace"] = json!(ns);
        }
        DesiredResource::from_document(
            "test.yaml",
            json!({"apiVersion": "v1", "kind": kind, "metadata": metadata}),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_read_lists_scope_and_caches() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.apply(&doc("Namespace", None, "web")).await.unwrap();
        cluster.apply(&doc("Namespace", None, "other")).await.unwrap();
        cluster.apply(&doc("ConfigMap", Some("web"), "a")).await.unwrap();
        cluster.apply(&doc("ConfigMap", Some("other"), "b")).await.unwrap();

        let reader = LiveStateReader::new(cluster.clone(), Duration::from_secs(60));
        let scope = Scope::new("local", ["web".to_string()]);

        let snapshot = reader.read(&scope).await.unwrap();
        let keys: Vec<String> = snapshot.iter().map(|o| o.key().to_string()).collect();
        assert_eq!(keys, vec!["ConfigMap/web/a", "Namespace/other", "Namespace/web"]);

        // Served from cache until invalidated
        cluster.apply(&doc("ConfigMap", Some("web"), "c")).await.unwrap();
        assert_eq!(reader.read(&scope).await.unwrap().len(), 3);

        reader.invalidate(&scope).await;
        assert_eq!(reader.read(&scope).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_read_error_is_not_cached() {
        let cluster = Arc::new(InMemoryCluster::new());
        let reader = LiveStateReader::new(cluster.clone(), Duration::from_secs(60));
        let scope = Scope::new("local", ["web".to_string()]);

        cluster.set_unavailable(Some("maintenance")).await;
        let err = reader.read(&scope).await.unwrap_err();
        assert_eq!(err, ApplyError::Unavailable("maintenance".into()));

        cluster.set_unavailable(None).await;
        assert!(reader.read(&scope).await.unwrap().is_empty());
    }
}
