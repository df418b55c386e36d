//! In-memory cache of watched cluster objects.
//!
//! The cache is written only by the [`WatchConsumer`](crate::watch::WatchConsumer)
//! and read concurrently by fibers. Readers may see a version that is being
//! superseded at the same moment; steps that need the latest resource
//! version re-read from the cluster before mutating.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;

/// Identity of a cached object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Object kind (`Pod`, `Service`, `Domain`, ...).
    pub kind: String,
    /// Namespace, empty for cluster-scoped objects.
    pub namespace: String,
    /// Object name.
    pub name: String,
}

impl ObjectKey {
    /// Create a key.
    pub fn new(kind: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of a JSON object of the given kind, if it carries a name.
    pub fn of(kind: &str, object: &Value) -> Option<Self> {
        let metadata = object.get("metadata")?;
        let name = metadata.get("name")?.as_str()?;
        let namespace = metadata
            .get("namespace")
            .and_then(Value::as_str)
            .unwrap_or_default();
        Some(Self::new(kind, namespace, name))
    }
}

/// A cached object.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Resource version the entry was observed at.
    pub resource_version: String,
    /// Last observed object.
    pub state: Arc<Value>,
    /// When the consumer applied the entry.
    pub observed_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Decode the cached object.
    pub fn decode<K: DeserializeOwned>(&self) -> Option<K> {
        serde_json::from_value((*self.state).clone()).ok()
    }
}

/// Concurrent cache of watched objects.
#[derive(Clone, Default)]
pub struct WatchCache {
    entries: Arc<DashMap<ObjectKey, CacheEntry>>,
}

impl WatchCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up an object.
    pub fn get(&self, kind: &str, namespace: &str, name: &str) -> Option<CacheEntry> {
        self.entries
            .get(&ObjectKey::new(kind, namespace, name))
            .map(|entry| entry.value().clone())
    }

    /// Look up and decode an object.
    pub fn get_typed<K: DeserializeOwned>(&self, kind: &str, namespace: &str, name: &str) -> Option<K> {
        self.get(kind, namespace, name).and_then(|entry| entry.decode())
    }

    /// All cached objects of a kind in a namespace, ordered by name.
    pub fn list(&self, kind: &str, namespace: &str) -> Vec<CacheEntry> {
        let mut matching: Vec<(String, CacheEntry)> = self
            .entries
            .iter()
            .filter(|e| e.key().kind == kind && e.key().namespace == namespace)
            .map(|e| (e.key().name.clone(), e.value().clone()))
            .collect();
        matching.sort_by(|a, b| a.0.cmp(&b.0));
        matching.into_iter().map(|(_, entry)| entry).collect()
    }

    /// Number of cached objects.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record an observed object. Returns `false` when the object is older
    /// than the cached entry and was ignored.
    pub(crate) fn apply(&self, kind: &str, object: Value, observed_at: DateTime<Utc>) -> bool {
        let Some(key) = ObjectKey::of(kind, &object) else {
            return false;
        };
        let resource_version = object
            .pointer("/metadata/resourceVersion")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        if let Some(existing) = self.entries.get(&key) {
            if is_older(&resource_version, &existing.resource_version) {
                tracing::trace!(kind = %kind, name = %key.name, "Ignoring stale watch event");
                return false;
            }
        }

        self.entries.insert(
            key,
            CacheEntry {
                resource_version,
                state: Arc::new(object),
                observed_at,
            },
        );
        true
    }

    /// Forget an object.
    pub(crate) fn remove(&self, kind: &str, namespace: &str, name: &str) -> Option<CacheEntry> {
        self.entries
            .remove(&ObjectKey::new(kind, namespace, name))
            .map(|(_, entry)| entry)
    }
}

// Resource versions are opaque; only compare them when both are numeric.
fn is_older(candidate: &str, current: &str) -> bool {
    match (candidate.parse::<u64>(), current.parse::<u64>()) {
        (Ok(a), Ok(b)) => a < b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pod(name: &str, rv: &str) -> Value {
        json!({
            "metadata": { "name": name, "namespace": "default", "resourceVersion": rv },
            "status": { "phase": "Running" }
        })
    }

    #[test]
    fn apply_get_and_remove() {
        let cache = WatchCache::new();
        assert!(cache.apply("Pod", pod("d1-c1-ms-1", "3"), Utc::now()));

        let entry = cache.get("Pod", "default", "d1-c1-ms-1").unwrap();
        assert_eq!(entry.resource_version, "3");
        assert_eq!(cache.list("Pod", "default").len(), 1);
        assert!(cache.list("Service", "default").is_empty());

        assert!(cache.remove("Pod", "default", "d1-c1-ms-1").is_some());
        assert!(cache.is_empty());
    }

    #[test]
    fn stale_versions_are_ignored() {
        let cache = WatchCache::new();
        cache.apply("Pod", pod("p", "7"), Utc::now());
        assert!(!cache.apply("Pod", pod("p", "5"), Utc::now()));
        assert_eq!(cache.get("Pod", "default", "p").unwrap().resource_version, "7");
    }

    #[test]
    fn list_is_ordered_by_name() {
        let cache = WatchCache::new();
        for name in ["c", "a", "b"] {
            cache.apply("Pod", pod(name, "1"), Utc::now());
        }
        let names: Vec<String> = cache
            .list("Pod", "default")
            .iter()
            .map(|e| e.state["metadata"]["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn readers_observe_monotonic_versions_while_writer_updates() {
        let cache = WatchCache::new();
        cache.apply("Pod", pod("p", "1"), Utc::now());

        let mut readers = Vec::new();
        for _ in 0..4 {
            let cache = cache.clone();
            readers.push(tokio::spawn(async move {
                let mut last = 0_u64;
                for _ in 0..500 {
                    let rv: u64 = cache
                        .get("Pod", "default", "p")
                        .unwrap()
                        .resource_version
                        .parse()
                        .unwrap();
                    assert!(rv >= last);
                    last = rv;
                    tokio::task::yield_now().await;
                }
            }));
        }

        for rv in 2..=200 {
            cache.apply("Pod", pod("p", &rv.to_string()), Utc::now());
            tokio::task::yield_now().await;
        }

        for reader in readers {
            reader.await.unwrap();
        }
        assert_eq!(cache.get("Pod", "default", "p").unwrap().resource_version, "200");
    }
}
