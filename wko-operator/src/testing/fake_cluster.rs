//! In-memory [`ApiBackend`] with optimistic concurrency and scripted failures.

use crate::cache::ObjectKey;
use crate::client::{api_resource, ApiBackend, ApiFuture, TypedResource};
use crate::watch::WatchEvent;
use chrono::SecondsFormat;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use kube::api::ApiResource;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::broadcast;
use wko_core::providers::Clock;
use wko_core::ApiError;

/// Cluster API operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiOp {
    /// Read.
    Get,
    /// List.
    List,
    /// Create.
    Create,
    /// Replace.
    Replace,
    /// Merge patch.
    Patch,
    /// Status merge patch.
    PatchStatus,
    /// Delete.
    Delete,
}

/// A call received by the fake, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiCall {
    /// Operation.
    pub op: ApiOp,
    /// Object kind.
    pub kind: String,
    /// Namespace.
    pub namespace: String,
    /// Object name (empty for lists).
    pub name: String,
}

/// A scripted failure.
///
/// # Example
///
/// ```ignore
/// fake.inject(
///     FailureRule::on(ApiOp::Replace, "Secret")
///         .named("webhook-secrets")
///         .times(1)
///         .respond(ApiError::conflict("Secret", "webhook-secrets")),
/// );
/// ```
#[derive(Debug, Clone)]
pub struct FailureRule {
    op: ApiOp,
    kind: String,
    name: Option<String>,
    remaining: u32,
    error: ApiError,
}

impl FailureRule {
    /// Fail the next matching call with a 500.
    pub fn on(op: ApiOp, kind: impl Into<String>) -> Self {
        Self {
            op,
            kind: kind.into(),
            name: None,
            remaining: 1,
            error: ApiError::status(500, "InternalError", "injected failure"),
        }
    }

    /// Only match calls on this object.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Fail this many matching calls.
    pub fn times(mut self, times: u32) -> Self {
        self.remaining = times;
        self
    }

    /// Fail every matching call.
    pub fn always(self) -> Self {
        self.times(u32::MAX)
    }

    /// Error to return.
    pub fn respond(mut self, error: ApiError) -> Self {
        self.error = error;
        self
    }

    fn matches(&self, op: ApiOp, kind: &str, name: &str) -> bool {
        self.remaining > 0
            && self.op == op
            && self.kind == kind
            && self.name.as_deref().map_or(true, |n| n == name)
    }
}

/// How pods created in the fake behave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodLifecycle {
    /// Running and ready as soon as created.
    Ready,
    /// Stays pending forever.
    NeverReady,
}

/// How jobs created in the fake behave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobLifecycle {
    /// Completes as soon as created.
    Succeed,
    /// Fails as soon as created.
    Fail,
    /// Stays active forever.
    Pending,
}

struct State {
    objects: BTreeMap<ObjectKey, Value>,
    history: HashMap<ObjectKey, Vec<Value>>,
    calls: Vec<ApiCall>,
    rules: Vec<FailureRule>,
    pod_lifecycle: PodLifecycle,
    pod_overrides: HashMap<String, PodLifecycle>,
    job_lifecycle: JobLifecycle,
    next_version: u64,
    next_uid: u64,
}

impl State {
    fn bump_version(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }

    fn take_failure(&mut self, op: ApiOp, kind: &str, name: &str) -> Option<ApiError> {
        let rule = self.rules.iter_mut().find(|r| r.matches(op, kind, name))?;
        rule.remaining = rule.remaining.saturating_sub(1);
        Some(rule.error.clone())
    }
}

/// An in-memory cluster.
///
/// Objects are stored as JSON. Every write assigns a new `resourceVersion`
/// from a global counter; a replace carrying a stale version fails with 409,
/// as does creating an object that already exists. Pods and jobs get a
/// status according to the configured lifecycle, and every change is
/// broadcast as a [`WatchEvent`].
pub struct FakeCluster {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<WatchEvent>,
}

impl FakeCluster {
    /// Create an empty cluster stamping timestamps from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(4096);
        Self {
            state: Mutex::new(State {
                objects: BTreeMap::new(),
                history: HashMap::new(),
                calls: Vec::new(),
                rules: Vec::new(),
                pod_lifecycle: PodLifecycle::Ready,
                pod_overrides: HashMap::new(),
                job_lifecycle: JobLifecycle::Succeed,
                next_version: 0,
                next_uid: 0,
            }),
            clock,
            events,
        }
    }

    /// Subscribe to change events.
    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }

    /// Change events as a stream, for a [`WatchConsumer`](crate::watch::WatchConsumer).
    ///
    /// Events missed because the consumer lagged are skipped.
    pub fn watch(&self) -> BoxStream<'static, WatchEvent> {
        stream::unfold(self.subscribe(), |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Fake watch lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }

    /// Script a failure.
    pub fn inject(&self, rule: FailureRule) {
        self.state.lock().rules.push(rule);
    }

    /// Lifecycle of pods created from now on.
    pub fn set_pod_lifecycle(&self, lifecycle: PodLifecycle) {
        self.state.lock().pod_lifecycle = lifecycle;
    }

    /// Lifecycle of one pod, by object name.
    pub fn set_pod_lifecycle_for(&self, pod_name: impl Into<String>, lifecycle: PodLifecycle) {
        self.state.lock().pod_overrides.insert(pod_name.into(), lifecycle);
    }

    /// Lifecycle of jobs created from now on.
    pub fn set_job_lifecycle(&self, lifecycle: JobLifecycle) {
        self.state.lock().job_lifecycle = lifecycle;
    }

    /// Flip the readiness of an existing pod. Returns `false` if it does not exist.
    pub fn set_pod_ready(&self, namespace: &str, name: &str, ready: bool) -> bool {
        let now = self.timestamp();
        let mut state = self.state.lock();
        let key = ObjectKey::new("Pod", namespace, name);
        let version = state.bump_version();
        let Some(object) = state.objects.get_mut(&key) else {
            return false;
        };
        object["status"] = pod_status(ready, &now);
        object["metadata"]["resourceVersion"] = json!(version);
        let snapshot = object.clone();
        self.record(&mut *state, key, snapshot);
        true
    }

    /// Store an object directly, bypassing scripted failures and the call log.
    pub fn insert<K: TypedResource>(&self, namespace: &str, object: &K) -> Result<Value, ApiError> {
        let resource = api_resource::<K>();
        let value = serde_json::to_value(object)
            .map_err(|e| ApiError::status(422, "Invalid", e.to_string()))?;
        let mut state = self.state.lock();
        self.create_in(&mut *state, &resource, namespace, value)
    }

    /// Current state of an object.
    pub fn object(&self, kind: &str, namespace: &str, name: &str) -> Option<Value> {
        self.state
            .lock()
            .objects
            .get(&ObjectKey::new(kind, namespace, name))
            .cloned()
    }

    /// Current state of an object, decoded.
    pub fn typed<K: TypedResource>(&self, namespace: &str, name: &str) -> Option<K> {
        let kind = api_resource::<K>().kind;
        self.object(&kind, namespace, name)
            .and_then(|v| serde_json::from_value(v).ok())
    }

    /// Every object of a kind, ordered by namespace and name.
    pub fn objects(&self, kind: &str) -> Vec<Value> {
        self.state
            .lock()
            .objects
            .iter()
            .filter(|(key, _)| key.kind == kind)
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Names of every object of a kind.
    pub fn names(&self, kind: &str) -> Vec<String> {
        self.state
            .lock()
            .objects
            .keys()
            .filter(|key| key.kind == kind)
            .map(|key| key.name.clone())
            .collect()
    }

    /// Every version written for an object, oldest first.
    pub fn history(&self, kind: &str, namespace: &str, name: &str) -> Vec<Value> {
        self.state
            .lock()
            .history
            .get(&ObjectKey::new(kind, namespace, name))
            .cloned()
            .unwrap_or_default()
    }

    /// Calls received so far.
    pub fn calls(&self) -> Vec<ApiCall> {
        self.state.lock().calls.clone()
    }

    /// Calls of one operation on one kind.
    pub fn calls_to(&self, op: ApiOp, kind: &str) -> Vec<ApiCall> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.op == op && c.kind == kind)
            .cloned()
            .collect()
    }

    /// Forget recorded calls.
    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    fn timestamp(&self) -> String {
        self.clock.now().to_rfc3339_opts(SecondsFormat::Secs, true)
    }

    fn record(&self, state: &mut State, key: ObjectKey, object: Value) {
        let kind = key.kind.clone();
        state.history.entry(key).or_default().push(object.clone());
        // No receivers is fine.
        let _ = self.events.send(WatchEvent::applied(kind, object));
    }

    fn handle<T>(
        &self,
        op: ApiOp,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        f: impl FnOnce(&mut State) -> Result<T, ApiError>,
    ) -> Result<T, ApiError> {
        let mut state = self.state.lock();
        state.calls.push(ApiCall {
            op,
            kind: resource.kind.clone(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        });
        if let Some(err) = state.take_failure(op, &resource.kind, name) {
            return Err(err);
        }
        f(&mut *state)
    }

    fn create_in(
        &self,
        state: &mut State,
        resource: &ApiResource,
        namespace: &str,
        mut object: Value,
    ) -> Result<Value, ApiError> {
        let kind = resource.kind.as_str();
        let name = object
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ApiError::status(422, "Invalid", "metadata.name is required"))?;
        let key = ObjectKey::new(kind, namespace, name.as_str());
        if state.objects.contains_key(&key) {
            return Err(ApiError::status(
                409,
                "AlreadyExists",
                format!("{} \"{}\" already exists", kind, name),
            ));
        }

        let now = self.timestamp();
        state.next_uid += 1;
        let uid = format!("uid-{}", state.next_uid);
        let version = state.bump_version();

        object["apiVersion"] = json!(resource.api_version);
        object["kind"] = json!(kind);
        let metadata = &mut object["metadata"];
        if !namespace.is_empty() {
            metadata["namespace"] = json!(namespace);
        }
        metadata["uid"] = json!(uid);
        metadata["resourceVersion"] = json!(version);
        metadata["creationTimestamp"] = json!(now);
        metadata["generation"] = json!(1);

        match kind {
            "Pod" => {
                let lifecycle = state
                    .pod_overrides
                    .get(&name)
                    .copied()
                    .unwrap_or(state.pod_lifecycle);
                object["status"] = pod_status(lifecycle == PodLifecycle::Ready, &now);
            }
            "Job" => object["status"] = job_status(state.job_lifecycle, &now),
            _ => {}
        }

        state.objects.insert(key.clone(), object.clone());
        self.record(state, key, object.clone());
        Ok(object)
    }

    fn replace_in(
        &self,
        state: &mut State,
        kind: &str,
        namespace: &str,
        name: &str,
        mut object: Value,
    ) -> Result<Value, ApiError> {
        let key = ObjectKey::new(kind, namespace, name);
        let existing = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| ApiError::not_found(kind, name))?;

        let current = existing
            .pointer("/metadata/resourceVersion")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if let Some(sent) = object.pointer("/metadata/resourceVersion").and_then(Value::as_str) {
            if sent != current {
                return Err(ApiError::conflict(kind, name));
            }
        }

        for field in ["uid", "creationTimestamp", "namespace"] {
            if let Some(value) = existing["metadata"].get(field) {
                object["metadata"][field] = value.clone();
            }
        }
        if let Some(status) = existing.get("status") {
            object["status"] = status.clone();
        }
        object["apiVersion"] = existing["apiVersion"].clone();
        object["kind"] = existing["kind"].clone();
        self.store_update(state, key, &existing, object)
    }

    fn store_update(
        &self,
        state: &mut State,
        key: ObjectKey,
        existing: &Value,
        mut object: Value,
    ) -> Result<Value, ApiError> {
        let generation = existing
            .pointer("/metadata/generation")
            .and_then(Value::as_i64)
            .unwrap_or(1);
        let generation = if existing.get("spec") != object.get("spec") {
            generation + 1
        } else {
            generation
        };
        object["metadata"]["generation"] = json!(generation);
        object["metadata"]["resourceVersion"] = json!(state.bump_version());
        state.objects.insert(key.clone(), object.clone());
        self.record(state, key, object.clone());
        Ok(object)
    }
}

impl ApiBackend for FakeCluster {
    fn get(&self, resource: &ApiResource, namespace: &str, name: &str) -> ApiFuture<'_, Value> {
        let (resource, namespace, name) = (resource.clone(), namespace.to_string(), name.to_string());
        Box::pin(async move {
            tokio::task::yield_now().await;
            self.handle(ApiOp::Get, &resource, &namespace, &name, |state| {
                state
                    .objects
                    .get(&ObjectKey::new(resource.kind.as_str(), namespace.as_str(), name.as_str()))
                    .cloned()
                    .ok_or_else(|| ApiError::not_found(&resource.kind, &name))
            })
        })
    }

    fn list(
        &self,
        resource: &ApiResource,
        namespace: &str,
        label_selector: Option<&str>,
    ) -> ApiFuture<'_, Vec<Value>> {
        let (resource, namespace) = (resource.clone(), namespace.to_string());
        let selector = label_selector.map(parse_selector).unwrap_or_default();
        Box::pin(async move {
            tokio::task::yield_now().await;
            self.handle(ApiOp::List, &resource, &namespace, "", |state| {
                Ok(state
                    .objects
                    .iter()
                    .filter(|(key, object)| {
                        key.kind == resource.kind
                            && (namespace.is_empty() || key.namespace == namespace)
                            && selector.iter().all(|req| req.matches(object))
                    })
                    .map(|(_, object)| object.clone())
                    .collect())
            })
        })
    }

    fn create(
        &self,
        resource: &ApiResource,
        namespace: &str,
        object: Value,
    ) -> ApiFuture<'_, Value> {
        let (resource, namespace) = (resource.clone(), namespace.to_string());
        let name = object
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Box::pin(async move {
            tokio::task::yield_now().await;
            self.handle(ApiOp::Create, &resource, &namespace, &name, |state| {
                self.create_in(state, &resource, &namespace, object)
            })
        })
    }

    fn replace(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        object: Value,
    ) -> ApiFuture<'_, Value> {
        let (resource, namespace, name) = (resource.clone(), namespace.to_string(), name.to_string());
        Box::pin(async move {
            tokio::task::yield_now().await;
            self.handle(ApiOp::Replace, &resource, &namespace, &name, |state| {
                self.replace_in(state, &resource.kind, &namespace, &name, object)
            })
        })
    }

    fn patch(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        patch: Value,
    ) -> ApiFuture<'_, Value> {
        let (resource, namespace, name) = (resource.clone(), namespace.to_string(), name.to_string());
        Box::pin(async move {
            tokio::task::yield_now().await;
            self.handle(ApiOp::Patch, &resource, &namespace, &name, |state| {
                let key = ObjectKey::new(resource.kind.as_str(), namespace.as_str(), name.as_str());
                let existing = state
                    .objects
                    .get(&key)
                    .cloned()
                    .ok_or_else(|| ApiError::not_found(&resource.kind, &name))?;
                let mut patch = patch;
                if let Some(fields) = patch.as_object_mut() {
                    // Status only changes through the status subresource.
                    fields.remove("status");
                }
                let mut updated = existing.clone();
                merge_patch(&mut updated, &patch);
                self.store_update(state, key, &existing, updated)
            })
        })
    }

    fn patch_status(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        patch: Value,
    ) -> ApiFuture<'_, Value> {
        let (resource, namespace, name) = (resource.clone(), namespace.to_string(), name.to_string());
        Box::pin(async move {
            tokio::task::yield_now().await;
            self.handle(ApiOp::PatchStatus, &resource, &namespace, &name, |state| {
                let key = ObjectKey::new(resource.kind.as_str(), namespace.as_str(), name.as_str());
                let existing = state
                    .objects
                    .get(&key)
                    .cloned()
                    .ok_or_else(|| ApiError::not_found(&resource.kind, &name))?;
                let mut updated = existing.clone();
                if let Some(status) = patch.get("status") {
                    merge_patch(&mut updated["status"], status);
                }
                self.store_update(state, key, &existing, updated)
            })
        })
    }

    fn delete(&self, resource: &ApiResource, namespace: &str, name: &str) -> ApiFuture<'_, ()> {
        let (resource, namespace, name) = (resource.clone(), namespace.to_string(), name.to_string());
        Box::pin(async move {
            tokio::task::yield_now().await;
            self.handle(ApiOp::Delete, &resource, &namespace, &name, |state| {
                let key = ObjectKey::new(resource.kind.as_str(), namespace.as_str(), name.as_str());
                let removed = state
                    .objects
                    .remove(&key)
                    .ok_or_else(|| ApiError::not_found(&resource.kind, &name))?;
                let _ = self.events.send(WatchEvent::deleted(resource.kind.clone(), removed));
                Ok(())
            })
        })
    }
}

/// Apply a JSON merge patch (RFC 7386) to `target`.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(fields) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(existing) = target {
        for (key, value) in fields {
            if value.is_null() {
                existing.remove(key);
            } else {
                merge_patch(existing.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

fn pod_status(ready: bool, now: &str) -> Value {
    json!({
        "phase": if ready { "Running" } else { "Pending" },
        "conditions": [{
            "type": "Ready",
            "status": if ready { "True" } else { "False" },
            "lastTransitionTime": now,
        }],
        "startTime": now,
    })
}

fn job_status(lifecycle: JobLifecycle, now: &str) -> Value {
    match lifecycle {
        JobLifecycle::Succeed => json!({
            "succeeded": 1,
            "startTime": now,
            "completionTime": now,
            "conditions": [{ "type": "Complete", "status": "True", "lastTransitionTime": now }],
        }),
        JobLifecycle::Fail => json!({
            "failed": 1,
            "startTime": now,
            "conditions": [{
                "type": "Failed",
                "status": "True",
                "reason": "BackoffLimitExceeded",
                "message": "Job has reached the specified backoff limit",
                "lastTransitionTime": now,
            }],
        }),
        JobLifecycle::Pending => json!({ "active": 1, "startTime": now }),
    }
}

enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    Exists(String),
}

impl Requirement {
    fn matches(&self, object: &Value) -> bool {
        let label = |key: &str| {
            object
                .pointer("/metadata/labels")
                .and_then(|labels| labels.get(key))
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        match self {
            Self::Equals(key, value) => label(key).as_deref() == Some(value.as_str()),
            Self::NotEquals(key, value) => label(key).as_deref() != Some(value.as_str()),
            Self::Exists(key) => label(key).is_some(),
        }
    }
}

fn parse_selector(selector: &str) -> Vec<Requirement> {
    selector
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|term| {
            if let Some((key, value)) = term.split_once("!=") {
                Requirement::NotEquals(key.trim().to_string(), value.trim().to_string())
            } else if let Some((key, value)) = term.split_once('=') {
                Requirement::Equals(
                    key.trim().to_string(),
                    value.trim_start_matches('=').trim().to_string(),
                )
            } else {
                Requirement::Exists(term.to_string())
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClusterClient;
    use k8s_openapi::api::core::v1::{Pod, Secret};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use wko_core::providers::MockClock;

    fn fake() -> Arc<FakeCluster> {
        Arc::new(FakeCluster::new(Arc::new(MockClock::fixed("2024-01-15T10:30:00Z"))))
    }

    fn secret(name: &str) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_twice_conflicts() {
        let fake = fake();
        let client = ClusterClient::new(fake.clone());
        client.create("ns", &secret("s")).await.unwrap();
        let err = client.create("ns", &secret("s")).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(err.reason, "AlreadyExists");
    }

    #[tokio::test]
    async fn stale_replace_conflicts() {
        let fake = fake();
        let client = ClusterClient::new(fake.clone());
        let first: Secret = client.create("ns", &secret("s")).await.unwrap();
        let second: Secret = client.replace("ns", "s", &first).await.unwrap();
        assert_ne!(first.metadata.resource_version, second.metadata.resource_version);

        let err = client.replace("ns", "s", &first).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let fake = fake();
        fake.inject(FailureRule::on(ApiOp::Get, "Secret").named("s").times(2));
        let client = ClusterClient::new(fake.clone());
        fake.insert("ns", &secret("s")).unwrap();

        assert_eq!(client.get::<Secret>("ns", "s").await.unwrap_err().code, Some(500));
        assert_eq!(client.get::<Secret>("ns", "s").await.unwrap_err().code, Some(500));
        assert!(client.get::<Secret>("ns", "s").await.is_ok());
        assert_eq!(fake.calls_to(ApiOp::Get, "Secret").len(), 3);
    }

    #[tokio::test]
    async fn pods_follow_lifecycle_and_labels_filter_lists() {
        let fake = fake();
        fake.set_pod_lifecycle_for("slow", PodLifecycle::NeverReady);
        let client = ClusterClient::new(fake.clone());

        for (name, cluster) in [("fast", "c1"), ("slow", "c1"), ("other", "c2")] {
            let mut labels = std::collections::BTreeMap::new();
            labels.insert("weblogic.clusterName".to_string(), cluster.to_string());
            let pod = Pod {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    labels: Some(labels),
                    ..Default::default()
                },
                ..Default::default()
            };
            client.create("ns", &pod).await.unwrap();
        }

        let c1: Vec<Pod> = client.list("ns", Some("weblogic.clusterName=c1")).await.unwrap();
        assert_eq!(c1.len(), 2);
        let ready: Vec<bool> = c1.iter().map(crate::resources::is_pod_ready).collect();
        assert_eq!(ready, vec![true, false]);
        assert_eq!(
            c1[0].metadata.creation_timestamp.as_ref().unwrap().0.to_rfc3339(),
            "2024-01-15T10:30:00+00:00"
        );
    }

    #[tokio::test]
    async fn spec_changes_bump_generation() {
        let fake = fake();
        let client = ClusterClient::new(fake.clone());
        client.create("ns", &secret("s")).await.unwrap();
        let patched: Secret = client
            .merge_patch("ns", "s", &json!({ "metadata": { "labels": { "a": "b" } } }))
            .await
            .unwrap();
        assert_eq!(patched.metadata.generation, Some(1));
    }

    #[test]
    fn merge_patch_follows_rfc7386() {
        let mut target = json!({ "a": "b", "c": { "d": "e", "f": "g" } });
        merge_patch(&mut target, &json!({ "a": "z", "c": { "f": null } }));
        assert_eq!(target, json!({ "a": "z", "c": { "d": "e" } }));
    }
}
