//! Watch events and the single consumer that applies them.
//!
//! Every watch stream (Domains, Pods, Services) is merged into one stream
//! consumed by one [`WatchConsumer`]. The consumer is the only writer of
//! the [`WatchCache`] and hands Domain changes and drift to the
//! [`DomainProcessor`].

use crate::cache::WatchCache;
use crate::controller::DomainProcessor;
use crate::crd::Domain;
use crate::resources::{LABEL_CREATED_BY_OPERATOR, LABEL_DOMAIN_UID};
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::runtime::watcher::{self, watcher};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt::Debug;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use wko_core::providers::Clock;

/// What happened to a watched object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchAction {
    /// Added or modified.
    Applied,
    /// Deleted.
    Deleted,
}

/// One observed change.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchEvent {
    /// Object kind.
    pub kind: String,
    /// What happened.
    pub action: WatchAction,
    /// The object as observed.
    pub object: Value,
}

impl WatchEvent {
    /// An object was added or modified.
    pub fn applied(kind: impl Into<String>, object: Value) -> Self {
        Self {
            kind: kind.into(),
            action: WatchAction::Applied,
            object,
        }
    }

    /// An object was deleted.
    pub fn deleted(kind: impl Into<String>, object: Value) -> Self {
        Self {
            kind: kind.into(),
            action: WatchAction::Deleted,
            object,
        }
    }

    /// Object name.
    pub fn name(&self) -> &str {
        self.object
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    /// Object namespace, empty for cluster-scoped objects.
    pub fn namespace(&self) -> &str {
        self.object
            .pointer("/metadata/namespace")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    fn label(&self, key: &str) -> Option<&str> {
        self.object
            .pointer("/metadata/labels")
            .and_then(|labels| labels.get(key))
            .and_then(Value::as_str)
    }
}

/// Applies watch events to the cache and dispatches them.
pub struct WatchConsumer {
    cache: WatchCache,
    processor: Arc<DomainProcessor>,
    clock: Arc<dyn Clock>,
}

impl WatchConsumer {
    /// Create a consumer writing into `cache`.
    pub fn new(cache: WatchCache, processor: Arc<DomainProcessor>, clock: Arc<dyn Clock>) -> Self {
        Self {
            cache,
            processor,
            clock,
        }
    }

    /// Apply one event.
    pub fn handle(&self, event: WatchEvent) {
        match event.action {
            WatchAction::Applied => {
                let fresh = self
                    .cache
                    .apply(&event.kind, event.object.clone(), self.clock.now());
                if !fresh {
                    return;
                }
                if event.kind == Domain::kind(&()) {
                    match serde_json::from_value::<Domain>(event.object.clone()) {
                        Ok(domain) => {
                            self.processor.on_domain_applied(&domain);
                        }
                        Err(e) => {
                            tracing::warn!(name = %event.name(), error = %e, "Ignoring undecodable Domain")
                        }
                    }
                } else if let Some(domain) = self.managing_domain(&event) {
                    self.processor.on_managed_change(&domain);
                }
            }
            WatchAction::Deleted => {
                self.cache.remove(&event.kind, event.namespace(), event.name());
                if event.kind == Domain::kind(&()) {
                    self.processor.stop(event.namespace(), event.name());
                } else if let Some(domain) = self.managing_domain(&event) {
                    self.processor.on_drift(&domain);
                }
            }
        }
    }

    /// Cached Domain owning a managed pod or service.
    fn managing_domain(&self, event: &WatchEvent) -> Option<Domain> {
        if event.kind != Pod::kind(&()) && event.kind != Service::kind(&()) {
            return None;
        }
        let domain_uid = event.label(LABEL_DOMAIN_UID)?;
        self.cache
            .list(&Domain::kind(&()), event.namespace())
            .into_iter()
            .filter_map(|entry| entry.decode::<Domain>())
            .find(|domain| domain.spec.domain_uid == domain_uid)
    }

    /// Consume `events` until the stream ends or `shutdown` is cancelled.
    pub async fn run(&self, mut events: BoxStream<'static, WatchEvent>, shutdown: CancellationToken) {
        tracing::info!("Watch consumer started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.next() => match event {
                    Some(event) => self.handle(event),
                    None => {
                        tracing::warn!("Watch stream ended");
                        break;
                    }
                },
            }
        }
        tracing::info!("Watch consumer stopped");
    }
}

fn watch_kind<K>(api: Api<K>, config: watcher::Config) -> BoxStream<'static, WatchEvent>
where
    K: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    let kind = K::kind(&()).to_string();
    watcher(api, config)
        .default_backoff()
        .filter_map(move |event| {
            let kind = kind.clone();
            async move {
                let (object, deleted) = match event {
                    Ok(watcher::Event::Apply(object)) | Ok(watcher::Event::InitApply(object)) => {
                        (object, false)
                    }
                    Ok(watcher::Event::Delete(object)) => (object, true),
                    Ok(watcher::Event::Init) | Ok(watcher::Event::InitDone) => return None,
                    Err(e) => {
                        tracing::error!(kind = %kind, error = %e, "Watch error");
                        return None;
                    }
                };
                match serde_json::to_value(&object) {
                    Ok(value) if deleted => Some(WatchEvent::deleted(kind, value)),
                    Ok(value) => Some(WatchEvent::applied(kind, value)),
                    Err(e) => {
                        tracing::warn!(kind = %kind, error = %e, "Cannot encode watched object");
                        None
                    }
                }
            }
        })
        .boxed()
}

/// Merged watch of Domains plus the Pods and Services the operator created.
///
/// Watches all namespaces when `namespace` is `None`.
pub fn kube_event_stream(client: Client, namespace: Option<&str>) -> BoxStream<'static, WatchEvent> {
    fn api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
    {
        match namespace {
            Some(ns) => Api::namespaced(client.clone(), ns),
            None => Api::all(client.clone()),
        }
    }

    let managed = watcher::Config::default().labels(&format!("{}=true", LABEL_CREATED_BY_OPERATOR));
    stream::select_all([
        watch_kind(api::<Domain>(&client, namespace), watcher::Config::default()),
        watch_kind(api::<Pod>(&client, namespace), managed.clone()),
        watch_kind(api::<Service>(&client, namespace), managed),
    ])
    .boxed()
}
