//! Kubernetes Events recorded by the operator.

use crate::client::ClusterClient;
use crate::crd::Domain;
use chrono::SecondsFormat;
use k8s_openapi::api::core::v1::{Event, EventSource, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta, Time};
use kube::Resource;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use wko_core::providers::Clock;

/// Event reasons.
pub mod reasons {
    /// A make-right attempt started.
    pub const DOMAIN_PROCESSING_STARTING: &str = "DomainProcessingStarting";
    /// A make-right attempt converged.
    pub const DOMAIN_PROCESSING_COMPLETED: &str = "DomainProcessingCompleted";
    /// A make-right attempt failed.
    pub const DOMAIN_PROCESSING_FAILED: &str = "DomainProcessingFailed";
    /// The webhook identity could not be established.
    pub const IDENTITY_BOOTSTRAP_FAILED: &str = "IdentityBootstrapFailed";
}

/// Component name reported as the event source.
pub const REPORTING_COMPONENT: &str = "weblogic-operator";

/// Event severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Informational.
    Normal,
    /// Something went wrong.
    Warning,
}

impl EventType {
    fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "Normal",
            Self::Warning => "Warning",
        }
    }
}

/// Creates `core/v1` Events through the cluster client.
///
/// Publishing never fails the caller: errors are logged and dropped.
#[derive(Clone)]
pub struct EventRecorder {
    client: ClusterClient,
    clock: Arc<dyn Clock>,
    sequence: Arc<AtomicU64>,
}

impl EventRecorder {
    /// Create a recorder.
    pub fn new(client: ClusterClient, clock: Arc<dyn Clock>) -> Self {
        Self {
            client,
            clock,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Record an event about a Domain.
    pub async fn domain_event(&self, domain: &Domain, kind: EventType, reason: &str, message: &str) {
        let namespace = domain.meta().namespace.clone().unwrap_or_default();
        let prefix = domain.spec.domain_uid.clone();
        self.publish(&namespace, &prefix, domain.object_ref(&()), kind, reason, message)
            .await;
    }

    /// Record an event about the operator's namespace.
    pub async fn namespace_event(&self, namespace: &str, kind: EventType, reason: &str, message: &str) {
        let involved = ObjectReference {
            api_version: Some("v1".to_string()),
            kind: Some("Namespace".to_string()),
            name: Some(namespace.to_string()),
            ..Default::default()
        };
        self.publish(namespace, REPORTING_COMPONENT, involved, kind, reason, message)
            .await;
    }

    async fn publish(
        &self,
        namespace: &str,
        prefix: &str,
        involved: ObjectReference,
        kind: EventType,
        reason: &str,
        message: &str,
    ) {
        let now = self.clock.now();
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let name = format!(
            "{}.{}.{}.{}",
            prefix,
            reason,
            now.timestamp_millis(),
            seq
        )
        .to_ascii_lowercase();

        let event = Event {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            involved_object: involved,
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            type_: Some(kind.as_str().to_string()),
            count: Some(1),
            first_timestamp: Some(Time(now)),
            last_timestamp: Some(Time(now)),
            event_time: Some(MicroTime(now)),
            action: Some(reason.to_string()),
            reporting_component: Some(REPORTING_COMPONENT.to_string()),
            reporting_instance: Some(REPORTING_COMPONENT.to_string()),
            source: Some(EventSource {
                component: Some(REPORTING_COMPONENT.to_string()),
                host: None,
            }),
            ..Default::default()
        };

        match self.client.create(namespace, &event).await {
            Ok(_) => tracing::debug!(
                event = %name,
                reason = %reason,
                at = %now.to_rfc3339_opts(SecondsFormat::Secs, true),
                "Recorded event"
            ),
            Err(e) => tracing::warn!(event = %name, reason = %reason, error = %e, "Failed to record event"),
        }
    }
}
