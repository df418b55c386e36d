//! Domain status updates.

use super::{domain, keys, namespace, retry};
use crate::controller::OperatorContext;
use crate::crd::{ClusterStatus, Domain, DomainPhase, ServerStatus};
use crate::resources::{
    domain_selector, ingress_name, is_pod_ready, LABEL_CLUSTER_NAME, LABEL_SERVER_NAME,
    ROUTING_SET_ANNOTATION,
};
use crate::routing::RoutingSet;
use chrono::SecondsFormat;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::networking::v1::Ingress;
use serde_json::{json, Value};
use std::sync::Arc;
use wko_core::{NextAction, Packet, Step, StepFuture, StepResult};

fn timestamp(ctx: &OperatorContext) -> String {
    ctx.clock.now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

async fn patch_status(
    ctx: &OperatorContext,
    packet: &mut Packet,
    scope: &str,
    domain: &Domain,
    status: Value,
) -> Option<StepResult> {
    let ns = namespace(domain);
    let name = domain.metadata.name.clone().unwrap_or_default();
    match ctx
        .client
        .patch_status::<Domain>(&ns, &name, &json!({ "status": status }))
        .await
    {
        Ok(_) => {
            ctx.config.retry.reset(packet, scope);
            None
        }
        Err(e) => Some(retry(ctx, packet, scope, &e)),
    }
}

/// Record the phase a make-right attempt has reached.
///
/// Clears any message and reason left by a previous failure.
pub struct SetPhase {
    ctx: Arc<OperatorContext>,
    phase: DomainPhase,
    name: String,
}

impl SetPhase {
    /// Create the step.
    pub fn new(ctx: Arc<OperatorContext>, phase: DomainPhase) -> Self {
        Self {
            ctx,
            phase,
            name: format!("SetPhase({})", phase),
        }
    }
}

impl Step for SetPhase {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply<'a>(&'a self, packet: &'a mut Packet) -> StepFuture<'a> {
        Box::pin(async move {
            let domain = domain(packet)?;
            let current = packet
                .get_cloned::<DomainPhase>(keys::PHASE)
                .or_else(|| domain.status.as_ref().map(|s| s.phase));
            if current == Some(self.phase) {
                return Ok(NextAction::Continue);
            }

            let status = json!({
                "phase": self.phase,
                "lastUpdated": timestamp(&self.ctx),
                "observedGeneration": domain.metadata.generation,
                "message": Value::Null,
                "reason": Value::Null,
            });
            if let Some(result) = patch_status(&self.ctx, packet, &self.name, &domain, status).await {
                return result;
            }

            tracing::debug!(domain = %domain.spec.domain_uid, phase = %self.phase, "Phase updated");
            packet.put(keys::PHASE, self.phase);
            Ok(NextAction::Continue)
        })
    }
}

/// Publish the converged state: phase Ready plus servers and clusters.
pub struct WriteReadyStatus {
    ctx: Arc<OperatorContext>,
}

impl WriteReadyStatus {
    /// Create the step.
    pub fn new(ctx: Arc<OperatorContext>) -> Self {
        Self { ctx }
    }

    async fn clusters(&self, domain: &Domain) -> Result<Vec<ClusterStatus>, wko_core::ApiError> {
        if !domain.spec.startup_control().starts_clusters() {
            return Ok(Vec::new());
        }
        let ns = namespace(domain);
        let mut clusters = Vec::new();
        for cluster in domain.spec.cluster_names() {
            let ingress = self
                .ctx
                .client
                .get_opt::<Ingress>(&ns, &ingress_name(&domain.spec.domain_uid, &cluster))
                .await?;
            let routing = ingress
                .as_ref()
                .and_then(|i| i.metadata.annotations.as_ref())
                .and_then(|a| a.get(ROUTING_SET_ANNOTATION))
                .map(|v| RoutingSet::from_annotation(v))
                .unwrap_or_default();
            clusters.push(ClusterStatus {
                replicas: domain.spec.replica_limit(&cluster),
                cluster_name: cluster,
                routing_set: routing.to_vec(),
            });
        }
        Ok(clusters)
    }
}

impl Step for WriteReadyStatus {
    fn name(&self) -> &str {
        "WriteReadyStatus"
    }

    fn apply<'a>(&'a self, packet: &'a mut Packet) -> StepFuture<'a> {
        Box::pin(async move {
            let domain = domain(packet)?;
            let ns = namespace(&domain);

            let pods = match self
                .ctx
                .client
                .list::<Pod>(&ns, Some(&domain_selector(&domain.spec.domain_uid)))
                .await
            {
                Ok(pods) => pods,
                Err(e) => return retry(&self.ctx, packet, self.name(), &e),
            };
            let mut servers: Vec<ServerStatus> = pods
                .iter()
                .filter_map(|pod| {
                    let labels = pod.metadata.labels.as_ref()?;
                    Some(ServerStatus {
                        server_name: labels.get(LABEL_SERVER_NAME)?.clone(),
                        cluster_name: labels.get(LABEL_CLUSTER_NAME).cloned(),
                        ready: is_pod_ready(pod),
                    })
                })
                .collect();
            servers.sort_by(|a, b| a.server_name.cmp(&b.server_name));

            let clusters = match self.clusters(&domain).await {
                Ok(clusters) => clusters,
                Err(e) => return retry(&self.ctx, packet, self.name(), &e),
            };

            let status = json!({
                "phase": DomainPhase::Ready,
                "servers": servers,
                "clusters": clusters,
                "lastUpdated": timestamp(&self.ctx),
                "observedGeneration": domain.metadata.generation,
                "message": Value::Null,
                "reason": Value::Null,
            });
            if let Some(result) = patch_status(&self.ctx, packet, self.name(), &domain, status).await {
                return result;
            }

            tracing::info!(
                domain = %domain.spec.domain_uid,
                servers = servers.len(),
                "Domain ready"
            );
            packet.put(keys::PHASE, DomainPhase::Ready);
            Ok(NextAction::Continue)
        })
    }
}

/// Record a failed make-right attempt.
pub(crate) async fn write_failed_status(
    ctx: &OperatorContext,
    domain: &Domain,
    reason: &str,
    message: &str,
) -> Result<(), wko_core::ApiError> {
    let ns = namespace(domain);
    let name = domain.metadata.name.clone().unwrap_or_default();
    let status = json!({
        "phase": DomainPhase::Failed,
        "reason": reason,
        "message": message,
        "lastUpdated": timestamp(ctx),
        "observedGeneration": domain.metadata.generation,
    });
    ctx.client
        .patch_status::<Domain>(&ns, &name, &json!({ "status": status }))
        .await
        .map(|_| ())
}
