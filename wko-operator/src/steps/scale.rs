//! Cluster scaling.
//!
//! Each cluster is scaled by its own child fiber running
//! `[ObserveCluster, PlanScale]`. `PlanScale` compares what was observed with
//! the cluster's replica limit and expands into the concrete chain:
//!
//! 1. sync the routing set if the ingress disagrees with the observed pods
//! 2. scale down surplus servers, highest index first, per [`ScaleDownPolicy`]
//! 3. ensure pods and services `1..=limit`, then check that no pod observed
//!    before scaling was recreated
//! 4. for each server in ascending order: wait for pod, readiness and service,
//!    then add it to the routing set
//! 5. verify traffic, if a probe is configured
//!
//! Failures leave everything already done in place. The next attempt
//! observes the cluster again and resumes from there.

use super::common::{
    await_server, delete_pod, delete_service, ensure_server, wait_pod_absent,
};
use super::{domain, keep_waiting, keys, namespace, retry, wait_done};
use crate::config::ScaleDownPolicy;
use crate::controller::OperatorContext;
use crate::crd::Domain;
use crate::resources::{
    build_routing_ingress, cluster_selector, ingress_name, is_pod_ready, LABEL_SERVER_NAME,
    ROUTING_SET_ANNOTATION,
};
use crate::routing::{ProbeTarget, RoutingSet};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::networking::v1::Ingress;
use std::collections::BTreeSet;
use std::sync::Arc;
use wko_core::{NextAction, Packet, Step, StepChain, StepError, StepFuture, StepResult};

/// A managed server pod seen before scaling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedPod {
    /// Server name.
    pub server_name: String,
    /// Index within the cluster (1-based).
    pub index: i32,
    /// Pod UID.
    pub uid: Option<String>,
    /// Pod creation timestamp.
    pub created: Option<DateTime<Utc>>,
    /// Whether the pod was ready.
    pub ready: bool,
}

/// Index of a managed server, parsed from `{cluster}-{base}{index}`.
fn server_index(domain: &Domain, cluster: &str, server_name: &str) -> Option<i32> {
    let prefix = format!("{}-{}", cluster, domain.spec.managed_server_name_base);
    server_name
        .strip_prefix(&prefix)?
        .parse::<i32>()
        .ok()
        .filter(|i| *i > 0)
}

async fn observe_pods(
    ctx: &OperatorContext,
    domain: &Domain,
    cluster: &str,
) -> Result<Vec<ObservedPod>, wko_core::ApiError> {
    let pods = ctx
        .client
        .list::<Pod>(
            &namespace(domain),
            Some(&cluster_selector(&domain.spec.domain_uid, cluster)),
        )
        .await?;
    let mut observed: Vec<ObservedPod> = pods
        .iter()
        .filter_map(|pod| {
            let server_name = pod.metadata.labels.as_ref()?.get(LABEL_SERVER_NAME)?.clone();
            let index = server_index(domain, cluster, &server_name)?;
            Some(ObservedPod {
                server_name,
                index,
                uid: pod.metadata.uid.clone(),
                created: pod.metadata.creation_timestamp.as_ref().map(|t| t.0),
                ready: is_pod_ready(pod),
            })
        })
        .collect();
    observed.sort_by_key(|p| p.index);
    Ok(observed)
}

fn ingress_routing(ingress: Option<&Ingress>) -> Option<RoutingSet> {
    ingress?
        .metadata
        .annotations
        .as_ref()?
        .get(ROUTING_SET_ANNOTATION)
        .map(|v| RoutingSet::from_annotation(v))
}

/// Record the cluster's pods and rebuild its routing set.
///
/// The routing set is the ingress annotation restricted to pods that still
/// exist, plus any ready pod it is missing.
pub struct ObserveCluster {
    ctx: Arc<OperatorContext>,
    cluster: String,
    name: String,
}

impl ObserveCluster {
    /// Create the step.
    pub fn new(ctx: Arc<OperatorContext>, cluster: impl Into<String>) -> Self {
        let cluster = cluster.into();
        Self {
            ctx,
            name: format!("ObserveCluster({})", cluster),
            cluster,
        }
    }
}

/// Marker stored when the ingress disagrees with the observed routing set.
#[derive(Debug, Clone, Copy)]
struct RoutingDirty;

fn dirty_key(cluster: &str) -> String {
    format!("{}.dirty", keys::routing(cluster))
}

impl Step for ObserveCluster {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply<'a>(&'a self, packet: &'a mut Packet) -> StepFuture<'a> {
        Box::pin(async move {
            let domain = domain(packet)?;
            let observed = match observe_pods(&self.ctx, &domain, &self.cluster).await {
                Ok(observed) => observed,
                Err(e) => return retry(&self.ctx, packet, &self.name, &e),
            };
            let ingress = match self
                .ctx
                .client
                .get_opt::<Ingress>(
                    &namespace(&domain),
                    &ingress_name(&domain.spec.domain_uid, &self.cluster),
                )
                .await
            {
                Ok(ingress) => ingress,
                Err(e) => return retry(&self.ctx, packet, &self.name, &e),
            };
            self.ctx.config.retry.reset(packet, &self.name);

            let recorded = ingress_routing(ingress.as_ref());
            let live: BTreeSet<&str> = observed.iter().map(|p| p.server_name.as_str()).collect();
            let mut routing = RoutingSet::from_names(
                recorded
                    .iter()
                    .flat_map(|set| set.iter())
                    .filter(|name| live.contains(name.as_str()))
                    .cloned(),
            );
            for pod in observed.iter().filter(|p| p.ready) {
                routing.insert(pod.server_name.clone());
            }

            let dirty = match &recorded {
                Some(recorded) => *recorded != routing,
                None => !routing.is_empty(),
            };
            tracing::debug!(
                cluster = %self.cluster,
                pods = observed.len(),
                routing = %routing.to_annotation(),
                dirty,
                "Observed cluster"
            );

            packet.put(keys::observed(&self.cluster), observed);
            packet.put(keys::routing(&self.cluster), routing);
            if dirty {
                packet.put(dirty_key(&self.cluster), RoutingDirty);
            }
            Ok(NextAction::Continue)
        })
    }
}

/// Expand into the scaling chain for the observed state.
pub struct PlanScale {
    ctx: Arc<OperatorContext>,
    cluster: String,
    name: String,
}

impl PlanScale {
    /// Create the step.
    pub fn new(ctx: Arc<OperatorContext>, cluster: impl Into<String>) -> Self {
        let cluster = cluster.into();
        Self {
            ctx,
            name: format!("PlanScale({})", cluster),
            cluster,
        }
    }

    fn routing(&self, change: RoutingChange) -> RoutingUpdate {
        RoutingUpdate::new(self.ctx.clone(), self.cluster.clone(), change)
    }

    fn scale_down(&self, surplus: &[String]) -> StepChain {
        let ctx = &self.ctx;
        let mut chain = StepChain::empty();
        match ctx.config.scale_down_policy {
            ScaleDownPolicy::DeleteThenDrain => {
                for server in surplus {
                    chain = chain
                        .push(delete_pod(ctx, server))
                        .push(delete_service(ctx, server));
                }
                for server in surplus {
                    chain = chain
                        .push(wait_pod_absent(ctx, server))
                        .push(self.routing(RoutingChange::Remove(server.clone())));
                }
            }
            ScaleDownPolicy::DrainBeforeDelete => {
                for server in surplus {
                    chain = chain
                        .push(self.routing(RoutingChange::Remove(server.clone())))
                        .push(delete_pod(ctx, server))
                        .push(delete_service(ctx, server))
                        .push(wait_pod_absent(ctx, server));
                }
            }
        }
        chain
    }
}

impl Step for PlanScale {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply<'a>(&'a self, packet: &'a mut Packet) -> StepFuture<'a> {
        Box::pin(async move {
            let domain = domain(packet)?;
            let observed = packet
                .get_arc::<Vec<ObservedPod>>(&keys::observed(&self.cluster))
                .ok_or_else(|| StepError::MissingPacketEntry(keys::observed(&self.cluster)))?;
            let limit = domain.spec.replica_limit(&self.cluster);

            let mut surplus: Vec<&ObservedPod> = observed.iter().filter(|p| p.index > limit).collect();
            surplus.sort_by(|a, b| b.index.cmp(&a.index));
            let surplus: Vec<String> = surplus.into_iter().map(|p| p.server_name.clone()).collect();
            let wanted: Vec<String> = (1..=limit)
                .map(|i| domain.spec.managed_server_name(&self.cluster, i))
                .collect();

            tracing::info!(
                domain = %domain.spec.domain_uid,
                cluster = %self.cluster,
                before = observed.len(),
                after = limit,
                "Scaling cluster"
            );

            let mut chain = StepChain::empty();
            if packet.remove(&dirty_key(&self.cluster)) {
                chain = chain.push(self.routing(RoutingChange::Sync));
            }
            chain = chain.then(self.scale_down(&surplus));

            for server in &wanted {
                chain = chain.then(ensure_server(
                    &self.ctx,
                    domain.spec.resolve_server(Some(&self.cluster), server),
                ));
            }
            chain = chain.push(VerifyPodsUnchanged {
                ctx: self.ctx.clone(),
                cluster: self.cluster.clone(),
                name: format!("VerifyPodsUnchanged({})", self.cluster),
            });
            for server in &wanted {
                chain = chain
                    .then(await_server(&self.ctx, server))
                    .push(self.routing(RoutingChange::Add(server.clone())));
            }
            if self.ctx.probe.is_some() {
                chain = chain.push(VerifyTraffic {
                    ctx: self.ctx.clone(),
                    cluster: self.cluster.clone(),
                    name: format!("VerifyTraffic({})", self.cluster),
                });
            }

            packet.put(keys::removed(&self.cluster), surplus);
            Ok(NextAction::Then(chain))
        })
    }
}

/// Fail if a pod observed before scaling, and still wanted, was recreated.
struct VerifyPodsUnchanged {
    ctx: Arc<OperatorContext>,
    cluster: String,
    name: String,
}

impl Step for VerifyPodsUnchanged {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply<'a>(&'a self, packet: &'a mut Packet) -> StepFuture<'a> {
        Box::pin(async move {
            let domain = domain(packet)?;
            let before = packet
                .get_arc::<Vec<ObservedPod>>(&keys::observed(&self.cluster))
                .ok_or_else(|| StepError::MissingPacketEntry(keys::observed(&self.cluster)))?;
            let now = match observe_pods(&self.ctx, &domain, &self.cluster).await {
                Ok(now) => now,
                Err(e) => return retry(&self.ctx, packet, &self.name, &e),
            };
            self.ctx.config.retry.reset(packet, &self.name);

            let limit = domain.spec.replica_limit(&self.cluster);
            if let Some((server_name, what)) = replaced_pod(&before, &now, limit) {
                return Err(StepError::Invariant(format!(
                    "pod of {} was {} while scaling cluster {}",
                    server_name, what, self.cluster
                )));
            }
            Ok(NextAction::Continue)
        })
    }
}

/// First pod within `limit` that disappeared or was recreated since `before`.
fn replaced_pod(
    before: &[ObservedPod],
    now: &[ObservedPod],
    limit: i32,
) -> Option<(String, &'static str)> {
    before
        .iter()
        .filter(|p| p.index <= limit)
        .find_map(|old| match now.iter().find(|p| p.server_name == old.server_name) {
            None => Some((old.server_name.clone(), "deleted")),
            Some(current) if current.uid != old.uid || current.created != old.created => {
                Some((old.server_name.clone(), "recreated"))
            }
            Some(_) => None,
        })
}

/// A change to a cluster's routing set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingChange {
    /// Route to a server.
    Add(String),
    /// Stop routing to a server.
    Remove(String),
    /// Write the set as observed.
    Sync,
}

/// Apply a routing change and publish the set to the cluster's ingress.
///
/// The ingress is re-read before every write and replaced at its latest
/// resourceVersion. The packet's set is updated only once the write
/// succeeded, so a retried step recomputes the same change.
pub struct RoutingUpdate {
    ctx: Arc<OperatorContext>,
    cluster: String,
    change: RoutingChange,
    name: String,
}

impl RoutingUpdate {
    /// Create the step.
    pub fn new(ctx: Arc<OperatorContext>, cluster: String, change: RoutingChange) -> Self {
        let name = match &change {
            RoutingChange::Add(server) => format!("RouteAdd({})", server),
            RoutingChange::Remove(server) => format!("RouteRemove({})", server),
            RoutingChange::Sync => format!("RouteSync({})", cluster),
        };
        Self {
            ctx,
            cluster,
            change,
            name,
        }
    }

    async fn publish(&self, domain: &Domain, routing: &RoutingSet) -> Result<(), wko_core::ApiError> {
        let ns = namespace(domain);
        let name = ingress_name(&domain.spec.domain_uid, &self.cluster);
        let mut desired = build_routing_ingress(domain, &self.cluster, routing);

        match self.ctx.client.get_opt::<Ingress>(&ns, &name).await? {
            Some(existing) => {
                desired.metadata.resource_version = existing.metadata.resource_version;
                self.ctx.client.replace(&ns, &name, &desired).await?;
            }
            None if routing.is_empty() => {}
            None => {
                self.ctx.client.create(&ns, &desired).await?;
            }
        }
        Ok(())
    }
}

impl Step for RoutingUpdate {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply<'a>(&'a self, packet: &'a mut Packet) -> StepFuture<'a> {
        Box::pin(async move {
            let domain = domain(packet)?;
            let key = keys::routing(&self.cluster);
            let mut routing = packet.get_cloned::<RoutingSet>(&key).unwrap_or_default();
            let changed = match &self.change {
                RoutingChange::Add(server) => routing.insert(server.clone()),
                RoutingChange::Remove(server) => routing.remove(server),
                RoutingChange::Sync => true,
            };
            if !changed {
                return Ok(NextAction::Continue);
            }

            if let Err(e) = self.publish(&domain, &routing).await {
                return retry(&self.ctx, packet, &self.name, &e);
            }
            self.ctx.config.retry.reset(packet, &self.name);

            tracing::info!(
                cluster = %self.cluster,
                routing = %routing.to_annotation(),
                "Routing set updated"
            );
            packet.put(key, routing);
            Ok(NextAction::Continue)
        })
    }
}

/// Wait until the probe reaches exactly the routing set.
///
/// Candidates include the servers removed by this scale so that traffic
/// still reaching one of them is noticed.
struct VerifyTraffic {
    ctx: Arc<OperatorContext>,
    cluster: String,
    name: String,
}

impl VerifyTraffic {
    fn satisfied(routing: &RoutingSet, seen: &BTreeSet<String>) -> bool {
        routing.len() == seen.len() && routing.iter().all(|name| seen.contains(name))
    }
}

impl Step for VerifyTraffic {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply<'a>(&'a self, packet: &'a mut Packet) -> StepFuture<'a> {
        Box::pin(async move {
            let Some(probe) = self.ctx.probe.clone() else {
                return Ok(NextAction::Continue);
            };
            let domain = domain(packet)?;
            let routing = packet
                .get_cloned::<RoutingSet>(&keys::routing(&self.cluster))
                .unwrap_or_default();
            let removed = packet
                .get_cloned::<Vec<String>>(&keys::removed(&self.cluster))
                .unwrap_or_default();

            let mut candidates = routing.to_vec();
            candidates.extend(removed.into_iter().filter(|name| !routing.contains(name)));
            let target = ProbeTarget {
                namespace: namespace(&domain),
                domain_uid: domain.spec.domain_uid.clone(),
                cluster: self.cluster.clone(),
            };

            let seen = match probe.probe(&target, &candidates).await {
                Ok(seen) => seen,
                Err(e) => {
                    tracing::debug!(cluster = %self.cluster, error = %e, "Traffic probe failed");
                    BTreeSet::new()
                }
            };
            if Self::satisfied(&routing, &seen) {
                wait_done(packet, &self.name);
                tracing::info!(cluster = %self.cluster, servers = seen.len(), "Traffic verified");
                return Ok(NextAction::Continue);
            }
            waiting(&self.ctx, packet, &self.name, &routing, &seen)
        })
    }
}

fn waiting(
    ctx: &OperatorContext,
    packet: &mut Packet,
    step: &str,
    routing: &RoutingSet,
    seen: &BTreeSet<String>,
) -> StepResult {
    keep_waiting(ctx, packet, step, || {
        format!(
            "traffic to reach [{}] (seen [{}])",
            routing.to_annotation(),
            seen.iter().cloned().collect::<Vec<_>>().join(",")
        )
    })
}

/// The per-cluster scaling chain.
pub fn scale_cluster(ctx: &Arc<OperatorContext>, cluster: &str) -> StepChain {
    StepChain::empty()
        .push(ObserveCluster::new(ctx.clone(), cluster))
        .push(PlanScale::new(ctx.clone(), cluster))
}

/// Fan out one scaling fiber per cluster and fail if any of them failed.
pub struct ScaleClusters {
    ctx: Arc<OperatorContext>,
}

impl ScaleClusters {
    /// Create the step.
    pub fn new(ctx: Arc<OperatorContext>) -> Self {
        Self { ctx }
    }
}

impl Step for ScaleClusters {
    fn name(&self) -> &str {
        "ScaleClusters"
    }

    fn apply<'a>(&'a self, packet: &'a mut Packet) -> StepFuture<'a> {
        Box::pin(async move {
            let domain = domain(packet)?;
            let children: Vec<StepChain> = domain
                .spec
                .cluster_names()
                .iter()
                .map(|cluster| scale_cluster(&self.ctx, cluster))
                .collect();
            Ok(NextAction::invoke(
                children,
                StepChain::from_steps([wko_core::step_fn("JoinClusters", |packet: &mut Packet| {
                    match packet.join_failure() {
                        Some(failure) => Ok(NextAction::fail(failure.clone())),
                        None => Ok(NextAction::Continue),
                    }
                })]),
            ))
        })
    }
}
