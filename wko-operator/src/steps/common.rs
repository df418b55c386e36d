//! Generic steps: ensure an object exists, wait for a condition, delete.

use super::{domain, keep_waiting, namespace, retry, wait_done};
use crate::client::TypedResource;
use crate::controller::OperatorContext;
use crate::crd::{Domain, EffectiveServerSpec};
use crate::resources::{self, is_pod_ready, job_completion, JobCompletion};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::Resource;
use std::marker::PhantomData;
use std::sync::Arc;
use wko_core::{Failure, FailureKind, NextAction, Packet, Step, StepChain, StepFuture};

/// Builds an object from the Domain in the packet.
pub type Build<K> = Arc<dyn Fn(&Domain) -> K + Send + Sync>;

/// Names an object from the Domain in the packet.
pub type NameOf = Arc<dyn Fn(&Domain) -> String + Send + Sync>;

/// Create an object unless it already exists.
///
/// Existence is checked in the watch cache first, then with a direct read.
/// Losing a create race (409) counts as success.
pub struct EnsureResource<K> {
    ctx: Arc<OperatorContext>,
    name: String,
    build: Build<K>,
    cluster_scoped: bool,
}

impl<K: TypedResource> EnsureResource<K> {
    /// Create the step.
    pub fn new(
        ctx: Arc<OperatorContext>,
        name: impl Into<String>,
        build: impl Fn(&Domain) -> K + Send + Sync + 'static,
    ) -> Self {
        Self {
            ctx,
            name: name.into(),
            build: Arc::new(build),
            cluster_scoped: false,
        }
    }

    /// The object is cluster-scoped.
    pub fn cluster_scoped(mut self) -> Self {
        self.cluster_scoped = true;
        self
    }
}

impl<K: TypedResource> Step for EnsureResource<K> {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply<'a>(&'a self, packet: &'a mut Packet) -> StepFuture<'a> {
        Box::pin(async move {
            let domain = domain(packet)?;
            let object = (self.build)(&domain);
            let object_name = object.meta().name.clone().unwrap_or_default();
            let ns = if self.cluster_scoped {
                String::new()
            } else {
                namespace(&domain)
            };
            let kind = K::kind(&()).to_string();

            if self.ctx.cache.get(&kind, &ns, &object_name).is_none() {
                match self.ctx.client.get_opt::<K>(&ns, &object_name).await {
                    Ok(Some(_)) => {
                        tracing::debug!(kind = %kind, name = %object_name, "Already exists");
                    }
                    Ok(None) => match self.ctx.client.create(&ns, &object).await {
                        Ok(_) => {
                            tracing::info!(kind = %kind, name = %object_name, namespace = %ns, "Created");
                        }
                        Err(e) if e.is_conflict() => {
                            tracing::debug!(kind = %kind, name = %object_name, "Created concurrently");
                        }
                        Err(e) => return retry(&self.ctx, packet, &self.name, &e),
                    },
                    Err(e) => return retry(&self.ctx, packet, &self.name, &e),
                }
            }

            self.ctx.config.retry.reset(packet, &self.name);
            Ok(NextAction::Continue)
        })
    }
}

/// Result of checking a waited-for condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Check {
    /// The condition holds.
    Satisfied,
    /// Not yet.
    Pending,
    /// The condition can no longer be reached.
    Failed(String),
}

/// Poll an object until a condition holds.
///
/// A satisfied check on the cached object short-circuits; otherwise the
/// object is read directly. Waits fail with a timeout once
/// `wait_timeout` has elapsed since the first poll.
pub struct WaitFor<K> {
    ctx: Arc<OperatorContext>,
    name: String,
    object_name: NameOf,
    describe: String,
    check: Arc<dyn Fn(Option<&K>) -> Check + Send + Sync>,
    _kind: PhantomData<fn() -> K>,
}

impl<K: TypedResource> WaitFor<K> {
    /// Create the step.
    pub fn new(
        ctx: Arc<OperatorContext>,
        name: impl Into<String>,
        describe: impl Into<String>,
        object_name: impl Fn(&Domain) -> String + Send + Sync + 'static,
        check: impl Fn(Option<&K>) -> Check + Send + Sync + 'static,
    ) -> Self {
        Self {
            ctx,
            name: name.into(),
            object_name: Arc::new(object_name),
            describe: describe.into(),
            check: Arc::new(check),
            _kind: PhantomData,
        }
    }
}

impl<K: TypedResource> Step for WaitFor<K> {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply<'a>(&'a self, packet: &'a mut Packet) -> StepFuture<'a> {
        Box::pin(async move {
            let domain = domain(packet)?;
            let ns = namespace(&domain);
            let object_name = (self.object_name)(&domain);
            let kind = K::kind(&()).to_string();

            let cached = self.ctx.cache.get_typed::<K>(&kind, &ns, &object_name);
            let check = match cached {
                Some(object) if (self.check)(Some(&object)) == Check::Satisfied => Check::Satisfied,
                _ => match self.ctx.client.get_opt::<K>(&ns, &object_name).await {
                    Ok(observed) => (self.check)(observed.as_ref()),
                    Err(e) => return retry(&self.ctx, packet, &self.name, &e),
                },
            };
            self.ctx.config.retry.reset(packet, &self.name);

            match check {
                Check::Satisfied => {
                    wait_done(packet, &self.name);
                    tracing::debug!(step = %self.name, "Condition met");
                    Ok(NextAction::Continue)
                }
                Check::Pending => keep_waiting(&self.ctx, packet, &self.name, || self.describe.clone()),
                Check::Failed(message) => Ok(NextAction::fail(
                    Failure::new(FailureKind::Fatal, message).in_step(&self.name),
                )),
            }
        })
    }
}

/// Delete an object if it exists.
pub struct DeleteResource<K> {
    ctx: Arc<OperatorContext>,
    name: String,
    object_name: NameOf,
    _kind: PhantomData<fn() -> K>,
}

impl<K: TypedResource> DeleteResource<K> {
    /// Create the step.
    pub fn new(
        ctx: Arc<OperatorContext>,
        name: impl Into<String>,
        object_name: impl Fn(&Domain) -> String + Send + Sync + 'static,
    ) -> Self {
        Self {
            ctx,
            name: name.into(),
            object_name: Arc::new(object_name),
            _kind: PhantomData,
        }
    }
}

impl<K: TypedResource> Step for DeleteResource<K> {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply<'a>(&'a self, packet: &'a mut Packet) -> StepFuture<'a> {
        Box::pin(async move {
            let domain = domain(packet)?;
            let ns = namespace(&domain);
            let object_name = (self.object_name)(&domain);

            match self.ctx.client.delete_if_exists::<K>(&ns, &object_name).await {
                Ok(existed) => {
                    if existed {
                        tracing::info!(kind = %K::kind(&()), name = %object_name, "Deleted");
                    }
                    self.ctx.config.retry.reset(packet, &self.name);
                    Ok(NextAction::Continue)
                }
                Err(e) => retry(&self.ctx, packet, &self.name, &e),
            }
        })
    }
}

fn server_object(server: &str) -> impl Fn(&Domain) -> String + Send + Sync + 'static {
    let server = server.to_string();
    move |domain: &Domain| domain.spec.server_object_name(&server)
}

/// Ensure a server's pod and service exist.
pub fn ensure_server(ctx: &Arc<OperatorContext>, server: EffectiveServerSpec) -> StepChain {
    let for_pod = server.clone();
    let name = server.server_name.clone();
    StepChain::empty()
        .push(EnsureResource::<Pod>::new(
            ctx.clone(),
            format!("EnsurePod({})", name),
            move |domain| resources::build_server_pod(domain, &for_pod),
        ))
        .push(EnsureResource::<Service>::new(
            ctx.clone(),
            format!("EnsureService({})", name),
            move |domain| resources::build_server_service(domain, &server),
        ))
}

/// Wait for a server's pod to exist.
pub fn wait_pod_exists(ctx: &Arc<OperatorContext>, server: &str) -> WaitFor<Pod> {
    WaitFor::new(
        ctx.clone(),
        format!("WaitPodExists({})", server),
        format!("pod of {} to exist", server),
        server_object(server),
        |pod: Option<&Pod>| if pod.is_some() { Check::Satisfied } else { Check::Pending },
    )
}

/// Wait for a server's pod to become ready.
pub fn wait_pod_ready(ctx: &Arc<OperatorContext>, server: &str) -> WaitFor<Pod> {
    WaitFor::new(
        ctx.clone(),
        format!("WaitPodReady({})", server),
        format!("pod of {} to become ready", server),
        server_object(server),
        |pod: Option<&Pod>| match pod {
            Some(pod) if is_pod_ready(pod) => Check::Satisfied,
            _ => Check::Pending,
        },
    )
}

/// Wait for a server's pod to be gone.
pub fn wait_pod_absent(ctx: &Arc<OperatorContext>, server: &str) -> WaitFor<Pod> {
    WaitFor::new(
        ctx.clone(),
        format!("WaitPodAbsent({})", server),
        format!("pod of {} to be deleted", server),
        server_object(server),
        |pod: Option<&Pod>| if pod.is_none() { Check::Satisfied } else { Check::Pending },
    )
}

/// Wait for a server's service to exist.
pub fn wait_service_exists(ctx: &Arc<OperatorContext>, server: &str) -> WaitFor<Service> {
    WaitFor::new(
        ctx.clone(),
        format!("WaitServiceExists({})", server),
        format!("service of {} to exist", server),
        server_object(server),
        |svc: Option<&Service>| if svc.is_some() { Check::Satisfied } else { Check::Pending },
    )
}

/// Wait for a server's pod, then its readiness, then its service.
pub fn await_server(ctx: &Arc<OperatorContext>, server: &str) -> StepChain {
    StepChain::empty()
        .push(wait_pod_exists(ctx, server))
        .push(wait_pod_ready(ctx, server))
        .push(wait_service_exists(ctx, server))
}

/// Delete a server's pod.
pub fn delete_pod(ctx: &Arc<OperatorContext>, server: &str) -> DeleteResource<Pod> {
    DeleteResource::new(ctx.clone(), format!("DeletePod({})", server), server_object(server))
}

/// Delete a server's service.
pub fn delete_service(ctx: &Arc<OperatorContext>, server: &str) -> DeleteResource<Service> {
    DeleteResource::new(
        ctx.clone(),
        format!("DeleteService({})", server),
        server_object(server),
    )
}

/// Wait for the domain creation job to finish. A failed job fails the wait.
pub fn wait_job_complete(ctx: &Arc<OperatorContext>) -> WaitFor<Job> {
    WaitFor::new(
        ctx.clone(),
        "WaitCreationJob",
        "domain creation job to complete",
        |domain: &Domain| resources::creation_job_name(&domain.spec.domain_uid),
        |job: Option<&Job>| match job.and_then(job_completion) {
            Some(JobCompletion::Succeeded) => Check::Satisfied,
            Some(JobCompletion::Failed(message)) => {
                Check::Failed(format!("domain creation job failed: {}", message))
            }
            None => Check::Pending,
        },
    )
}
