//! Domain processor: one make-right fiber per Domain.

use super::plan::make_right_plan;
use super::OperatorContext;
use crate::crd::Domain;
use crate::events::{reasons, EventType};
use crate::steps::identity::VerifyIdentity;
use crate::steps::keys;
use crate::steps::status::write_failed_status;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use kube::ResourceExt;
use std::fmt;
use std::sync::{Arc, Weak};
use wko_core::{
    Engine, FiberHandle, FiberState, NextAction, Packet, Step, StepChain, StepError, StepFuture,
};

/// Identifies a Domain by namespace and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DomainKey {
    /// Namespace.
    pub namespace: String,
    /// Name.
    pub name: String,
}

impl DomainKey {
    /// Create a key.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of a Domain object.
    pub fn of(domain: &Domain) -> Self {
        Self::new(domain.namespace().unwrap_or_default(), domain.name_any())
    }
}

impl fmt::Display for DomainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Runs make-right fibers, at most one live fiber per Domain.
///
/// Starting a new fiber for a Domain cancels the previous one first.
/// Outcomes are reported as events and, on failure, in the Domain status.
/// With `requeue_failures` set, a failed fiber is followed by another attempt
/// after the retry backoff for the number of consecutive failures.
pub struct DomainProcessor {
    ctx: Arc<OperatorContext>,
    engine: Engine,
    fibers: DashMap<DomainKey, FiberHandle>,
    generations: DashMap<DomainKey, i64>,
    failures: DashMap<DomainKey, u32>,
}

impl DomainProcessor {
    /// Create a processor.
    pub fn new(ctx: Arc<OperatorContext>, engine: Engine) -> Self {
        Self {
            ctx,
            engine,
            fibers: DashMap::new(),
            generations: DashMap::new(),
            failures: DashMap::new(),
        }
    }

    /// Shared context.
    pub fn context(&self) -> &Arc<OperatorContext> {
        &self.ctx
    }

    /// Start a make-right fiber for `domain`, cancelling any running one.
    pub fn make_right(self: &Arc<Self>, domain: &Domain) -> FiberHandle {
        let key = DomainKey::of(domain);
        let mut packet = Packet::new();
        packet.put(keys::DOMAIN, domain.clone());

        let chain = StepChain::from_steps([
            Arc::new(RecordStart {
                ctx: self.ctx.clone(),
            }) as Arc<dyn Step>,
            Arc::new(RunPlan {
                ctx: self.ctx.clone(),
                plan: make_right_plan(&self.ctx, domain),
            }),
        ]);
        let name = format!("make-right/{}", key);

        let handle = match self.fibers.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                if !entry.get().state().is_terminal() {
                    tracing::info!(domain = %key, "Cancelling previous make-right");
                }
                entry.get().cancel();
                let handle = self.engine.start(name, chain, packet);
                entry.insert(handle.clone());
                handle
            }
            Entry::Vacant(entry) => {
                let handle = self.engine.start(name, chain, packet);
                entry.insert(handle.clone());
                handle
            }
        };

        if let Some(generation) = domain.metadata.generation {
            self.generations.insert(key.clone(), generation);
        }
        if self.ctx.config.requeue_failures {
            self.watch_outcome(key, handle.clone());
        }
        handle
    }

    /// Requeue make-right once `handle` fails, unless a newer fiber has
    /// replaced it or the Domain was stopped in the meantime.
    fn watch_outcome(self: &Arc<Self>, key: DomainKey, handle: FiberHandle) {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let state = handle.join().await;
            let Some(this) = weak.upgrade() else { return };
            if !this.is_current(&key, &handle) {
                return;
            }
            if !matches!(state, FiberState::Failed(_)) {
                this.failures.remove(&key);
                return;
            }

            let failures = {
                let mut count = this.failures.entry(key.clone()).or_insert(0);
                *count += 1;
                *count
            };
            let delay = this.ctx.config.retry.backoff(failures);
            tracing::info!(
                domain = %key,
                failures,
                delay_ms = delay.as_millis() as u64,
                "Requeueing failed make-right"
            );
            let clock = this.ctx.clock.clone();
            drop(this);
            clock.sleep(delay).await;

            let Some(this) = weak.upgrade() else { return };
            if !this.is_current(&key, &handle) {
                return;
            }
            let domain = this
                .ctx
                .cache
                .get_typed::<Domain>("Domain", &key.namespace, &key.name)
                .or_else(|| {
                    handle
                        .take_packet()
                        .ok()
                        .and_then(|packet| packet.get_cloned::<Domain>(keys::DOMAIN))
                });
            match domain {
                Some(domain) => {
                    this.make_right(&domain);
                }
                None => tracing::warn!(domain = %key, "Domain unavailable, not requeueing"),
            }
        });
    }

    fn is_current(&self, key: &DomainKey, handle: &FiberHandle) -> bool {
        self.fibers
            .get(key)
            .map(|current| current.id() == handle.id())
            .unwrap_or(false)
    }

    /// React to a Domain being added or updated.
    ///
    /// Only a new generation starts a fiber, so status writes made by the
    /// operator itself do not retrigger processing.
    pub fn on_domain_applied(self: &Arc<Self>, domain: &Domain) -> Option<FiberHandle> {
        let key = DomainKey::of(domain);
        if let (Some(generation), Some(seen)) = (domain.metadata.generation, self.generations.get(&key)) {
            if generation <= *seen {
                tracing::trace!(domain = %key, generation, "Generation already processed");
                return None;
            }
        }
        Some(self.make_right(domain))
    }

    /// React to a managed pod or service disappearing.
    ///
    /// Runs make-right again unless a fiber is already working on the Domain.
    pub fn on_drift(self: &Arc<Self>, domain: &Domain) -> Option<FiberHandle> {
        let key = DomainKey::of(domain);
        if let Some(handle) = self.fibers.get(&key) {
            if !handle.state().is_terminal() {
                return None;
            }
        }
        tracing::info!(domain = %key, "Managed object removed, reprocessing");
        Some(self.make_right(domain))
    }

    /// React to a managed pod or service being modified.
    ///
    /// Only a Domain whose last fiber failed is reprocessed; a pod turning
    /// ready after its wait timed out lets the next attempt succeed.
    pub fn on_managed_change(self: &Arc<Self>, domain: &Domain) -> Option<FiberHandle> {
        let key = DomainKey::of(domain);
        let failed = self
            .fibers
            .get(&key)
            .map(|handle| matches!(handle.state(), FiberState::Failed(_)))
            .unwrap_or(false);
        if !failed {
            return None;
        }
        tracing::info!(domain = %key, "Managed object changed after a failure, reprocessing");
        Some(self.make_right(domain))
    }

    /// Stop processing a deleted Domain.
    pub fn stop(&self, namespace: &str, name: &str) {
        let key = DomainKey::new(namespace, name);
        if let Some((_, handle)) = self.fibers.remove(&key) {
            handle.cancel();
            tracing::info!(domain = %key, "Stopped processing");
        }
        self.generations.remove(&key);
        self.failures.remove(&key);
    }

    /// Cancel every fiber.
    pub fn shutdown(&self) {
        for entry in self.fibers.iter() {
            entry.value().cancel();
        }
    }

    /// Current fiber of a Domain, if any.
    pub fn fiber(&self, namespace: &str, name: &str) -> Option<FiberHandle> {
        self.fibers
            .get(&DomainKey::new(namespace, name))
            .map(|h| h.value().clone())
    }

    /// Number of fibers that have not finished.
    pub fn active_count(&self) -> usize {
        self.fibers
            .iter()
            .filter(|entry| !entry.value().state().is_terminal())
            .count()
    }
}

fn packet_domain(packet: &Packet) -> Result<Arc<Domain>, StepError> {
    packet
        .get_arc::<Domain>(keys::DOMAIN)
        .ok_or_else(|| StepError::MissingPacketEntry(keys::DOMAIN.to_string()))
}

struct RecordStart {
    ctx: Arc<OperatorContext>,
}

impl Step for RecordStart {
    fn name(&self) -> &str {
        "RecordStart"
    }

    fn apply<'a>(&'a self, packet: &'a mut Packet) -> StepFuture<'a> {
        Box::pin(async move {
            let domain = packet_domain(packet)?;
            tracing::info!(
                domain = %domain.spec.domain_uid,
                generation = ?domain.metadata.generation,
                "Processing domain"
            );
            self.ctx
                .events
                .domain_event(
                    &domain,
                    EventType::Normal,
                    reasons::DOMAIN_PROCESSING_STARTING,
                    &format!("Processing domain {}", domain.spec.domain_uid),
                )
                .await;
            Ok(NextAction::Continue)
        })
    }
}

/// Runs the plan as a child fiber so its outcome can be reported.
struct RunPlan {
    ctx: Arc<OperatorContext>,
    plan: StepChain,
}

impl Step for RunPlan {
    fn name(&self) -> &str {
        "RunPlan"
    }

    fn apply<'a>(&'a self, _packet: &'a mut Packet) -> StepFuture<'a> {
        Box::pin(async move {
            Ok(NextAction::invoke(
                vec![self.plan.clone()],
                StepChain::single(ReportOutcome {
                    ctx: self.ctx.clone(),
                }),
            ))
        })
    }
}

struct ReportOutcome {
    ctx: Arc<OperatorContext>,
}

impl Step for ReportOutcome {
    fn name(&self) -> &str {
        "ReportOutcome"
    }

    fn apply<'a>(&'a self, packet: &'a mut Packet) -> StepFuture<'a> {
        Box::pin(async move {
            let domain = packet_domain(packet)?;
            let uid = &domain.spec.domain_uid;

            let Some(failure) = packet.join_failure().cloned() else {
                self.ctx
                    .events
                    .domain_event(
                        &domain,
                        EventType::Normal,
                        reasons::DOMAIN_PROCESSING_COMPLETED,
                        &format!("Domain {} is ready", uid),
                    )
                    .await;
                return Ok(NextAction::Continue);
            };

            let message = failure.to_string();
            self.ctx
                .events
                .domain_event(
                    &domain,
                    EventType::Warning,
                    reasons::DOMAIN_PROCESSING_FAILED,
                    &message,
                )
                .await;
            let reason = format!("{:?}", failure.kind);
            if let Err(e) = write_failed_status(&self.ctx, &domain, &reason, &failure.message).await {
                tracing::warn!(domain = %uid, error = %e, "Failed to record failure in status");
            }
            Ok(NextAction::fail(failure))
        })
    }
}

/// Establish the webhook identity before any Domain is processed.
///
/// A failure is logged and recorded as an event; it never aborts start-up.
pub async fn bootstrap_identity(engine: &Engine, ctx: &Arc<OperatorContext>) -> FiberState {
    let (state, _) = engine
        .run(
            "identity-bootstrap",
            StepChain::single(VerifyIdentity::new(ctx.clone())),
            Packet::new(),
        )
        .await;
    match &state {
        FiberState::Completed => tracing::info!("Webhook identity ready"),
        FiberState::Failed(failure) => {
            tracing::error!(failure = %failure, "Continuing without a webhook identity")
        }
        other => tracing::warn!(state = ?other, "Identity bootstrap did not complete"),
    }
    state
}
