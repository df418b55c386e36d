//! Reconciliation steps.
//!
//! Steps share state through well-known packet keys (see [`keys`]). Every
//! step that talks to the cluster hands API failures to the retry policy, so
//! a conflict or a transient error suspends the step and re-runs it instead
//! of failing the fiber.

pub mod common;
pub mod identity;
pub mod scale;
pub mod status;

use crate::controller::OperatorContext;
use crate::crd::Domain;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use wko_core::{ApiError, Failure, FailureKind, NextAction, Packet, StepError, StepResult};

/// Packet keys.
pub mod keys {
    /// The [`Domain`](crate::crd::Domain) being processed.
    pub const DOMAIN: &str = "domain";
    /// Last phase written to the Domain status.
    pub const PHASE: &str = "status.phase";
    /// Identity found or generated during bootstrap.
    pub const IDENTITY: &str = "identity";
    /// Where the identity came from.
    pub const IDENTITY_SOURCE: &str = "identity.source";
    /// Identity Secret as last read.
    pub const IDENTITY_SECRET: &str = "identity.secret";

    /// Routing set of a cluster.
    pub fn routing(cluster: &str) -> String {
        format!("routing.{}", cluster)
    }

    /// Pods observed before scaling a cluster.
    pub fn observed(cluster: &str) -> String {
        format!("scale.{}.observed", cluster)
    }

    /// Servers removed while scaling a cluster down.
    pub fn removed(cluster: &str) -> String {
        format!("scale.{}.removed", cluster)
    }

    /// Deadline of a wait.
    pub fn deadline(step: &str) -> String {
        format!("wait.{}.deadline", step)
    }
}

/// The Domain stored in the packet.
pub(crate) fn domain(packet: &Packet) -> Result<Arc<Domain>, StepError> {
    packet
        .get_arc::<Domain>(keys::DOMAIN)
        .ok_or_else(|| StepError::MissingPacketEntry(keys::DOMAIN.to_string()))
}

/// Namespace of a Domain.
pub(crate) fn namespace(domain: &Domain) -> String {
    domain.metadata.namespace.clone().unwrap_or_default()
}

/// Hand an API failure to the retry policy.
pub(crate) fn retry(ctx: &OperatorContext, packet: &mut Packet, scope: &str, err: &ApiError) -> StepResult {
    Ok(ctx.config.retry.on_failure(packet, scope, err).into_action())
}

/// Poll again, or fail once the wait's deadline has passed.
///
/// The deadline is stamped in the packet on the first poll so that it
/// survives suspension.
pub(crate) fn keep_waiting(
    ctx: &OperatorContext,
    packet: &mut Packet,
    step: &str,
    waiting_for: impl FnOnce() -> String,
) -> StepResult {
    let now = ctx.clock.now();
    let timeout = chrono::Duration::from_std(ctx.config.wait_timeout)
        .unwrap_or_else(|_| chrono::Duration::days(1));
    let deadline: Arc<DateTime<Utc>> = packet.get_or_insert_with(&keys::deadline(step), || now + timeout);

    if now >= *deadline {
        let message = format!(
            "timed out after {}s waiting for {}",
            ctx.config.wait_timeout.as_secs(),
            waiting_for()
        );
        tracing::warn!(step = %step, "{}", message);
        return Ok(NextAction::fail(
            Failure::new(FailureKind::Timeout, message).in_step(step),
        ));
    }
    Ok(NextAction::Suspend(ctx.config.poll_interval))
}

/// Forget a wait's deadline once it is satisfied.
pub(crate) fn wait_done(packet: &mut Packet, step: &str) {
    packet.remove(&keys::deadline(step));
}
