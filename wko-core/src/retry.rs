//! Classification of cluster-API failures into retry decisions.
//!
//! | Condition | Class | Decision |
//! |---|---|---|
//! | 409 | [`ErrorClass::Conflict`] | retry after `conflict_delay`, at most `max_conflict_retries` times |
//! | 5xx, 429, transport | [`ErrorClass::Transient`] | exponential backoff, give up after `max_attempts` |
//! | 404 | [`ErrorClass::NotFound`] | terminal (callers usually branch on it first) |
//! | 401, 403, other 4xx | [`ErrorClass::Fatal`] | terminal |
//!
//! Attempt counters are kept in the [`Packet`] under a per-scope key so a
//! suspended step resumes with its retry budget intact.

use crate::api::ApiError;
use crate::error::{Failure, FailureKind};
use crate::packet::Packet;
use crate::step::NextAction;
use std::time::Duration;

/// Classification of an API failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Resource version conflict; re-read and retry quickly.
    Conflict,
    /// Server or transport failure; retry with backoff.
    Transient,
    /// Resource does not exist.
    NotFound,
    /// Not retryable.
    Fatal,
}

impl ErrorClass {
    /// Classify an API error.
    pub fn of(err: &ApiError) -> Self {
        match err.code {
            None => Self::Transient,
            Some(409) => Self::Conflict,
            Some(404) => Self::NotFound,
            Some(429) => Self::Transient,
            Some(code) if code >= 500 => Self::Transient,
            Some(_) => Self::Fatal,
        }
    }

    /// Whether errors of this class are retried.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Conflict | Self::Transient)
    }
}

/// What to do about a failed call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the delay.
    RetryAfter(Duration),
    /// Stop retrying.
    GiveUp(Failure),
}

impl RetryDecision {
    /// Translate into the engine directive for the current step.
    pub fn into_action(self) -> NextAction {
        match self {
            Self::RetryAfter(delay) => NextAction::Suspend(delay),
            Self::GiveUp(failure) => NextAction::fail(failure),
        }
    }
}

/// Per-scope attempt counters stored in the packet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Attempts {
    conflicts: u32,
    transient: u32,
}

/// Retry and backoff configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before retrying after a conflict.
    pub conflict_delay: Duration,
    /// Conflicts tolerated per scope before giving up.
    pub max_conflict_retries: u32,
    /// First backoff delay for transient failures.
    pub initial_backoff: Duration,
    /// Backoff ceiling.
    pub max_backoff: Duration,
    /// Backoff growth factor.
    pub multiplier: u32,
    /// Transient failures tolerated per scope before giving up.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            conflict_delay: Duration::from_millis(100),
            max_conflict_retries: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            multiplier: 2,
            max_attempts: 6,
        }
    }
}

impl RetryPolicy {
    /// Read the policy from `WKO_RETRY_*` environment variables, falling back
    /// to defaults for anything unset or unparsable.
    ///
    /// - `WKO_RETRY_CONFLICT_DELAY_MS`
    /// - `WKO_RETRY_MAX_CONFLICTS`
    /// - `WKO_RETRY_INITIAL_BACKOFF_MS`
    /// - `WKO_RETRY_MAX_BACKOFF_MS`
    /// - `WKO_RETRY_MAX_ATTEMPTS`
    pub fn from_env() -> Self {
        fn var<T: std::str::FromStr>(name: &str) -> Option<T> {
            std::env::var(name).ok().and_then(|s| s.parse::<T>().ok())
        }

        let defaults = Self::default();
        Self {
            conflict_delay: var::<u64>("WKO_RETRY_CONFLICT_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.conflict_delay),
            max_conflict_retries: var("WKO_RETRY_MAX_CONFLICTS")
                .unwrap_or(defaults.max_conflict_retries),
            initial_backoff: var::<u64>("WKO_RETRY_INITIAL_BACKOFF_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.initial_backoff),
            max_backoff: var::<u64>("WKO_RETRY_MAX_BACKOFF_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_backoff),
            multiplier: defaults.multiplier,
            max_attempts: var("WKO_RETRY_MAX_ATTEMPTS").unwrap_or(defaults.max_attempts),
        }
    }

    /// Set the conflict retry budget.
    pub fn with_max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries;
        self
    }

    /// Set the transient attempt budget.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Set the backoff bounds.
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max.max(initial);
        self
    }

    /// Backoff before the `attempt`-th retry (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = self.multiplier.max(1).saturating_pow(exponent);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// Decide how to handle `err` given the number of earlier failures of
    /// the same class (`previous`).
    pub fn decide(&self, err: &ApiError, previous: u32) -> RetryDecision {
        let attempt = previous + 1;
        match ErrorClass::of(err) {
            ErrorClass::Conflict if attempt <= self.max_conflict_retries => {
                RetryDecision::RetryAfter(self.conflict_delay)
            }
            ErrorClass::Transient if attempt < self.max_attempts => {
                RetryDecision::RetryAfter(self.backoff(attempt))
            }
            ErrorClass::Conflict | ErrorClass::Transient => RetryDecision::GiveUp(Failure::new(
                FailureKind::RetriesExhausted,
                format!("gave up after {} attempts: {}", attempt, err),
            )),
            ErrorClass::NotFound => {
                RetryDecision::GiveUp(Failure::new(FailureKind::NotFound, err.to_string()))
            }
            ErrorClass::Fatal => {
                RetryDecision::GiveUp(Failure::new(FailureKind::Fatal, err.to_string()))
            }
        }
    }

    /// Record a failure for `scope` in the packet and decide what to do.
    ///
    /// The returned failure, if any, is attributed to `scope`.
    pub fn on_failure(&self, packet: &mut Packet, scope: &str, err: &ApiError) -> RetryDecision {
        let key = Self::key(scope);
        let mut attempts = packet.get_cloned::<Attempts>(&key).unwrap_or_default();
        let class = ErrorClass::of(err);
        let previous = match class {
            ErrorClass::Conflict => attempts.conflicts,
            _ => attempts.transient,
        };

        let decision = match self.decide(err, previous) {
            RetryDecision::GiveUp(failure) => RetryDecision::GiveUp(failure.in_step(scope)),
            retry => retry,
        };

        match class {
            ErrorClass::Conflict => attempts.conflicts += 1,
            ErrorClass::Transient => attempts.transient += 1,
            _ => {}
        }
        packet.put(key, attempts);

        if let RetryDecision::RetryAfter(delay) = &decision {
            tracing::debug!(
                scope = %scope,
                error = %err,
                delay_ms = delay.as_millis() as u64,
                "Retrying cluster API call"
            );
        }
        decision
    }

    /// Failures recorded so far for `scope` (conflicts + transient).
    pub fn attempts(&self, packet: &Packet, scope: &str) -> u32 {
        packet
            .get::<Attempts>(&Self::key(scope))
            .map(|a| a.conflicts + a.transient)
            .unwrap_or(0)
    }

    /// Forget recorded failures for `scope` after a success.
    pub fn reset(&self, packet: &mut Packet, scope: &str) {
        packet.remove(&Self::key(scope));
    }

    fn key(scope: &str) -> String {
        format!("retry.{}", scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_table() {
        assert_eq!(ErrorClass::of(&ApiError::conflict("Secret", "s")), ErrorClass::Conflict);
        assert_eq!(ErrorClass::of(&ApiError::status(503, "Unavailable", "")), ErrorClass::Transient);
        assert_eq!(ErrorClass::of(&ApiError::transport("reset")), ErrorClass::Transient);
        assert_eq!(ErrorClass::of(&ApiError::not_found("Pod", "p")), ErrorClass::NotFound);
        assert_eq!(ErrorClass::of(&ApiError::status(403, "Forbidden", "")), ErrorClass::Fatal);
        assert_eq!(ErrorClass::of(&ApiError::status(401, "Unauthorized", "")), ErrorClass::Fatal);
        assert_eq!(ErrorClass::of(&ApiError::status(422, "Invalid", "")), ErrorClass::Fatal);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy::default()
            .with_backoff(Duration::from_millis(100), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(4), Duration::from_millis(800));
        assert_eq!(policy.backoff(5), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(40), Duration::from_millis(1_000));
    }

    #[test]
    fn transient_failures_exhaust_budget() {
        let policy = RetryPolicy::default().with_max_attempts(3);
        let mut packet = Packet::new();
        let err = ApiError::status(500, "InternalError", "boom");

        assert!(matches!(
            policy.on_failure(&mut packet, "ReadSecret", &err),
            RetryDecision::RetryAfter(_)
        ));
        assert!(matches!(
            policy.on_failure(&mut packet, "ReadSecret", &err),
            RetryDecision::RetryAfter(_)
        ));
        match policy.on_failure(&mut packet, "ReadSecret", &err) {
            RetryDecision::GiveUp(failure) => {
                assert_eq!(failure.kind, FailureKind::RetriesExhausted);
                assert_eq!(failure.step.as_deref(), Some("ReadSecret"));
            }
            other => panic!("expected give up, got {:?}", other),
        }
    }

    #[test]
    fn conflicts_use_their_own_budget() {
        let policy = RetryPolicy::default().with_max_conflict_retries(1);
        let mut packet = Packet::new();
        let conflict = ApiError::conflict("Secret", "webhook-secrets");

        assert_eq!(
            policy.on_failure(&mut packet, "Replace", &conflict),
            RetryDecision::RetryAfter(policy.conflict_delay)
        );
        assert!(matches!(
            policy.on_failure(&mut packet, "Replace", &conflict),
            RetryDecision::GiveUp(_)
        ));
        assert_eq!(policy.attempts(&packet, "Replace"), 2);

        policy.reset(&mut packet, "Replace");
        assert_eq!(policy.attempts(&packet, "Replace"), 0);
    }

    #[test]
    fn fatal_is_never_retried() {
        let policy = RetryPolicy::default();
        let mut packet = Packet::new();
        let decision = policy.on_failure(
            &mut packet,
            "CreatePod",
            &ApiError::status(403, "Forbidden", "pods is forbidden"),
        );
        match decision {
            RetryDecision::GiveUp(failure) => assert_eq!(failure.kind, FailureKind::Fatal),
            other => panic!("expected give up, got {:?}", other),
        }
    }
}
