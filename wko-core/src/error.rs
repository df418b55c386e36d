//! Error and failure types for the execution engine.

use crate::api::ApiError;
use thiserror::Error;

/// Errors raised by the engine itself rather than by a step.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// The worker pool was shut down while a fiber still had steps to run.
    #[error("Worker pool is closed")]
    PoolClosed,

    /// The fiber has not reached a terminal state yet.
    #[error("Fiber {0} has not finished")]
    NotFinished(String),

    /// The fiber's final packet was already taken.
    #[error("Packet of fiber {0} was already taken")]
    PacketTaken(String),
}

/// Result type for engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Errors a step may return from [`Step::apply`](crate::Step::apply).
///
/// Returning an error is equivalent to returning
/// `NextAction::Done(Outcome::Failure(..))`; the fiber records it as the
/// failure detail.
#[derive(Debug, Clone, Error)]
pub enum StepError {
    /// Cluster API call failed and the step chose not to retry.
    #[error("API error: {0}")]
    Api(#[from] ApiError),

    /// Filesystem operation failed.
    #[error("IO error on {path}: {message}")]
    Io {
        /// Path involved.
        path: String,
        /// Error message.
        message: String,
    },

    /// A packet entry the step depends on was not written by an earlier step.
    #[error("Missing packet entry: {0}")]
    MissingPacketEntry(String),

    /// Observed state violates an invariant the step relies on.
    #[error("Invariant violated: {0}")]
    Invariant(String),

    /// Serialization of a resource failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Any other failure.
    #[error("{0}")]
    Other(String),
}

impl StepError {
    /// Build an IO error for a path.
    pub fn io(path: impl Into<String>, err: &std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            message: err.to_string(),
        }
    }
}

/// Category of a terminal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// A resource that must exist was not found.
    NotFound,
    /// Permission denied, authentication failure or another non-retryable API error.
    Fatal,
    /// Retryable errors persisted past the configured attempt budget.
    RetriesExhausted,
    /// A wait did not observe the expected state before its deadline.
    Timeout,
    /// The step panicked.
    Panicked,
    /// The step returned an error.
    StepError,
}

/// Terminal failure detail carried by a fiber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    /// Failure category.
    pub kind: FailureKind,
    /// Name of the step that failed, when known.
    pub step: Option<String>,
    /// Human-readable detail.
    pub message: String,
}

impl Failure {
    /// Create a failure of the given kind.
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            step: None,
            message: message.into(),
        }
    }

    /// Attribute the failure to a step.
    pub fn in_step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }

    /// Failure from a step error.
    pub fn from_step_error(step: &str, err: &StepError) -> Self {
        let kind = match err {
            StepError::Api(api) if api.is_not_found() => FailureKind::NotFound,
            StepError::Api(_) => FailureKind::Fatal,
            _ => FailureKind::StepError,
        };
        Self::new(kind, err.to_string()).in_step(step)
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.step {
            Some(step) => write!(f, "[{:?}] {}: {}", self.kind, step, self.message),
            None => write!(f, "[{:?}] {}", self.kind, self.message),
        }
    }
}
