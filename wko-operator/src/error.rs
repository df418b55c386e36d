//! Error types for the WKO domain operator.

use thiserror::Error;
use wko_core::{ApiError, StepError};

/// Errors that can occur during operator operations.
#[derive(Debug, Error)]
pub enum OperatorError {
    /// Kubernetes client error.
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Cluster API call failed.
    #[error("Cluster API error: {0}")]
    Api(#[from] ApiError),

    /// Resource not found.
    #[error("Resource not found: {kind}/{name} in namespace {namespace}")]
    NotFound {
        /// Resource kind.
        kind: String,
        /// Resource name.
        name: String,
        /// Resource namespace.
        namespace: String,
    },

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Domain validation error.
    #[error("Domain validation failed: {0}")]
    ValidationError(String),

    /// Reconciliation error.
    #[error("Reconciliation failed for {kind}/{name}: {cause}")]
    ReconcileError {
        /// Resource kind.
        kind: String,
        /// Resource name.
        name: String,
        /// Error cause.
        cause: String,
    },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// IO error.
    #[error("IO error: {0}")]
    IoError(String),

    /// HTTP error.
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Key or certificate generation failed.
    #[error("Identity error: {0}")]
    IdentityError(String),
}

/// Result type for operator operations.
pub type OperatorResult<T> = Result<T, OperatorError>;

impl From<serde_json::Error> for OperatorError {
    fn from(err: serde_json::Error) -> Self {
        OperatorError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for OperatorError {
    fn from(err: serde_yaml::Error) -> Self {
        OperatorError::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for OperatorError {
    fn from(err: std::io::Error) -> Self {
        OperatorError::IoError(err.to_string())
    }
}

impl From<rcgen::Error> for OperatorError {
    fn from(err: rcgen::Error) -> Self {
        OperatorError::IdentityError(err.to_string())
    }
}

impl From<OperatorError> for StepError {
    fn from(err: OperatorError) -> Self {
        match err {
            OperatorError::Api(api) => StepError::Api(api),
            OperatorError::SerializationError(msg) => StepError::Serialization(msg),
            OperatorError::ValidationError(msg) => StepError::Invariant(msg),
            other => StepError::Other(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_errors_keep_their_status_in_steps() {
        let err = OperatorError::from(ApiError::conflict("Secret", "webhook-secrets"));
        match StepError::from(err) {
            StepError::Api(api) => assert!(api.is_conflict()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn serde_errors_become_serialization() {
        let err: OperatorError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, OperatorError::SerializationError(_)));
    }
}
