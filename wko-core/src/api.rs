//! Cluster API failure representation.
//!
//! The engine does not depend on a particular Kubernetes client. Adapters
//! translate their client errors into [`ApiError`] so that the retry policy
//! can classify them uniformly.

use thiserror::Error;

/// A failed call against the cluster API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", self.describe())]
pub struct ApiError {
    /// HTTP status code, or `None` for transport-level failures.
    pub code: Option<u16>,
    /// Machine-readable reason (e.g. `Conflict`, `NotFound`).
    pub reason: String,
    /// Human-readable message.
    pub message: String,
}

impl ApiError {
    /// An error carrying an HTTP status.
    pub fn status(code: u16, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            reason: reason.into(),
            message: message.into(),
        }
    }

    /// A transport failure (connection refused, timeout, TLS error...).
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            code: None,
            reason: "Transport".to_string(),
            message: message.into(),
        }
    }

    /// `404 NotFound` for the named object.
    pub fn not_found(kind: &str, name: &str) -> Self {
        Self::status(404, "NotFound", format!("{} \"{}\" not found", kind, name))
    }

    /// `409 Conflict` for the named object.
    pub fn conflict(kind: &str, name: &str) -> Self {
        Self::status(
            409,
            "Conflict",
            format!(
                "Operation cannot be fulfilled on {} \"{}\": the object has been modified",
                kind, name
            ),
        )
    }

    /// Whether this is a 404.
    pub fn is_not_found(&self) -> bool {
        self.code == Some(404)
    }

    /// Whether this is a 409.
    pub fn is_conflict(&self) -> bool {
        self.code == Some(409)
    }

    fn describe(&self) -> String {
        match self.code {
            Some(code) => format!("{} ({}): {}", self.reason, code, self.message),
            None => format!("{}: {}", self.reason, self.message),
        }
    }
}
