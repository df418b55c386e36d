//! Operator configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use wko_core::{EngineConfig, RetryPolicy};

/// Default directory holding the operator's webhook identity.
pub const DEFAULT_IDENTITY_DIR: &str = "/deployment/webhook-identity";

/// Order of operations when a cluster shrinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScaleDownPolicy {
    /// Delete every surplus pod, then wait for each one (highest index first)
    /// to disappear before removing it from the routing set.
    #[default]
    DeleteThenDrain,
    /// Remove each surplus server (highest index first) from the routing set
    /// before deleting its pod.
    DrainBeforeDelete,
}

impl FromStr for ScaleDownPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "deletethendrain" => Ok(Self::DeleteThenDrain),
            "drainbeforedelete" => Ok(Self::DrainBeforeDelete),
            other => Err(format!("unknown scale-down policy: {}", other)),
        }
    }
}

/// Configuration for the operator.
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Namespace the operator runs in (identity Secret, bootstrap events).
    pub namespace: String,
    /// Engine configuration.
    pub engine: EngineConfig,
    /// Retry policy for cluster API calls.
    pub retry: RetryPolicy,
    /// Delay between polls while waiting on cluster state.
    pub poll_interval: Duration,
    /// Deadline for a single wait (pod ready, job complete, ...).
    pub wait_timeout: Duration,
    /// Scale-down ordering.
    pub scale_down_policy: ScaleDownPolicy,
    /// Traffic probe URL template (`{domainUID}` and `{cluster}` are substituted).
    pub probe_url: Option<String>,
    /// Number of requests a traffic probe sends.
    pub probe_attempts: u32,
    /// Directory holding the webhook key and certificate.
    pub identity_dir: PathBuf,
    /// Start another make-right after a failed one, delayed by the retry backoff.
    pub requeue_failures: bool,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: "weblogic-operator".to_string(),
            engine: EngineConfig::default(),
            retry: RetryPolicy::default(),
            poll_interval: Duration::from_secs(2),
            wait_timeout: Duration::from_secs(300),
            scale_down_policy: ScaleDownPolicy::default(),
            probe_url: None,
            probe_attempts: 50,
            identity_dir: PathBuf::from(DEFAULT_IDENTITY_DIR),
            requeue_failures: true,
        }
    }
}

impl OperatorConfig {
    /// Create configuration from environment variables.
    ///
    /// Reads the following environment variables:
    /// - `WKO_NAMESPACE`: operator namespace
    /// - `WKO_MAX_CONCURRENT_STEPS`, `WKO_MAX_STEPS_PER_FIBER`: engine limits
    /// - `WKO_RETRY_*`: retry policy (see [`RetryPolicy::from_env`])
    /// - `WKO_POLL_INTERVAL_MS`: wait poll interval
    /// - `WKO_WAIT_TIMEOUT_SECS`: wait deadline
    /// - `WKO_SCALE_DOWN_POLICY`: `delete-then-drain` or `drain-before-delete`
    /// - `WKO_PROBE_URL`: traffic probe URL template
    /// - `WKO_PROBE_ATTEMPTS`: requests per probe
    /// - `WKO_IDENTITY_DIR`: webhook identity directory
    /// - `WKO_REQUEUE_FAILURES`: `false` disables requeueing failed make-rights
    ///
    /// # Example
    ///
    /// ```bash
    /// export WKO_NAMESPACE=weblogic-operator
    /// export WKO_SCALE_DOWN_POLICY=drain-before-delete
    /// export WKO_PROBE_URL='http://{domainUID}-{cluster}.default.svc:8001/testwebapp/'
    /// ```
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let namespace = std::env::var("WKO_NAMESPACE").unwrap_or(defaults.namespace);

        let poll_interval = std::env::var("WKO_POLL_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.poll_interval);

        let wait_timeout = std::env::var("WKO_WAIT_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.wait_timeout);

        let scale_down_policy = match std::env::var("WKO_SCALE_DOWN_POLICY") {
            Ok(value) => value.parse().unwrap_or_else(|e: String| {
                tracing::warn!(error = %e, "Ignoring WKO_SCALE_DOWN_POLICY");
                ScaleDownPolicy::default()
            }),
            Err(_) => ScaleDownPolicy::default(),
        };

        let probe_attempts = std::env::var("WKO_PROBE_ATTEMPTS")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(defaults.probe_attempts);

        Self {
            namespace,
            engine: EngineConfig::from_env(),
            retry: RetryPolicy::from_env(),
            poll_interval,
            wait_timeout,
            scale_down_policy,
            probe_url: std::env::var("WKO_PROBE_URL").ok().filter(|s| !s.is_empty()),
            probe_attempts,
            identity_dir: std::env::var("WKO_IDENTITY_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.identity_dir),
            requeue_failures: std::env::var("WKO_REQUEUE_FAILURES")
                .ok()
                .and_then(|s| s.parse::<bool>().ok())
                .unwrap_or(defaults.requeue_failures),
        }
    }

    /// Set the operator namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the wait poll interval and deadline.
    pub fn with_waits(mut self, poll_interval: Duration, wait_timeout: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.wait_timeout = wait_timeout;
        self
    }

    /// Set the scale-down policy.
    pub fn with_scale_down_policy(mut self, policy: ScaleDownPolicy) -> Self {
        self.scale_down_policy = policy;
        self
    }

    /// Enable or disable requeueing failed make-rights.
    pub fn with_failure_requeue(mut self, enabled: bool) -> Self {
        self.requeue_failures = enabled;
        self
    }

    /// Set the identity directory.
    pub fn with_identity_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.identity_dir = dir.into();
        self
    }

    /// Path of the webhook private key.
    pub fn identity_key_path(&self) -> PathBuf {
        self.identity_dir.join("webhookKey")
    }

    /// Path of the webhook certificate.
    pub fn identity_cert_path(&self) -> PathBuf {
        self.identity_dir.join("webhookCert")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scale_down_policy_parsing() {
        assert_eq!(
            "delete-then-drain".parse::<ScaleDownPolicy>().unwrap(),
            ScaleDownPolicy::DeleteThenDrain
        );
        assert_eq!(
            "DRAIN_BEFORE_DELETE".parse::<ScaleDownPolicy>().unwrap(),
            ScaleDownPolicy::DrainBeforeDelete
        );
        assert!("sideways".parse::<ScaleDownPolicy>().is_err());
    }

    #[test]
    fn identity_paths_use_fixed_file_names() {
        let config = OperatorConfig::default();
        assert_eq!(
            config.identity_key_path(),
            PathBuf::from("/deployment/webhook-identity/webhookKey")
        );
        assert_eq!(
            config.identity_cert_path(),
            PathBuf::from("/deployment/webhook-identity/webhookCert")
        );
    }
}
