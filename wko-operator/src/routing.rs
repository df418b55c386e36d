//! Routing sets and traffic probes.
//!
//! A cluster's routing set is the ordered list of managed servers that
//! receive traffic. It must name exactly the servers believed live: a server
//! joins only after its pod is ready and its service exists, and leaves as
//! soon as its pod is gone (or before it is deleted, depending on the
//! scale-down policy).

use crate::error::{OperatorError, OperatorResult};
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::Request;
use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Ordered, duplicate-free set of routed server names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingSet {
    members: Vec<String>,
}

impl RoutingSet {
    /// An empty routing set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from names, dropping duplicates and keeping first occurrences.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = Self::new();
        for name in names {
            set.insert(name);
        }
        set
    }

    /// Parse the annotation form (`a,b,c`).
    pub fn from_annotation(value: &str) -> Self {
        Self::from_names(
            value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty()),
        )
    }

    /// Render the annotation form.
    pub fn to_annotation(&self) -> String {
        self.members.join(",")
    }

    /// Append a name. Returns `false` if it was already present.
    pub fn insert(&mut self, name: impl Into<String>) -> bool {
        let name = name.into();
        if self.contains(&name) {
            return false;
        }
        self.members.push(name);
        true
    }

    /// Remove a name. Returns `false` if it was absent.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.members.len();
        self.members.retain(|m| m != name);
        self.members.len() != before
    }

    /// Whether a name is routed.
    pub fn contains(&self, name: &str) -> bool {
        self.members.iter().any(|m| m == name)
    }

    /// Routed names in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.members.iter()
    }

    /// Routed names as a vector.
    pub fn to_vec(&self) -> Vec<String> {
        self.members.clone()
    }

    /// Number of routed servers.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether nothing is routed.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Where a probe sends traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    /// Namespace of the domain.
    pub namespace: String,
    /// Domain UID.
    pub domain_uid: String,
    /// Cluster name.
    pub cluster: String,
}

/// A boxed future for probe results.
pub type ProbeFuture<'a> = Pin<Box<dyn Future<Output = OperatorResult<BTreeSet<String>>> + Send + 'a>>;

/// Sends traffic at a cluster and reports which servers answered.
pub trait TrafficProbe: Send + Sync {
    /// Probe `target` and return the subset of `candidates` seen in responses.
    fn probe<'a>(&'a self, target: &'a ProbeTarget, candidates: &'a [String]) -> ProbeFuture<'a>;
}

/// Probe sending HTTP GETs through the cluster's load balancer.
///
/// The URL template may contain `{domainUID}`, `{cluster}` and `{namespace}`.
/// A server counts as seen when its name appears in a response body.
pub struct HttpTrafficProbe {
    url_template: String,
    attempts: u32,
    timeout: Duration,
}

impl HttpTrafficProbe {
    /// Create a probe sending up to `attempts` requests.
    pub fn new(url_template: impl Into<String>, attempts: u32) -> Self {
        Self {
            url_template: url_template.into(),
            attempts: attempts.max(1),
            timeout: Duration::from_secs(5),
        }
    }

    /// Set the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// URL for a target.
    pub fn url_for(&self, target: &ProbeTarget) -> String {
        self.url_template
            .replace("{domainUID}", &target.domain_uid)
            .replace("{cluster}", &target.cluster)
            .replace("{namespace}", &target.namespace)
    }

    async fn fetch(&self, url: &str) -> OperatorResult<String> {
        let uri: http::Uri = url
            .parse()
            .map_err(|e| OperatorError::HttpError(format!("Invalid probe URL '{}': {}", url, e)))?;

        let host = uri
            .host()
            .ok_or_else(|| OperatorError::HttpError(format!("Missing host in URL: {}", url)))?;
        let port = uri.port_u16().unwrap_or(80);
        let addr = format!("{}:{}", host, port);
        let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");

        let req = Request::builder()
            .method("GET")
            .uri(path)
            .header("Host", host)
            .header("User-Agent", "wko-operator/0.1")
            .header("Connection", "close")
            .body(Empty::<Bytes>::new())
            .map_err(|e| OperatorError::HttpError(format!("Failed to build request: {}", e)))?;

        let stream = tokio::net::TcpStream::connect(&addr)
            .await
            .map_err(|e| OperatorError::HttpError(format!("Failed to connect to {}: {}", addr, e)))?;
        let io = hyper_util::rt::TokioIo::new(stream);

        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| OperatorError::HttpError(format!("HTTP handshake failed: {}", e)))?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!(error = %e, "Probe connection error");
            }
        });

        let response = sender
            .send_request(req)
            .await
            .map_err(|e| OperatorError::HttpError(format!("Probe request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(OperatorError::HttpError(format!(
                "Probe endpoint returned status {}",
                response.status()
            )));
        }

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| OperatorError::HttpError(format!("Failed to read probe body: {}", e)))?
            .to_bytes();
        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}

/// Candidates appearing in `body` as whole tokens, so `c1-ms-10` answering
/// does not count as `c1-ms-1`.
fn servers_named_in(body: &str, candidates: &[String]) -> BTreeSet<String> {
    let tokens: BTreeSet<&str> = body
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '-' || c == '_'))
        .filter(|token| !token.is_empty())
        .collect();
    candidates
        .iter()
        .filter(|name| tokens.contains(name.as_str()))
        .cloned()
        .collect()
}

impl TrafficProbe for HttpTrafficProbe {
    fn probe<'a>(&'a self, target: &'a ProbeTarget, candidates: &'a [String]) -> ProbeFuture<'a> {
        Box::pin(async move {
            let url = self.url_for(target);
            let mut seen = BTreeSet::new();
            for attempt in 1..=self.attempts {
                match tokio::time::timeout(self.timeout, self.fetch(&url)).await {
                    Ok(Ok(body)) => seen.extend(servers_named_in(&body, candidates)),
                    Ok(Err(e)) => {
                        tracing::debug!(url = %url, attempt, error = %e, "Probe request failed");
                    }
                    Err(_) => {
                        tracing::debug!(url = %url, attempt, "Probe request timed out");
                    }
                }
                if candidates.iter().all(|c| seen.contains(c)) {
                    break;
                }
            }
            Ok(seen)
        })
    }
}
