//! Domain Custom Resource Definition.
//!
//! A Domain describes a clustered application server topology: one admin
//! server plus any number of clusters of managed servers, optionally created
//! on a persistent volume by a one-shot job.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Domain is the Schema for the domains API.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "weblogic.oracle",
    version = "v2",
    kind = "Domain",
    plural = "domains",
    shortname = "dom",
    namespaced,
    status = "DomainStatus",
    printcolumn = r#"{"name":"UID", "type":"string", "jsonPath":".spec.domainUID"}"#,
    printcolumn = r#"{"name":"Replicas", "type":"integer", "jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DomainSpec {
    /// Unique identifier of the domain, used to prefix every generated object.
    #[serde(rename = "domainUID")]
    pub domain_uid: String,

    /// Name of the domain inside the application server configuration.
    pub domain_name: String,

    /// Name of the admin server.
    #[serde(default = "default_admin_server_name")]
    pub admin_server_name: String,

    /// Listen port of the admin server.
    #[serde(default = "default_admin_port")]
    pub admin_port: i32,

    /// Secret holding the admin credentials.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_secret: Option<String>,

    /// Domain-wide default replica count for clusters.
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Server image.
    #[serde(default = "default_image")]
    pub image: String,

    /// Image pull policy.
    #[serde(default = "default_image_pull_policy")]
    pub image_pull_policy: String,

    /// Prefix of managed server names inside a cluster (`{cluster}-{base}{index}`).
    #[serde(default = "default_managed_server_name_base")]
    pub managed_server_name_base: String,

    /// Listen port of managed servers.
    #[serde(default = "default_managed_server_port")]
    pub managed_server_port: i32,

    /// Per-cluster overrides.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cluster_startup: Vec<ClusterStartup>,

    /// Per-server overrides.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub server_startup: Vec<ServerStartup>,

    /// Which servers to start: NONE, ADMIN, SPECIFIED, AUTO or ALL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup_control: Option<String>,

    /// Create the domain home on a persistent volume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<DomainStorage>,
}

fn default_admin_server_name() -> String {
    "admin-server".to_string()
}

fn default_admin_port() -> i32 {
    7001
}

fn default_replicas() -> i32 {
    1
}

fn default_image() -> String {
    "container-registry.oracle.com/middleware/weblogic:12.2.1.4".to_string()
}

fn default_image_pull_policy() -> String {
    "IfNotPresent".to_string()
}

fn default_managed_server_name_base() -> String {
    "ms-".to_string()
}

fn default_managed_server_port() -> i32 {
    8001
}

/// Environment variable passed to a server container.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct EnvVarSpec {
    /// Variable name.
    pub name: String,
    /// Variable value.
    #[serde(default)]
    pub value: String,
}

/// Per-cluster startup overrides.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStartup {
    /// Cluster name.
    pub cluster_name: String,

    /// Replica count for this cluster; falls back to the domain default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Desired state of the cluster's servers (RUNNING, ADMIN).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_state: Option<String>,

    /// Environment for the cluster's servers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVarSpec>,

    /// Node port exposed for the cluster's servers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_port: Option<i32>,
}

/// Per-server startup overrides.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerStartup {
    /// Server name.
    pub server_name: String,

    /// Desired state of the server (RUNNING, ADMIN).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_state: Option<String>,

    /// Environment for the server.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVarSpec>,

    /// Node port exposed for the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_port: Option<i32>,
}

/// Domain-on-PV settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DomainStorage {
    /// Host path backing the persistent volume.
    #[serde(default = "default_host_path")]
    pub host_path: String,

    /// Requested storage size.
    #[serde(default = "default_storage_size")]
    pub size: String,

    /// Image running the domain creation job; defaults to the server image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_image: Option<String>,

    /// Name of the cluster created by the job.
    #[serde(default = "default_creation_cluster")]
    pub cluster_name: String,

    /// Number of managed servers configured by the job.
    #[serde(default = "default_configured_servers")]
    pub configured_managed_servers: i32,
}

fn default_host_path() -> String {
    "/scratch/domains".to_string()
}

fn default_storage_size() -> String {
    "5Gi".to_string()
}

fn default_creation_cluster() -> String {
    "cluster-1".to_string()
}

fn default_configured_servers() -> i32 {
    4
}

/// Which servers the operator starts.
///
/// `Specified`, `Auto` and `All` behave alike: the admin server plus every
/// clustered managed server up to its replica count. Standalone servers
/// listed only in `serverStartup` are never started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupControl {
    /// Start nothing.
    None,
    /// Start only the admin server.
    Admin,
    /// Same as `Auto`.
    Specified,
    /// Start the admin server and every cluster (default).
    Auto,
    /// Same as `Auto`.
    All,
}

impl StartupControl {
    /// Whether the admin server is started.
    pub fn starts_admin(self) -> bool {
        !matches!(self, Self::None)
    }

    /// Whether clustered managed servers are started.
    pub fn starts_clusters(self) -> bool {
        matches!(self, Self::Specified | Self::Auto | Self::All)
    }
}

impl FromStr for StartupControl {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NONE" => Ok(Self::None),
            "ADMIN" => Ok(Self::Admin),
            "SPECIFIED" => Ok(Self::Specified),
            "AUTO" => Ok(Self::Auto),
            "ALL" => Ok(Self::All),
            other => Err(format!("unknown startupControl: {}", other)),
        }
    }
}

impl fmt::Display for StartupControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "NONE",
            Self::Admin => "ADMIN",
            Self::Specified => "SPECIFIED",
            Self::Auto => "AUTO",
            Self::All => "ALL",
        };
        f.write_str(s)
    }
}

/// Effective settings of one server after applying overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveServerSpec {
    /// Server name.
    pub server_name: String,
    /// Owning cluster, if clustered.
    pub cluster_name: Option<String>,
    /// Desired state (RUNNING unless overridden).
    pub desired_state: String,
    /// Environment.
    pub env: Vec<EnvVarSpec>,
    /// Node port, if exposed.
    pub node_port: Option<i32>,
}

impl DomainSpec {
    fn server_startup(&self, server_name: &str) -> Option<&ServerStartup> {
        self.server_startup
            .iter()
            .find(|s| s.server_name == server_name)
    }

    /// Overrides for a cluster, if any.
    pub fn cluster_startup(&self, cluster_name: &str) -> Option<&ClusterStartup> {
        self.cluster_startup
            .iter()
            .find(|c| c.cluster_name == cluster_name)
    }

    /// Effective spec of a server: server override, then cluster override,
    /// then domain default, field by field.
    pub fn resolve_server(&self, cluster_name: Option<&str>, server_name: &str) -> EffectiveServerSpec {
        let server = self.server_startup(server_name);
        let cluster = cluster_name.and_then(|c| self.cluster_startup(c));

        let desired_state = server
            .and_then(|s| s.desired_state.clone())
            .or_else(|| cluster.and_then(|c| c.desired_state.clone()))
            .unwrap_or_else(|| "RUNNING".to_string());

        let env = match (server, cluster) {
            (Some(s), _) if !s.env.is_empty() => s.env.clone(),
            (_, Some(c)) => c.env.clone(),
            _ => Vec::new(),
        };

        let node_port = server
            .and_then(|s| s.node_port)
            .or_else(|| cluster.and_then(|c| c.node_port));

        EffectiveServerSpec {
            server_name: server_name.to_string(),
            cluster_name: cluster_name.map(str::to_string),
            desired_state,
            env,
            node_port,
        }
    }

    /// Effective spec of the admin server.
    pub fn admin_server(&self) -> EffectiveServerSpec {
        self.resolve_server(None, &self.admin_server_name)
    }

    /// Replica limit of a cluster: its override if present, else the domain default.
    pub fn replica_limit(&self, cluster_name: &str) -> i32 {
        self.cluster_startup(cluster_name)
            .and_then(|c| c.replicas)
            .unwrap_or(self.replicas)
            .max(0)
    }

    /// Startup control, defaulting to AUTO. Unknown values fall back to AUTO.
    pub fn startup_control(&self) -> StartupControl {
        self.startup_control
            .as_deref()
            .and_then(|s| s.parse().ok())
            .unwrap_or(StartupControl::Auto)
    }

    /// Clusters the operator manages, in declaration order.
    pub fn cluster_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .cluster_startup
            .iter()
            .map(|c| c.cluster_name.clone())
            .collect();
        if let Some(storage) = &self.storage {
            if !names.contains(&storage.cluster_name) {
                names.push(storage.cluster_name.clone());
            }
        }
        names
    }

    /// Name of the `index`-th managed server (1-based) of a cluster.
    pub fn managed_server_name(&self, cluster_name: &str, index: i32) -> String {
        format!("{}-{}{}", cluster_name, self.managed_server_name_base, index)
    }

    /// Kubernetes object name for a server's pod and service.
    pub fn server_object_name(&self, server_name: &str) -> String {
        format!("{}-{}", self.domain_uid, server_name)
    }
}

/// Domain status.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DomainStatus {
    /// Reconciliation phase.
    #[serde(default)]
    pub phase: DomainPhase,

    /// Servers the operator manages.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub servers: Vec<ServerStatus>,

    /// Clusters the operator manages.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub clusters: Vec<ClusterStatus>,

    /// Human-readable message about the current state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Machine-readable reason for a failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Last time the status was updated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,

    /// Generation the status reflects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Reconciliation phase of a domain.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum DomainPhase {
    /// Not processed yet.
    #[default]
    Unknown,
    /// Verifying the operator's identity.
    VerifyingIdentity,
    /// Ensuring the persistent volume and claim.
    EnsuringStorage,
    /// Running the domain creation job.
    RunningCreationJob,
    /// Ensuring the admin server.
    EnsuringServers,
    /// Scaling clusters to their replica limits.
    ReconcilingScale,
    /// Running servers match the Domain.
    Ready,
    /// The last attempt failed.
    Failed,
}

impl fmt::Display for DomainPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Status of one server.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    /// Server name.
    pub server_name: String,
    /// Owning cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,
    /// Whether the server's pod is ready.
    pub ready: bool,
}

/// Status of one cluster.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// Cluster name.
    pub cluster_name: String,
    /// Replica limit the cluster was scaled to.
    pub replicas: i32,
    /// Servers currently receiving traffic.
    #[serde(default)]
    pub routing_set: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> DomainSpec {
        serde_json::from_value(serde_json::json!({
            "domainUID": "d1",
            "domainName": "base_domain",
            "replicas": 2,
            "clusterStartup": [
                { "clusterName": "c1", "replicas": 4, "desiredState": "ADMIN",
                  "env": [{ "name": "JAVA_OPTIONS", "value": "-Dcluster" }] },
                { "clusterName": "c2" }
            ],
            "serverStartup": [
                { "serverName": "c1-ms-1", "desiredState": "RUNNING", "nodePort": 30701 }
            ]
        }))
        .unwrap()
    }

    #[test]
    fn defaults_are_applied() {
        let spec = spec();
        assert_eq!(spec.admin_server_name, "admin-server");
        assert_eq!(spec.admin_port, 7001);
        assert_eq!(spec.managed_server_name_base, "ms-");
        assert_eq!(spec.managed_server_port, 8001);
        assert_eq!(spec.startup_control(), StartupControl::Auto);
    }

    #[test]
    fn replica_limit_prefers_cluster_override() {
        let spec = spec();
        assert_eq!(spec.replica_limit("c1"), 4);
        assert_eq!(spec.replica_limit("c2"), 2);
        assert_eq!(spec.replica_limit("unknown"), 2);
    }

    #[test]
    fn server_override_wins_over_cluster_override() {
        let spec = spec();
        let ms1 = spec.resolve_server(Some("c1"), "c1-ms-1");
        assert_eq!(ms1.desired_state, "RUNNING");
        assert_eq!(ms1.node_port, Some(30701));
        assert_eq!(ms1.env[0].name, "JAVA_OPTIONS");

        let ms2 = spec.resolve_server(Some("c1"), "c1-ms-2");
        assert_eq!(ms2.desired_state, "ADMIN");
        assert_eq!(ms2.node_port, None);

        let standalone = spec.resolve_server(None, "c1-ms-2");
        assert_eq!(standalone.desired_state, "RUNNING");
        assert!(standalone.env.is_empty());
    }

    #[test]
    fn startup_control_is_case_insensitive() {
        let mut spec = spec();
        spec.startup_control = Some("admin".to_string());
        assert_eq!(spec.startup_control(), StartupControl::Admin);
        assert!(!spec.startup_control().starts_clusters());
        spec.startup_control = Some("none".to_string());
        assert!(!spec.startup_control().starts_admin());
    }

    #[test]
    fn startup_control_modes_start_admin_and_clusters() {
        let modes = [
            ("NONE", false, false),
            ("ADMIN", true, false),
            ("SPECIFIED", true, true),
            ("AUTO", true, true),
            ("ALL", true, true),
        ];
        for (value, admin, clusters) in modes {
            let mut spec = spec();
            spec.startup_control = Some(value.to_string());
            let control = spec.startup_control();
            assert_eq!(control.starts_admin(), admin, "{}", value);
            assert_eq!(control.starts_clusters(), clusters, "{}", value);
        }
        let mut spec = spec();
        spec.startup_control = None;
        assert_eq!(spec.startup_control(), StartupControl::Auto);
    }

    #[test]
    fn derived_names() {
        let spec = spec();
        assert_eq!(spec.managed_server_name("c1", 3), "c1-ms-3");
        assert_eq!(spec.server_object_name("c1-ms-3"), "d1-c1-ms-3");
        assert_eq!(spec.cluster_names(), vec!["c1", "c2"]);
    }
}
