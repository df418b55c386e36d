//! Builders for the Kubernetes objects a Domain owns.
//!
//! Every object carries the `weblogic.domainUID` label so drift on it can be
//! traced back to its domain, and an owner reference to the Domain when the
//! Domain has a UID.

use crate::crd::{Domain, DomainStorage, EffectiveServerSpec};
use crate::routing::RoutingSet;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EnvVar, HostPathVolumeSource,
    PersistentVolume, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, PersistentVolumeSpec, Pod, PodSpec, PodTemplateSpec, Probe,
    SecurityContext, Service, ServicePort, ServiceSpec, TCPSocketAction, Volume, VolumeMount,
    VolumeResourceRequirements,
};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;

/// Label carrying the domain UID.
pub const LABEL_DOMAIN_UID: &str = "weblogic.domainUID";
/// Label carrying the domain name.
pub const LABEL_DOMAIN_NAME: &str = "weblogic.domainName";
/// Label carrying the server name.
pub const LABEL_SERVER_NAME: &str = "weblogic.serverName";
/// Label carrying the cluster name.
pub const LABEL_CLUSTER_NAME: &str = "weblogic.clusterName";
/// Label marking objects created by the operator.
pub const LABEL_CREATED_BY_OPERATOR: &str = "weblogic.createdByOperator";
/// Annotation holding the routing set of a cluster ingress.
pub const ROUTING_SET_ANNOTATION: &str = "weblogic.oracle/routing-set";

/// Mount point of the domain home volume inside the creation job.
pub const SHARED_MOUNT_PATH: &str = "/shared";
/// Mount point of the creation scripts inside the creation job.
pub const SCRIPTS_MOUNT_PATH: &str = "/u01/weblogic";

/// WLST script run by the creation job.
pub const CREATE_DOMAIN_SCRIPT: &str = r#"import os

domain_path = os.environ.get('DOMAIN_PATH', domain_path)
domain_home = domain_path + '/' + domain_name

print('Creating domain ' + domain_name + ' in ' + domain_home)
readTemplate('/u01/oracle/wlserver/common/templates/wls/wls.jar')
set('Name', domain_name)
setOption('DomainName', domain_name)

cd('/Servers/AdminServer')
set('ListenPort', int(admin_server_port))
set('Name', admin_server_name)

cd('/')
cluster = create(cluster_name, 'Cluster')
for index in range(1, int(number_of_ms) + 1):
    cd('/')
    name = cluster_name + '-' + managed_server_name_base + str(index)
    create(name, 'Server')
    cd('/Servers/' + name)
    set('ListenPort', int(managed_server_port))
    set('Cluster', cluster_name)

if production_mode_enabled == 'true':
    setOption('ServerStartMode', 'prod')

writeDomain(domain_home)
closeTemplate()
print('Domain ' + domain_name + ' created')
exit()
"#;

/// Labels shared by every object of a domain.
pub fn domain_labels(domain: &Domain) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_DOMAIN_UID.to_string(), domain.spec.domain_uid.clone());
    labels.insert(LABEL_DOMAIN_NAME.to_string(), domain.spec.domain_name.clone());
    labels.insert(LABEL_CREATED_BY_OPERATOR.to_string(), "true".to_string());
    labels
}

/// Labels of a server's pod and service.
pub fn server_labels(domain: &Domain, server: &EffectiveServerSpec) -> BTreeMap<String, String> {
    let mut labels = domain_labels(domain);
    labels.insert(LABEL_SERVER_NAME.to_string(), server.server_name.clone());
    if let Some(cluster) = &server.cluster_name {
        labels.insert(LABEL_CLUSTER_NAME.to_string(), cluster.clone());
    }
    labels
}

/// Label selector matching the managed servers of a cluster.
pub fn cluster_selector(domain_uid: &str, cluster: &str) -> String {
    format!("{}={},{}={}", LABEL_DOMAIN_UID, domain_uid, LABEL_CLUSTER_NAME, cluster)
}

/// Label selector matching every object of a domain.
pub fn domain_selector(domain_uid: &str) -> String {
    format!("{}={}", LABEL_DOMAIN_UID, domain_uid)
}

fn metadata(domain: &Domain, name: String, labels: BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: domain.namespace(),
        labels: Some(labels),
        owner_references: domain.controller_owner_ref(&()).map(|owner| vec![owner]),
        ..Default::default()
    }
}

fn listen_port(domain: &Domain, server: &EffectiveServerSpec) -> i32 {
    if server.cluster_name.is_some() {
        domain.spec.managed_server_port
    } else {
        domain.spec.admin_port
    }
}

/// Pod running one server.
pub fn build_server_pod(domain: &Domain, server: &EffectiveServerSpec) -> Pod {
    let spec = &domain.spec;
    let port = listen_port(domain, server);
    let name = spec.server_object_name(&server.server_name);

    let mut env: Vec<EnvVar> = vec![
        env_var("DOMAIN_UID", &spec.domain_uid),
        env_var("DOMAIN_NAME", &spec.domain_name),
        env_var("SERVER_NAME", &server.server_name),
        env_var("ADMIN_NAME", &spec.admin_server_name),
        env_var("ADMIN_PORT", &spec.admin_port.to_string()),
        env_var("STARTUP_MODE", &server.desired_state),
    ];
    if spec.storage.is_some() {
        env.push(env_var(
            "DOMAIN_HOME",
            &format!("{}/domains/{}", SHARED_MOUNT_PATH, spec.domain_name),
        ));
        env.push(env_var("LOG_HOME", &format!("{}/logs", SHARED_MOUNT_PATH)));
    }
    env.extend(server.env.iter().map(|e| env_var(&e.name, &e.value)));

    let mut container = Container {
        name: "weblogic-server".to_string(),
        image: Some(spec.image.clone()),
        image_pull_policy: Some(spec.image_pull_policy.clone()),
        command: Some(vec!["/weblogic-operator/scripts/startServer.sh".to_string()]),
        env: Some(env),
        ports: Some(vec![ContainerPort {
            container_port: port,
            name: Some("weblogic".to_string()),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        readiness_probe: Some(Probe {
            tcp_socket: Some(TCPSocketAction {
                port: IntOrString::Int(port),
                ..Default::default()
            }),
            initial_delay_seconds: Some(2),
            period_seconds: Some(5),
            ..Default::default()
        }),
        ..Default::default()
    };

    let mut volumes = None;
    if spec.storage.is_some() {
        container.volume_mounts = Some(vec![VolumeMount {
            name: "weblogic-domain-storage-volume".to_string(),
            mount_path: SHARED_MOUNT_PATH.to_string(),
            ..Default::default()
        }]);
        volumes = Some(vec![Volume {
            name: "weblogic-domain-storage-volume".to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: pvc_name(&spec.domain_uid),
                ..Default::default()
            }),
            ..Default::default()
        }]);
    }

    Pod {
        metadata: metadata(domain, name, server_labels(domain, server)),
        spec: Some(PodSpec {
            containers: vec![container],
            volumes,
            ..Default::default()
        }),
        status: None,
    }
}

/// Service fronting one server. A node port is exposed when configured.
pub fn build_server_service(domain: &Domain, server: &EffectiveServerSpec) -> Service {
    let spec = &domain.spec;
    let port = listen_port(domain, server);
    let labels = server_labels(domain, server);

    let mut selector = BTreeMap::new();
    selector.insert(LABEL_DOMAIN_UID.to_string(), spec.domain_uid.clone());
    selector.insert(LABEL_SERVER_NAME.to_string(), server.server_name.clone());

    Service {
        metadata: metadata(domain, spec.server_object_name(&server.server_name), labels),
        spec: Some(ServiceSpec {
            type_: Some(if server.node_port.is_some() { "NodePort" } else { "ClusterIP" }.to_string()),
            selector: Some(selector),
            ports: Some(vec![ServicePort {
                name: Some("weblogic".to_string()),
                port,
                target_port: Some(IntOrString::Int(port)),
                node_port: server.node_port,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            publish_not_ready_addresses: Some(true),
            ..Default::default()
        }),
        status: None,
    }
}

/// Name of the domain's persistent volume.
pub fn pv_name(domain_uid: &str) -> String {
    format!("{}-weblogic-domain-pv", domain_uid)
}

/// Name of the domain's persistent volume claim.
pub fn pvc_name(domain_uid: &str) -> String {
    format!("{}-weblogic-domain-pvc", domain_uid)
}

/// Storage class binding the claim to the volume.
pub fn storage_class_name(domain_uid: &str) -> String {
    format!("{}-weblogic-domain-storage-class", domain_uid)
}

/// Name of the config map holding the creation scripts.
pub fn scripts_config_map_name(domain_uid: &str) -> String {
    format!("{}-create-domain-scripts-cm", domain_uid)
}

/// Name of the domain creation job.
pub fn creation_job_name(domain_uid: &str) -> String {
    format!("{}-create-domain-onpv-job", domain_uid)
}

/// Name of a cluster's ingress.
pub fn ingress_name(domain_uid: &str, cluster: &str) -> String {
    format!("{}-{}", domain_uid, cluster)
}

fn storage_request(size: &str) -> BTreeMap<String, Quantity> {
    let mut request = BTreeMap::new();
    request.insert("storage".to_string(), Quantity(size.to_string()));
    request
}

/// Cluster-scoped volume backing the domain home.
pub fn build_persistent_volume(domain: &Domain, storage: &DomainStorage) -> PersistentVolume {
    let uid = &domain.spec.domain_uid;
    PersistentVolume {
        metadata: ObjectMeta {
            name: Some(pv_name(uid)),
            labels: Some(domain_labels(domain)),
            ..Default::default()
        },
        spec: Some(PersistentVolumeSpec {
            access_modes: Some(vec!["ReadWriteMany".to_string()]),
            capacity: Some(storage_request(&storage.size)),
            persistent_volume_reclaim_policy: Some("Recycle".to_string()),
            storage_class_name: Some(storage_class_name(uid)),
            host_path: Some(HostPathVolumeSource {
                path: format!("{}/{}", storage.host_path.trim_end_matches('/'), uid),
                type_: None,
            }),
            ..Default::default()
        }),
        status: None,
    }
}

/// Claim on the domain's volume.
pub fn build_persistent_volume_claim(domain: &Domain, storage: &DomainStorage) -> PersistentVolumeClaim {
    let uid = &domain.spec.domain_uid;
    PersistentVolumeClaim {
        metadata: metadata(domain, pvc_name(uid), domain_labels(domain)),
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteMany".to_string()]),
            storage_class_name: Some(storage_class_name(uid)),
            resources: Some(VolumeResourceRequirements {
                requests: Some(storage_request(&storage.size)),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: None,
    }
}

/// Properties file read by the creation script.
pub fn domain_properties(domain: &Domain, storage: &DomainStorage) -> String {
    let spec = &domain.spec;
    [
        format!("domain_path={}/domains", SHARED_MOUNT_PATH),
        format!("domain_name={}", spec.domain_name),
        format!("cluster_name={}", storage.cluster_name),
        format!("admin_server_name={}", spec.admin_server_name),
        format!("managed_server_port={}", spec.managed_server_port),
        format!("admin_server_port={}", spec.admin_port),
        format!("number_of_ms={}", storage.configured_managed_servers),
        format!("managed_server_name_base={}", spec.managed_server_name_base),
        format!("domain_logs={}/logs", SHARED_MOUNT_PATH),
        "production_mode_enabled=true".to_string(),
    ]
    .join("\n")
        + "\n"
}

/// Config map carrying the creation script and its properties.
pub fn build_scripts_config_map(domain: &Domain, storage: &DomainStorage) -> ConfigMap {
    let mut data = BTreeMap::new();
    data.insert("create-domain.py".to_string(), CREATE_DOMAIN_SCRIPT.to_string());
    data.insert("domain.properties".to_string(), domain_properties(domain, storage));

    ConfigMap {
        metadata: metadata(
            domain,
            scripts_config_map_name(&domain.spec.domain_uid),
            domain_labels(domain),
        ),
        data: Some(data),
        ..Default::default()
    }
}

/// One-shot job creating the domain home on the volume.
pub fn build_creation_job(domain: &Domain, storage: &DomainStorage) -> Job {
    let spec = &domain.spec;
    let uid = &spec.domain_uid;
    let image = storage.job_image.clone().unwrap_or_else(|| spec.image.clone());

    let shared_mount = VolumeMount {
        name: "weblogic-domain-storage-volume".to_string(),
        mount_path: SHARED_MOUNT_PATH.to_string(),
        ..Default::default()
    };

    let fix_owner = Container {
        name: "fix-pvc-owner".to_string(),
        image: Some(image.clone()),
        command: Some(vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("chown -R 1000:1000 {}", SHARED_MOUNT_PATH),
        ]),
        volume_mounts: Some(vec![shared_mount.clone()]),
        security_context: Some(SecurityContext {
            run_as_user: Some(0),
            run_as_group: Some(0),
            ..Default::default()
        }),
        ..Default::default()
    };

    let create = Container {
        name: "create-weblogic-domain-onpv-job".to_string(),
        image: Some(image),
        image_pull_policy: Some(spec.image_pull_policy.clone()),
        command: Some(vec![
            "/u01/oracle/oracle_common/common/bin/wlst.sh".to_string(),
            format!("{}/create-domain.py", SCRIPTS_MOUNT_PATH),
            "-skipWLSModuleScanning".to_string(),
            "-loadProperties".to_string(),
            format!("{}/domain.properties", SCRIPTS_MOUNT_PATH),
        ]),
        volume_mounts: Some(vec![
            VolumeMount {
                name: "create-weblogic-domain-job-cm-volume".to_string(),
                mount_path: SCRIPTS_MOUNT_PATH.to_string(),
                ..Default::default()
            },
            shared_mount,
        ]),
        ..Default::default()
    };

    Job {
        metadata: metadata(domain, creation_job_name(uid), domain_labels(domain)),
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(domain_labels(domain)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    init_containers: Some(vec![fix_owner]),
                    containers: vec![create],
                    volumes: Some(vec![
                        Volume {
                            name: "create-weblogic-domain-job-cm-volume".to_string(),
                            config_map: Some(ConfigMapVolumeSource {
                                name: scripts_config_map_name(uid),
                                ..Default::default()
                            }),
                            ..Default::default()
                        },
                        Volume {
                            name: "weblogic-domain-storage-volume".to_string(),
                            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                                claim_name: pvc_name(uid),
                                ..Default::default()
                            }),
                            ..Default::default()
                        },
                    ]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

/// Ingress routing traffic to the servers in a cluster's routing set.
///
/// Each routed server gets its own path; the set itself is recorded in the
/// [`ROUTING_SET_ANNOTATION`] so it survives operator restarts.
pub fn build_routing_ingress(domain: &Domain, cluster: &str, routing: &RoutingSet) -> Ingress {
    let spec = &domain.spec;
    let paths: Vec<HTTPIngressPath> = routing
        .iter()
        .map(|server| HTTPIngressPath {
            path: Some(format!("/{}", server)),
            path_type: "Prefix".to_string(),
            backend: IngressBackend {
                service: Some(IngressServiceBackend {
                    name: spec.server_object_name(server),
                    port: Some(ServiceBackendPort {
                        number: Some(spec.managed_server_port),
                        ..Default::default()
                    }),
                }),
                ..Default::default()
            },
        })
        .collect();

    let mut labels = domain_labels(domain);
    labels.insert(LABEL_CLUSTER_NAME.to_string(), cluster.to_string());

    let mut meta = metadata(domain, ingress_name(&spec.domain_uid, cluster), labels);
    let mut annotations = BTreeMap::new();
    annotations.insert(ROUTING_SET_ANNOTATION.to_string(), routing.to_annotation());
    meta.annotations = Some(annotations);

    Ingress {
        metadata: meta,
        spec: Some(IngressSpec {
            rules: Some(vec![IngressRule {
                host: None,
                http: Some(HTTPIngressRuleValue { paths }),
            }]),
            ..Default::default()
        }),
        status: None,
    }
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        value_from: None,
    }
}

/// Whether a pod reports the `Ready` condition.
pub fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

/// Terminal state of a job, if it has one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobCompletion {
    /// The job completed.
    Succeeded,
    /// The job failed.
    Failed(String),
}

/// Terminal state of a job, or `None` while it is still running.
pub fn job_completion(job: &Job) -> Option<JobCompletion> {
    let status = job.status.as_ref()?;
    let conditions = status.conditions.as_deref().unwrap_or_default();
    if let Some(failed) = conditions
        .iter()
        .find(|c| c.type_ == "Failed" && c.status == "True")
    {
        return Some(JobCompletion::Failed(
            failed
                .message
                .clone()
                .or_else(|| failed.reason.clone())
                .unwrap_or_else(|| "job failed".to_string()),
        ));
    }
    if conditions
        .iter()
        .any(|c| c.type_ == "Complete" && c.status == "True")
        || status.succeeded.unwrap_or(0) > 0
    {
        return Some(JobCompletion::Succeeded);
    }
    if status.failed.unwrap_or(0) > 0 {
        return Some(JobCompletion::Failed("job pod failed".to_string()));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::DomainSpec;

    fn domain() -> Domain {
        let spec: DomainSpec = serde_json::from_value(serde_json::json!({
            "domainUID": "d1",
            "domainName": "base_domain",
            "storage": { "hostPath": "/scratch/k8s_dir/" },
            "serverStartup": [{ "serverName": "admin-server", "nodePort": 30701 }]
        }))
        .unwrap();
        let mut domain = Domain::new("d1", spec);
        domain.metadata.namespace = Some("default".to_string());
        domain.metadata.uid = Some("uid-1".to_string());
        domain
    }

    #[test]
    fn server_pod_is_labelled_and_owned() {
        let domain = domain();
        let server = domain.spec.resolve_server(Some("c1"), "c1-ms-1");
        let pod = build_server_pod(&domain, &server);

        assert_eq!(pod.metadata.name.as_deref(), Some("d1-c1-ms-1"));
        let labels = pod.metadata.labels.unwrap();
        assert_eq!(labels[LABEL_DOMAIN_UID], "d1");
        assert_eq!(labels[LABEL_CLUSTER_NAME], "c1");
        assert_eq!(labels[LABEL_SERVER_NAME], "c1-ms-1");
        assert_eq!(pod.metadata.owner_references.unwrap()[0].kind, "Domain");

        let container = &pod.spec.unwrap().containers[0];
        assert_eq!(container.ports.as_ref().unwrap()[0].container_port, 8001);
    }

    #[test]
    fn admin_service_exposes_node_port() {
        let domain = domain();
        let admin = domain.spec.admin_server();
        let svc = build_server_service(&domain, &admin);
        let spec = svc.spec.unwrap();
        assert_eq!(spec.type_.as_deref(), Some("NodePort"));
        let port = &spec.ports.unwrap()[0];
        assert_eq!(port.port, 7001);
        assert_eq!(port.node_port, Some(30701));
    }

    #[test]
    fn storage_objects_share_storage_class() {
        let domain = domain();
        let storage = domain.spec.storage.clone().unwrap();
        let pv = build_persistent_volume(&domain, &storage);
        let pvc = build_persistent_volume_claim(&domain, &storage);

        let pv_spec = pv.spec.unwrap();
        assert_eq!(pv_spec.storage_class_name.as_deref(), Some("d1-weblogic-domain-storage-class"));
        assert_eq!(pv_spec.storage_class_name, pvc.spec.unwrap().storage_class_name);
        assert_eq!(pv_spec.host_path.unwrap().path, "/scratch/k8s_dir/d1");
        assert_eq!(pv_spec.persistent_volume_reclaim_policy.as_deref(), Some("Recycle"));
        assert!(pv.metadata.namespace.is_none());
    }

    #[test]
    fn properties_describe_the_domain() {
        let domain = domain();
        let storage = domain.spec.storage.clone().unwrap();
        let properties = domain_properties(&domain, &storage);
        assert!(properties.contains("domain_path=/shared/domains\n"));
        assert!(properties.contains("domain_name=base_domain\n"));
        assert!(properties.contains("number_of_ms=4\n"));
        assert!(properties.contains("admin_server_port=7001\n"));
    }

    #[test]
    fn creation_job_never_retries() {
        let domain = domain();
        let storage = domain.spec.storage.clone().unwrap();
        let job = build_creation_job(&domain, &storage);
        let spec = job.spec.unwrap();
        assert_eq!(spec.backoff_limit, Some(0));
        let pod = spec.template.spec.unwrap();
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));
        let init = &pod.init_containers.unwrap()[0];
        assert_eq!(init.name, "fix-pvc-owner");
        assert_eq!(init.security_context.as_ref().unwrap().run_as_user, Some(0));
        assert!(pod.containers[0].command.as_ref().unwrap()[0].ends_with("wlst.sh"));
    }

    #[test]
    fn ingress_routes_each_member() {
        let domain = domain();
        let routing = RoutingSet::from_names(["c1-ms-1", "c1-ms-2"]);
        let ingress = build_routing_ingress(&domain, "c1", &routing);

        assert_eq!(ingress.metadata.name.as_deref(), Some("d1-c1"));
        assert_eq!(
            ingress.metadata.annotations.unwrap()[ROUTING_SET_ANNOTATION],
            "c1-ms-1,c1-ms-2"
        );
        let rules = ingress.spec.unwrap().rules.unwrap();
        let paths = &rules[0].http.as_ref().unwrap().paths;
        let backends: Vec<&str> = paths
            .iter()
            .map(|p| p.backend.service.as_ref().unwrap().name.as_str())
            .collect();
        assert_eq!(backends, vec!["d1-c1-ms-1", "d1-c1-ms-2"]);
    }
}
