//! The make-right plan of a Domain.

use super::OperatorContext;
use crate::crd::{Domain, DomainPhase};
use crate::resources;
use crate::steps::common::{await_server, ensure_server, wait_job_complete, EnsureResource};
use crate::steps::identity::VerifyIdentity;
use crate::steps::scale::ScaleClusters;
use crate::steps::status::{SetPhase, WriteReadyStatus};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolume, PersistentVolumeClaim};
use std::sync::Arc;
use wko_core::StepChain;

/// Build the chain that brings the cluster in line with `domain`.
///
/// Phases are entered in order, each recorded in the Domain status:
/// identity, storage and creation job (only with `spec.storage`), the admin
/// server (unless startup control is `NONE`), cluster scaling (unless
/// startup control is `NONE` or `ADMIN`), and finally `Ready`.
pub fn make_right_plan(ctx: &Arc<OperatorContext>, domain: &Domain) -> StepChain {
    let phase = |phase| SetPhase::new(ctx.clone(), phase);
    let startup = domain.spec.startup_control();

    let mut chain = StepChain::empty()
        .push(phase(DomainPhase::VerifyingIdentity))
        .push(VerifyIdentity::new(ctx.clone()));

    if let Some(storage) = &domain.spec.storage {
        let (pv, pvc, cm, job) = (storage.clone(), storage.clone(), storage.clone(), storage.clone());
        chain = chain
            .push(phase(DomainPhase::EnsuringStorage))
            .push(
                EnsureResource::<PersistentVolume>::new(ctx.clone(), "EnsurePersistentVolume", move |d| {
                    resources::build_persistent_volume(d, &pv)
                })
                .cluster_scoped(),
            )
            .push(EnsureResource::<PersistentVolumeClaim>::new(
                ctx.clone(),
                "EnsurePersistentVolumeClaim",
                move |d| resources::build_persistent_volume_claim(d, &pvc),
            ))
            .push(phase(DomainPhase::RunningCreationJob))
            .push(EnsureResource::<ConfigMap>::new(
                ctx.clone(),
                "EnsureScriptsConfigMap",
                move |d| resources::build_scripts_config_map(d, &cm),
            ))
            .push(EnsureResource::<Job>::new(ctx.clone(), "EnsureCreationJob", move |d| {
                resources::build_creation_job(d, &job)
            }))
            .push(wait_job_complete(ctx));
    }

    if startup.starts_admin() {
        let admin = domain.spec.admin_server();
        let admin_name = admin.server_name.clone();
        chain = chain
            .push(phase(DomainPhase::EnsuringServers))
            .then(ensure_server(ctx, admin))
            .then(await_server(ctx, &admin_name));
    }

    if startup.starts_clusters() && !domain.spec.cluster_names().is_empty() {
        chain = chain
            .push(phase(DomainPhase::ReconcilingScale))
            .push(ScaleClusters::new(ctx.clone()));
    }

    chain.push(WriteReadyStatus::new(ctx.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OperatorConfig;
    use crate::testing::FakeCluster;
    use wko_core::providers::MockClock;

    fn ctx() -> Arc<OperatorContext> {
        let clock = Arc::new(MockClock::new());
        let cluster = Arc::new(FakeCluster::new(clock.clone()));
        Arc::new(OperatorContext::new(cluster, OperatorConfig::default()).with_clock(clock))
    }

    fn domain(spec: serde_json::Value) -> Domain {
        let mut domain = Domain::new("d1", serde_json::from_value(spec).unwrap());
        domain.metadata.namespace = Some("default".to_string());
        domain
    }

    #[test]
    fn full_plan_visits_every_phase() {
        let domain = domain(serde_json::json!({
            "domainUID": "d1",
            "domainName": "base_domain",
            "clusterStartup": [{ "clusterName": "c1", "replicas": 2 }],
            "storage": {}
        }));
        let names = make_right_plan(&ctx(), &domain).step_names();
        let phases: Vec<&str> = names
            .iter()
            .filter(|n| n.starts_with("SetPhase"))
            .map(String::as_str)
            .collect();
        assert_eq!(
            phases,
            vec![
                "SetPhase(VerifyingIdentity)",
                "SetPhase(EnsuringStorage)",
                "SetPhase(RunningCreationJob)",
                "SetPhase(EnsuringServers)",
                "SetPhase(ReconcilingScale)",
            ]
        );
        assert!(names.contains(&"EnsureCreationJob".to_string()));
        assert!(names.contains(&"WaitPodReady(admin-server)".to_string()));
        assert_eq!(names.last().map(String::as_str), Some("WriteReadyStatus"));
    }

    #[test]
    fn startup_none_skips_servers() {
        let domain = domain(serde_json::json!({
            "domainUID": "d1",
            "domainName": "base_domain",
            "startupControl": "NONE",
            "clusterStartup": [{ "clusterName": "c1" }]
        }));
        let names = make_right_plan(&ctx(), &domain).step_names();
        assert_eq!(
            names,
            vec!["SetPhase(VerifyingIdentity)", "VerifyIdentity", "WriteReadyStatus"]
        );
    }

    #[test]
    fn startup_admin_skips_clusters() {
        let domain = domain(serde_json::json!({
            "domainUID": "d1",
            "domainName": "base_domain",
            "startupControl": "ADMIN",
            "clusterStartup": [{ "clusterName": "c1" }]
        }));
        let names = make_right_plan(&ctx(), &domain).step_names();
        assert!(names.contains(&"EnsurePod(admin-server)".to_string()));
        assert!(!names.contains(&"ScaleClusters".to_string()));
    }
}
