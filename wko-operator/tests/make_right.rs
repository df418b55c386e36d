//! Integration tests for domain make-right processing.

mod common;

use common::{test_config, wait_until, Harness, NAMESPACE};
use serde_json::json;
use std::time::Duration;
use wko_core::FiberState;
use wko_operator::crd::DomainPhase;
use wko_operator::events::reasons;
use wko_operator::resources::{creation_job_name, pv_name, pvc_name};
use wko_operator::testing::{ApiOp, JobLifecycle, PodLifecycle};

fn mutating_calls(h: &Harness) -> Vec<(ApiOp, String, String)> {
    h.cluster
        .calls()
        .into_iter()
        .filter(|c| matches!(c.op, ApiOp::Create | ApiOp::Replace | ApiOp::Delete))
        .filter(|c| c.kind != "Event")
        .map(|c| (c.op, c.kind, c.name))
        .collect()
}

#[tokio::test]
async fn test_domain_reaches_ready() {
    let h = Harness::new();
    let domain = h.domain(json!({
        "domainUID": "d1",
        "domainName": "base_domain",
        "clusterStartup": [{ "clusterName": "c1", "replicas": 2 }]
    }));

    let state = h.make_right(&domain).await;

    assert_eq!(state, FiberState::Completed);
    assert_eq!(
        h.pod_names(),
        vec!["d1-admin-server", "d1-c1-ms-1", "d1-c1-ms-2"]
    );
    assert_eq!(h.cluster.names("Service").len(), 3);

    let status = h.stored_domain().status.expect("status written");
    assert_eq!(status.phase, DomainPhase::Ready);
    assert_eq!(status.observed_generation, Some(1));
    assert!(status.servers.iter().all(|s| s.ready));
    assert_eq!(status.servers.len(), 3);

    assert_eq!(h.events(reasons::DOMAIN_PROCESSING_STARTING).len(), 1);
    let completed = h.events(reasons::DOMAIN_PROCESSING_COMPLETED);
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0]["message"], "Domain d1 is ready");
    assert_eq!(completed[0]["involvedObject"]["name"], "domain1");
}

#[tokio::test]
async fn test_second_run_changes_nothing() {
    let h = Harness::new();
    let domain = h.domain(json!({
        "domainUID": "d1",
        "domainName": "base_domain",
        "clusterStartup": [{ "clusterName": "c1", "replicas": 2 }]
    }));
    assert_eq!(h.make_right(&domain).await, FiberState::Completed);
    h.cluster.clear_calls();

    let state = h.make_right(&domain).await;

    assert_eq!(state, FiberState::Completed);
    let calls = mutating_calls(&h);
    assert!(calls.is_empty(), "unexpected writes: {:?}", calls);
    assert_eq!(h.identity.generated(), 1);
}

#[tokio::test]
async fn test_startup_none_starts_no_servers() {
    let h = Harness::new();
    let domain = h.domain(json!({
        "domainUID": "d1",
        "domainName": "base_domain",
        "startupControl": "NONE",
        "clusterStartup": [{ "clusterName": "c1", "replicas": 2 }]
    }));

    let state = h.make_right(&domain).await;

    assert_eq!(state, FiberState::Completed);
    assert!(h.pod_names().is_empty());
    let status = h.stored_domain().status.expect("status written");
    assert_eq!(status.phase, DomainPhase::Ready);
    assert!(status.clusters.is_empty());
}

#[tokio::test]
async fn test_startup_admin_starts_only_the_admin_server() {
    let h = Harness::new();
    let domain = h.domain(json!({
        "domainUID": "d1",
        "domainName": "base_domain",
        "startupControl": "ADMIN",
        "clusterStartup": [{ "clusterName": "c1", "replicas": 2 }]
    }));

    let state = h.make_right(&domain).await;

    assert_eq!(state, FiberState::Completed);
    assert_eq!(h.pod_names(), vec!["d1-admin-server"]);
    assert!(h.cluster.names("Ingress").is_empty());
}

#[tokio::test]
async fn test_domain_on_persistent_volume_runs_creation_job() {
    let h = Harness::new();
    let domain = h.domain(json!({
        "domainUID": "d1",
        "domainName": "base_domain",
        "storage": { "hostPath": "/scratch/k8s" }
    }));

    let state = h.make_right(&domain).await;

    assert_eq!(state, FiberState::Completed);
    let pv = h
        .cluster
        .object("PersistentVolume", "", &pv_name("d1"))
        .expect("persistent volume created");
    assert_eq!(pv["spec"]["hostPath"]["path"], "/scratch/k8s/d1");
    assert!(h.cluster.object("PersistentVolumeClaim", NAMESPACE, &pvc_name("d1")).is_some());
    assert!(h.cluster.object("Job", NAMESPACE, &creation_job_name("d1")).is_some());
    assert_eq!(h.cluster.names("ConfigMap").len(), 1);

    assert_eq!(
        h.pod_names(),
        vec!["d1-admin-server", "d1-cluster-1-ms-1"]
    );
    let job_created = h
        .cluster
        .calls()
        .iter()
        .position(|c| c.op == ApiOp::Create && c.kind == "Job");
    let first_pod = h
        .cluster
        .calls()
        .iter()
        .position(|c| c.op == ApiOp::Create && c.kind == "Pod");
    assert!(job_created < first_pod);
}

#[tokio::test]
async fn test_failed_creation_job_marks_domain_failed() {
    let h = Harness::new();
    h.cluster.set_job_lifecycle(JobLifecycle::Fail);
    let domain = h.domain(json!({
        "domainUID": "d1",
        "domainName": "base_domain",
        "storage": {}
    }));

    let state = h.make_right(&domain).await;

    assert!(matches!(state, FiberState::Failed(_)));
    assert!(h.pod_names().is_empty());

    let status = h.stored_domain().status.expect("status written");
    assert_eq!(status.phase, DomainPhase::Failed);
    assert!(status
        .message
        .as_deref()
        .unwrap_or_default()
        .contains("domain creation job failed"));

    let failed = h.events(reasons::DOMAIN_PROCESSING_FAILED);
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0]["type"], "Warning");
    assert!(h.events(reasons::DOMAIN_PROCESSING_COMPLETED).is_empty());
}

#[tokio::test]
async fn test_only_new_generations_restart_processing() {
    let h = Harness::new();
    let mut domain = h.domain(json!({
        "domainUID": "d1",
        "domainName": "base_domain",
        "startupControl": "ADMIN"
    }));

    let first = h.processor.on_domain_applied(&domain).expect("first generation runs");
    assert_eq!(first.join().await, FiberState::Completed);
    assert!(h.processor.on_domain_applied(&domain).is_none());

    domain.metadata.generation = Some(2);
    let second = h.processor.on_domain_applied(&domain).expect("new generation runs");
    assert_eq!(second.join().await, FiberState::Completed);
    assert_eq!(h.processor.active_count(), 0);
}

#[tokio::test]
async fn test_restart_cancels_running_fiber() {
    let h = Harness::with_config(
        test_config().with_waits(Duration::from_secs(1), Duration::from_secs(u32::MAX as u64)),
    );
    h.cluster.set_job_lifecycle(JobLifecycle::Pending);
    let domain = h.domain(json!({
        "domainUID": "d1",
        "domainName": "base_domain",
        "storage": {}
    }));

    let first = h.processor.make_right(&domain);
    let second = h.processor.make_right(&domain);

    assert_eq!(first.join().await, FiberState::Cancelled);
    assert!(first.is_cancelled());
    assert!(!second.is_cancelled());
    h.processor.stop(NAMESPACE, "domain1");
    assert_eq!(second.join().await, FiberState::Cancelled);
    assert!(h.processor.fiber(NAMESPACE, "domain1").is_none());
}

#[tokio::test]
async fn test_failed_make_right_is_requeued_after_backoff() {
    let h = Harness::with_config(test_config().with_failure_requeue(true));
    h.cluster
        .set_pod_lifecycle_for("d1-c1-ms-1", PodLifecycle::NeverReady);
    let domain = h.domain(json!({
        "domainUID": "d1",
        "domainName": "base_domain",
        "clusterStartup": [{ "clusterName": "c1", "replicas": 1 }]
    }));

    let first = h.processor.make_right(&domain);
    assert!(matches!(first.join().await, FiberState::Failed(_)));
    assert!(h.cluster.set_pod_ready(NAMESPACE, "d1-c1-ms-1", true));

    wait_until(|| {
        h.processor
            .fiber(NAMESPACE, "domain1")
            .map(|f| f.id() != first.id() && f.state() == FiberState::Completed)
            .unwrap_or(false)
    })
    .await;

    assert!(h.clock.sleeps().contains(&h.ctx.config.retry.backoff(1)));
    let status = h.stored_domain().status.expect("status written");
    assert_eq!(status.phase, DomainPhase::Ready);
}

#[tokio::test]
async fn test_stopped_domain_is_not_requeued() {
    let h = Harness::with_config(test_config().with_failure_requeue(true));
    h.cluster.set_job_lifecycle(JobLifecycle::Fail);
    let domain = h.domain(json!({
        "domainUID": "d1",
        "domainName": "base_domain",
        "storage": {}
    }));

    let first = h.processor.make_right(&domain);
    h.processor.stop(NAMESPACE, "domain1");
    assert!(!matches!(first.join().await, FiberState::Completed));
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(h.processor.fiber(NAMESPACE, "domain1").is_none());
    assert!(h.events(reasons::DOMAIN_PROCESSING_STARTING).len() <= 1);
}
