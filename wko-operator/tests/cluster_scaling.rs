//! Integration tests for cluster scale-up and scale-down.

mod common;

use common::{test_config, Harness, NAMESPACE};
use k8s_openapi::api::core::v1::Pod;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use wko_core::{FailureKind, FiberState};
use wko_operator::crd::DomainPhase;
use wko_operator::events::reasons;
use wko_operator::testing::{ApiOp, PodLifecycle};
use wko_operator::ScaleDownPolicy;

fn clustered(replicas: i32) -> Value {
    json!({
        "domainUID": "d1",
        "domainName": "base_domain",
        "clusterStartup": [{ "clusterName": "c1", "replicas": replicas }]
    })
}

fn names(range: std::ops::RangeInclusive<i32>) -> Vec<String> {
    range.map(|i| format!("c1-ms-{}", i)).collect()
}

fn identity_of(pod: &Value) -> (Value, Value) {
    (
        pod["metadata"]["uid"].clone(),
        pod["metadata"]["creationTimestamp"].clone(),
    )
}

fn deleted_pods(h: &Harness) -> Vec<String> {
    h.cluster
        .calls_to(ApiOp::Delete, "Pod")
        .into_iter()
        .map(|c| c.name)
        .collect()
}

#[tokio::test]
async fn test_scale_up_keeps_running_pods_and_adds_one_at_a_time() {
    let h = Harness::new();
    let domain = h.domain(clustered(4));
    h.seed_cluster(&domain, "c1", 2);
    let before: Vec<_> = names(1..=2)
        .iter()
        .map(|s| identity_of(&h.pod(&domain, s).unwrap()))
        .collect();
    h.clock.advance(std::time::Duration::from_secs(60));

    let state = h.make_right(&domain).await;

    assert_eq!(state, FiberState::Completed);
    let after: Vec<_> = names(1..=2)
        .iter()
        .map(|s| identity_of(&h.pod(&domain, s).unwrap()))
        .collect();
    assert_eq!(before, after);
    for server in names(3..=4) {
        assert!(h.pod(&domain, &server).is_some(), "{} created", server);
    }
    assert!(deleted_pods(&h).is_empty());

    assert_eq!(h.routing(&domain, "c1"), names(1..=4));
    assert_eq!(
        h.routing_history(&domain, "c1"),
        vec![names(1..=2), names(1..=3), names(1..=4)]
    );
}

#[tokio::test]
async fn test_scale_down_deletes_highest_index_first() {
    let h = Harness::new();
    let domain = h.domain(clustered(1));
    h.seed_cluster(&domain, "c1", 4);

    let state = h.make_right(&domain).await;

    assert_eq!(state, FiberState::Completed);
    assert_eq!(
        deleted_pods(&h),
        vec!["d1-c1-ms-4", "d1-c1-ms-3", "d1-c1-ms-2"]
    );
    assert!(h.pod(&domain, "c1-ms-1").is_some());
    for server in names(2..=4) {
        assert!(h.pod(&domain, &server).is_none(), "{} deleted", server);
    }
    assert_eq!(h.routing(&domain, "c1"), names(1..=1));
    assert_eq!(
        h.routing_history(&domain, "c1"),
        vec![names(1..=4), names(1..=3), names(1..=2), names(1..=1)]
    );
}

#[tokio::test]
async fn test_drain_before_delete_removes_route_before_each_pod() {
    let h = Harness::with_config(
        test_config().with_scale_down_policy(ScaleDownPolicy::DrainBeforeDelete),
    );
    let domain = h.domain(clustered(1));
    h.seed_cluster(&domain, "c1", 3);

    let state = h.make_right(&domain).await;

    assert_eq!(state, FiberState::Completed);
    let sequence: Vec<String> = h
        .cluster
        .calls()
        .into_iter()
        .filter_map(|c| match (c.op, c.kind.as_str()) {
            (ApiOp::Replace, "Ingress") => Some("route".to_string()),
            (ApiOp::Delete, "Pod") => Some(c.name),
            _ => None,
        })
        .collect();
    assert_eq!(
        sequence,
        vec!["route", "d1-c1-ms-3", "route", "d1-c1-ms-2"]
    );
    assert_eq!(h.routing(&domain, "c1"), names(1..=1));
}

#[tokio::test]
async fn test_server_that_never_becomes_ready_fails_without_rollback() {
    let h = Harness::new();
    let domain = h.domain(clustered(4));
    h.seed_cluster(&domain, "c1", 2);
    h.cluster
        .set_pod_lifecycle_for("d1-c1-ms-3", PodLifecycle::NeverReady);

    let state = h.make_right(&domain).await;

    let failure = state.failure().expect("scale-up fails");
    assert_eq!(failure.kind, FailureKind::Timeout);
    assert!(h.pod(&domain, "c1-ms-3").is_some());
    assert!(h.pod(&domain, "c1-ms-4").is_some());
    assert!(deleted_pods(&h).is_empty());
    assert_eq!(h.routing(&domain, "c1"), names(1..=2));

    let status = h.stored_domain().status.expect("status written");
    assert_eq!(status.phase, DomainPhase::Failed);
    assert_eq!(status.reason.as_deref(), Some("Timeout"));
    assert_eq!(h.events(reasons::DOMAIN_PROCESSING_FAILED).len(), 1);
}

#[tokio::test]
async fn test_scale_up_resumes_after_stuck_server_becomes_ready() {
    let h = Harness::new();
    let domain = h.domain(clustered(4));
    h.seed_cluster(&domain, "c1", 2);
    h.cluster
        .set_pod_lifecycle_for("d1-c1-ms-3", PodLifecycle::NeverReady);
    assert!(h.make_right(&domain).await.failure().is_some());
    let before: Vec<_> = names(1..=4)
        .iter()
        .map(|s| identity_of(&h.pod(&domain, s).unwrap()))
        .collect();

    assert!(h.cluster.set_pod_ready(NAMESPACE, "d1-c1-ms-3", true));
    let state = h.make_right(&h.stored_domain()).await;

    assert_eq!(state, FiberState::Completed);
    assert_eq!(h.routing(&domain, "c1"), names(1..=4));
    let after: Vec<_> = names(1..=4)
        .iter()
        .map(|s| identity_of(&h.pod(&domain, s).unwrap()))
        .collect();
    assert_eq!(before, after);
    assert!(deleted_pods(&h).is_empty());
    let created: Vec<String> = h
        .cluster
        .calls_to(ApiOp::Create, "Pod")
        .into_iter()
        .map(|c| c.name)
        .filter(|name| name.starts_with("d1-c1-"))
        .collect();
    assert_eq!(created, vec!["d1-c1-ms-3", "d1-c1-ms-4"]);
    assert!(h
        .routing_history(&domain, "c1")
        .iter()
        .all(|set| set.len() >= 2));
    assert_eq!(
        h.stored_domain().status.expect("status written").phase,
        DomainPhase::Ready
    );
}

#[tokio::test]
async fn test_stale_route_is_dropped_before_server_is_recreated() {
    let h = Harness::new();
    let domain = h.domain(clustered(2));
    h.seed_cluster(&domain, "c1", 2);
    h.ctx
        .client
        .delete::<Pod>(NAMESPACE, "d1-c1-ms-2")
        .await
        .unwrap();

    let state = h.make_right(&domain).await;

    assert_eq!(state, FiberState::Completed);
    assert_eq!(
        h.routing_history(&domain, "c1"),
        vec![names(1..=2), names(1..=1), names(1..=2)]
    );
}

#[tokio::test]
async fn test_traffic_reaches_exactly_the_routed_servers() {
    let h = Harness::with_probe(test_config());
    let domain = h.domain(clustered(1));
    h.seed_cluster(&domain, "c1", 3);

    let state = h.make_right(&domain).await;

    assert_eq!(state, FiberState::Completed);
    let records = h.probe.as_ref().unwrap().records();
    let last = records.last().expect("probe ran");
    assert_eq!(last.cluster, "c1");
    let candidates: BTreeSet<String> = last.candidates.iter().cloned().collect();
    assert_eq!(candidates, names(1..=3).into_iter().collect::<BTreeSet<_>>());
    assert_eq!(last.seen, names(1..=1).into_iter().collect::<BTreeSet<_>>());
}

#[tokio::test]
async fn test_clusters_scale_independently() {
    let h = Harness::new();
    let domain = h.domain(json!({
        "domainUID": "d1",
        "domainName": "base_domain",
        "clusterStartup": [
            { "clusterName": "c1", "replicas": 3 },
            { "clusterName": "c2", "replicas": 1 }
        ]
    }));
    h.seed_cluster(&domain, "c2", 2);

    let state = h.make_right(&domain).await;

    assert_eq!(state, FiberState::Completed);
    assert_eq!(h.routing(&domain, "c1"), names(1..=3));
    assert_eq!(h.routing(&domain, "c2"), vec!["c2-ms-1".to_string()]);
    assert_eq!(deleted_pods(&h), vec!["d1-c2-ms-2"]);

    let status = h.stored_domain().status.expect("status written");
    assert_eq!(status.phase, DomainPhase::Ready);
    let routed: Vec<(String, Vec<String>)> = status
        .clusters
        .iter()
        .map(|c| (c.cluster_name.clone(), c.routing_set.clone()))
        .collect();
    assert_eq!(
        routed,
        vec![
            ("c1".to_string(), names(1..=3)),
            ("c2".to_string(), vec!["c2-ms-1".to_string()]),
        ]
    );
}
