//! Shared harness for operator integration tests.

#![allow(dead_code)]

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use wko_core::providers::{MemoryFs, MockClock};
use wko_core::{Engine, FiberState};
use wko_operator::crd::{Domain, DomainSpec};
use wko_operator::resources::{
    build_routing_ingress, build_server_pod, build_server_service, ingress_name,
    ROUTING_SET_ANNOTATION,
};
use wko_operator::routing::RoutingSet;
use wko_operator::testing::{FakeCluster, FakeTrafficProbe, StaticIdentityGenerator};
use wko_operator::{DomainProcessor, OperatorConfig, OperatorContext};

pub const NAMESPACE: &str = "default";

/// Short waits so timeouts resolve quickly on the mock clock. Failed
/// make-rights are not requeued unless a test opts in.
pub fn test_config() -> OperatorConfig {
    OperatorConfig::default()
        .with_waits(Duration::from_secs(1), Duration::from_secs(30))
        .with_failure_requeue(false)
}

pub struct Harness {
    pub clock: Arc<MockClock>,
    pub cluster: Arc<FakeCluster>,
    pub fs: Arc<MemoryFs>,
    pub identity: Arc<StaticIdentityGenerator>,
    pub probe: Option<Arc<FakeTrafficProbe>>,
    pub ctx: Arc<OperatorContext>,
    pub engine: Engine,
    pub processor: Arc<DomainProcessor>,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(test_config(), MemoryFs::new(), false)
    }

    pub fn with_config(config: OperatorConfig) -> Self {
        Self::build(config, MemoryFs::new(), false)
    }

    pub fn with_fs(fs: MemoryFs) -> Self {
        Self::build(test_config(), fs, false)
    }

    pub fn with_probe(config: OperatorConfig) -> Self {
        Self::build(config, MemoryFs::new(), true)
    }

    fn build(config: OperatorConfig, fs: MemoryFs, probe: bool) -> Self {
        let clock = Arc::new(MockClock::fixed("2024-01-15T10:30:00Z"));
        let cluster = Arc::new(FakeCluster::new(clock.clone()));
        let fs = Arc::new(fs);
        let identity = Arc::new(StaticIdentityGenerator::new());
        let probe = probe.then(|| Arc::new(FakeTrafficProbe::new(cluster.clone())));

        let mut ctx = OperatorContext::new(cluster.clone(), config)
            .with_clock(clock.clone())
            .with_fs(fs.clone())
            .with_identity_generator(identity.clone());
        if let Some(probe) = &probe {
            ctx = ctx.with_probe(probe.clone());
        }
        let ctx = Arc::new(ctx);
        let engine = Engine::new(ctx.config.engine.clone(), clock.clone());
        let processor = Arc::new(DomainProcessor::new(ctx.clone(), engine.clone()));

        Self {
            clock,
            cluster,
            fs,
            identity,
            probe,
            ctx,
            engine,
            processor,
        }
    }

    /// Store a Domain in the fake cluster and return it as stored.
    pub fn domain(&self, spec: Value) -> Domain {
        let spec: DomainSpec = serde_json::from_value(spec).expect("valid domain spec");
        let mut domain = Domain::new("domain1", spec);
        domain.metadata.namespace = Some(NAMESPACE.to_string());
        let stored = self.cluster.insert(NAMESPACE, &domain).expect("insert domain");
        serde_json::from_value(stored).expect("decode domain")
    }

    /// The Domain as currently stored, status included.
    pub fn stored_domain(&self) -> Domain {
        self.cluster
            .typed::<Domain>(NAMESPACE, "domain1")
            .expect("domain exists")
    }

    pub async fn make_right(&self, domain: &Domain) -> FiberState {
        self.processor.make_right(domain).join().await
    }

    /// Pre-create running managed servers `1..=count` of a cluster and route to them.
    pub fn seed_cluster(&self, domain: &Domain, cluster: &str, count: i32) {
        let mut routing = RoutingSet::new();
        for index in 1..=count {
            let server_name = domain.spec.managed_server_name(cluster, index);
            let server = domain.spec.resolve_server(Some(cluster), &server_name);
            self.cluster
                .insert(NAMESPACE, &build_server_pod(domain, &server))
                .expect("insert pod");
            self.cluster
                .insert(NAMESPACE, &build_server_service(domain, &server))
                .expect("insert service");
            routing.insert(server_name);
        }
        self.cluster
            .insert(NAMESPACE, &build_routing_ingress(domain, cluster, &routing))
            .expect("insert ingress");
    }

    pub fn pod(&self, domain: &Domain, server_name: &str) -> Option<Value> {
        self.cluster.object(
            "Pod",
            NAMESPACE,
            &domain.spec.server_object_name(server_name),
        )
    }

    pub fn pod_names(&self) -> Vec<String> {
        self.cluster.names("Pod")
    }

    /// Current routing set of a cluster.
    pub fn routing(&self, domain: &Domain, cluster: &str) -> Vec<String> {
        self.cluster
            .object(
                "Ingress",
                NAMESPACE,
                &ingress_name(&domain.spec.domain_uid, cluster),
            )
            .map(|ingress| routing_of(&ingress))
            .unwrap_or_default()
    }

    /// Every routing set written for a cluster, oldest first.
    pub fn routing_history(&self, domain: &Domain, cluster: &str) -> Vec<Vec<String>> {
        self.cluster
            .history(
                "Ingress",
                NAMESPACE,
                &ingress_name(&domain.spec.domain_uid, cluster),
            )
            .iter()
            .map(routing_of)
            .collect()
    }

    /// Events with a reason, in creation order.
    pub fn events(&self, reason: &str) -> Vec<Value> {
        let mut events: Vec<Value> = self
            .cluster
            .objects("Event")
            .into_iter()
            .filter(|e| e["reason"] == reason)
            .collect();
        events.sort_by_key(|e| {
            e.pointer("/metadata/resourceVersion")
                .and_then(Value::as_str)
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or_default()
        });
        events
    }
}

/// Poll `condition` in real time until it holds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

fn routing_of(ingress: &Value) -> Vec<String> {
    ingress
        .pointer("/metadata/annotations")
        .and_then(|a| a.get(ROUTING_SET_ANNOTATION))
        .and_then(Value::as_str)
        .map(|v| RoutingSet::from_annotation(v).to_vec())
        .unwrap_or_default()
}
