//! WKO Kubernetes Operator binary.
//!
//! Runs the domain operator: bootstraps the webhook identity, then watches
//! Domains and their Pods and Services and reconciles them until interrupted.

use kube::{Client, CustomResourceExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use wko_core::Engine;
use wko_operator::controller::bootstrap_identity;
use wko_operator::crd::Domain;
use wko_operator::observability::{init_tracing, TracingConfig};
use wko_operator::watch::kube_event_stream;
use wko_operator::{DomainProcessor, KubeBackend, OperatorConfig, OperatorContext, WatchConsumer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Check for CRD generation mode
    if std::env::args().any(|arg| arg == "--generate-crds") {
        generate_crds()?;
        return Ok(());
    }

    init_tracing(&TracingConfig::from_env())?;
    tracing::info!("Starting WKO Kubernetes Operator");

    let config = OperatorConfig::from_env();
    let watch_namespace = std::env::var("WKO_WATCH_NAMESPACE").ok().filter(|s| !s.is_empty());

    let client = Client::try_default().await?;
    tracing::info!("Connected to Kubernetes cluster");

    let ctx = Arc::new(OperatorContext::new(
        Arc::new(KubeBackend::new(client.clone())),
        config,
    ));
    let engine = Engine::new(ctx.config.engine.clone(), ctx.clock.clone());

    bootstrap_identity(&engine, &ctx).await;

    let processor = Arc::new(DomainProcessor::new(ctx.clone(), engine.clone()));
    let consumer = WatchConsumer::new(ctx.cache.clone(), processor.clone(), ctx.clock.clone());
    let shutdown = CancellationToken::new();

    tracing::info!(
        namespace = watch_namespace.as_deref().unwrap_or("<all>"),
        "Watching domains"
    );
    let events = kube_event_stream(client, watch_namespace.as_deref());

    tokio::select! {
        _ = consumer.run(events, shutdown.clone()) => {
            tracing::error!("Watch consumer exited");
        }
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!("Shutting down");
        }
    }

    shutdown.cancel();
    processor.shutdown();
    engine.shutdown();
    Ok(())
}

/// Generate CRD YAML.
fn generate_crds() -> anyhow::Result<()> {
    println!("---");
    println!("{}", serde_yaml::to_string(&Domain::crd())?);
    Ok(())
}
