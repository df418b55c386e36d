//! Integration tests for webhook identity bootstrap.

mod common;

use common::Harness;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use std::collections::BTreeMap;
use std::path::Path;
use wko_core::providers::{FileSystem, MemoryFs};
use wko_core::{ApiError, FailureKind, FiberState};
use wko_operator::controller::bootstrap_identity;
use wko_operator::events::reasons;
use wko_operator::identity::{CERT_ENTRY, IDENTITY_SECRET_NAME, KEY_ENTRY};
use wko_operator::testing::{ApiOp, FailureRule, StaticIdentityGenerator};

const OPERATOR_NS: &str = "weblogic-operator";
const KEY_PATH: &str = "/deployment/webhook-identity/webhookKey";
const CERT_PATH: &str = "/deployment/webhook-identity/webhookCert";

fn identity_secret(entries: &[(&str, &str)]) -> Secret {
    let data: BTreeMap<String, ByteString> = entries
        .iter()
        .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
        .collect();
    let mut secret = Secret {
        data: Some(data),
        ..Default::default()
    };
    secret.metadata.name = Some(IDENTITY_SECRET_NAME.to_string());
    secret
}

fn read(h: &Harness, path: &str) -> String {
    String::from_utf8(h.fs.read(Path::new(path)).expect("file exists")).expect("utf8")
}

fn stored_secret_entry(h: &Harness, entry: &str) -> Option<String> {
    h.cluster
        .typed::<Secret>(OPERATOR_NS, IDENTITY_SECRET_NAME)
        .and_then(|s| s.data)
        .and_then(|d| d.get(entry).cloned())
        .map(|b| String::from_utf8(b.0).expect("utf8"))
}

#[tokio::test]
async fn test_generates_identity_when_none_exists() {
    let h = Harness::new();

    let state = bootstrap_identity(&h.engine, &h.ctx).await;

    assert_eq!(state, FiberState::Completed);
    assert_eq!(h.identity.generated(), 1);
    assert_eq!(read(&h, KEY_PATH), StaticIdentityGenerator::KEY_PEM);
    assert_eq!(read(&h, CERT_PATH), StaticIdentityGenerator::CERT_PEM);
    assert_eq!(
        stored_secret_entry(&h, KEY_ENTRY).as_deref(),
        Some(StaticIdentityGenerator::KEY_PEM)
    );
    assert_eq!(
        stored_secret_entry(&h, CERT_ENTRY).as_deref(),
        Some(StaticIdentityGenerator::CERT_PEM)
    );
    assert_eq!(h.cluster.calls_to(ApiOp::Create, "Secret").len(), 1);
}

#[tokio::test]
async fn test_existing_files_are_used_without_touching_the_secret() {
    let h = Harness::with_fs(
        MemoryFs::new()
            .with_file(KEY_PATH, b"existing-key")
            .with_file(CERT_PATH, b"existing-cert"),
    );

    let state = bootstrap_identity(&h.engine, &h.ctx).await;

    assert_eq!(state, FiberState::Completed);
    assert_eq!(h.identity.generated(), 0);
    assert!(h.cluster.calls_to(ApiOp::Get, "Secret").is_empty());
    assert_eq!(read(&h, KEY_PATH), "existing-key");
}

#[tokio::test]
async fn test_secret_identity_is_written_to_files() {
    let h = Harness::new();
    h.cluster
        .insert(
            OPERATOR_NS,
            &identity_secret(&[(KEY_ENTRY, "secret-key"), (CERT_ENTRY, "secret-cert")]),
        )
        .unwrap();

    let state = bootstrap_identity(&h.engine, &h.ctx).await;

    assert_eq!(state, FiberState::Completed);
    assert_eq!(h.identity.generated(), 0);
    assert_eq!(read(&h, KEY_PATH), "secret-key");
    assert_eq!(read(&h, CERT_PATH), "secret-cert");
    assert!(h.cluster.calls_to(ApiOp::Replace, "Secret").is_empty());
    assert!(h.cluster.calls_to(ApiOp::Create, "Secret").is_empty());
}

#[tokio::test]
async fn test_conflict_on_secret_write_refetches_once() {
    let h = Harness::new();
    h.cluster
        .insert(OPERATOR_NS, &identity_secret(&[("unrelated", "x")]))
        .unwrap();
    h.cluster.inject(
        FailureRule::on(ApiOp::Replace, "Secret")
            .named(IDENTITY_SECRET_NAME)
            .respond(ApiError::conflict("Secret", IDENTITY_SECRET_NAME)),
    );

    let state = bootstrap_identity(&h.engine, &h.ctx).await;

    assert_eq!(state, FiberState::Completed);
    assert_eq!(h.cluster.calls_to(ApiOp::Get, "Secret").len(), 2);
    assert_eq!(h.cluster.calls_to(ApiOp::Replace, "Secret").len(), 2);
    assert_eq!(
        stored_secret_entry(&h, KEY_ENTRY).as_deref(),
        Some(StaticIdentityGenerator::KEY_PEM)
    );
    assert_eq!(stored_secret_entry(&h, "unrelated").as_deref(), Some("x"));
}

#[tokio::test]
async fn test_persistent_conflict_fails_and_records_event() {
    let h = Harness::new();
    h.cluster
        .insert(OPERATOR_NS, &identity_secret(&[]))
        .unwrap();
    h.cluster.inject(
        FailureRule::on(ApiOp::Replace, "Secret")
            .always()
            .respond(ApiError::conflict("Secret", IDENTITY_SECRET_NAME)),
    );

    let state = bootstrap_identity(&h.engine, &h.ctx).await;

    let failure = state.failure().expect("bootstrap fails");
    assert_eq!(failure.kind, FailureKind::Fatal);
    assert_eq!(h.cluster.calls_to(ApiOp::Replace, "Secret").len(), 2);

    let events = h.events(reasons::IDENTITY_BOOTSTRAP_FAILED);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["type"], "Warning");
    assert_eq!(events[0]["metadata"]["namespace"], OPERATOR_NS);
}

#[tokio::test]
async fn test_transient_error_is_retried() {
    let h = Harness::new();
    h.cluster.inject(FailureRule::on(ApiOp::Create, "Secret"));

    let state = bootstrap_identity(&h.engine, &h.ctx).await;

    assert_eq!(state, FiberState::Completed);
    assert_eq!(h.cluster.calls_to(ApiOp::Create, "Secret").len(), 2);
    assert!(h.events(reasons::IDENTITY_BOOTSTRAP_FAILED).is_empty());
}

#[tokio::test]
async fn test_read_only_filesystem_fails_and_records_event() {
    let h = Harness::with_fs(MemoryFs::new().with_read_only("/deployment"));

    let state = bootstrap_identity(&h.engine, &h.ctx).await;

    let failure = state.failure().expect("bootstrap fails");
    assert_eq!(failure.kind, FailureKind::StepError);
    assert!(h.fs.files().is_empty());
    assert_eq!(h.events(reasons::IDENTITY_BOOTSTRAP_FAILED).len(), 1);
}

#[tokio::test]
async fn test_forbidden_secret_read_is_not_retried() {
    let h = Harness::new();
    h.cluster.inject(
        FailureRule::on(ApiOp::Get, "Secret")
            .always()
            .respond(ApiError::status(403, "Forbidden", "secrets is forbidden")),
    );

    let state = bootstrap_identity(&h.engine, &h.ctx).await;

    assert_eq!(state.failure().map(|f| f.kind), Some(FailureKind::Fatal));
    assert_eq!(h.cluster.calls_to(ApiOp::Get, "Secret").len(), 1);
    assert_eq!(h.identity.generated(), 0);
}
