//! Webhook identity bootstrap.
//!
//! The identity is taken from the first source that has one: the identity
//! files, the `webhook-secrets` Secret, or a freshly generated self-signed
//! pair. Whatever the source, the files end up holding it; a generated
//! identity is also published to the Secret.
//!
//! The bootstrap chain runs as a child fiber of [`VerifyIdentity`], so it can
//! finish early once a source is found without ending the caller's chain.

use super::{domain, keys, retry};
use crate::controller::OperatorContext;
use crate::events::{reasons, EventType};
use crate::identity::{webhook_subject, Identity, CERT_ENTRY, IDENTITY_SECRET_NAME, KEY_ENTRY};
use crate::crd::Domain;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use std::collections::BTreeMap;
use std::sync::Arc;
use wko_core::{
    Failure, FailureKind, NextAction, Packet, Step, StepChain, StepError, StepFuture, StepResult,
};

/// Where the identity came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentitySource {
    /// Identity files.
    Files,
    /// The identity Secret.
    Secret,
    /// Generated during this run.
    Generated,
}

fn identity_of(packet: &Packet) -> Result<Arc<Identity>, StepError> {
    packet
        .get_arc::<Identity>(keys::IDENTITY)
        .ok_or_else(|| StepError::MissingPacketEntry(keys::IDENTITY.to_string()))
}

fn secret_identity(secret: &Secret) -> Option<Identity> {
    let data = secret.data.as_ref()?;
    let entry = |key: &str| {
        data.get(key)
            .and_then(|bytes| String::from_utf8(bytes.0.clone()).ok())
            .filter(|s| !s.is_empty())
    };
    Some(Identity {
        key_pem: entry(KEY_ENTRY)?,
        cert_pem: entry(CERT_ENTRY)?,
    })
}

/// Use the identity files if both exist.
struct ReadIdentityFiles {
    ctx: Arc<OperatorContext>,
}

impl Step for ReadIdentityFiles {
    fn name(&self) -> &str {
        "ReadIdentityFiles"
    }

    fn apply<'a>(&'a self, packet: &'a mut Packet) -> StepFuture<'a> {
        Box::pin(async move {
            let key_path = self.ctx.config.identity_key_path();
            let cert_path = self.ctx.config.identity_cert_path();

            let key = self
                .ctx
                .fs
                .read_optional(&key_path)
                .map_err(|e| StepError::io(key_path.display().to_string(), &e))?;
            let cert = self
                .ctx
                .fs
                .read_optional(&cert_path)
                .map_err(|e| StepError::io(cert_path.display().to_string(), &e))?;

            match (key, cert) {
                (Some(key), Some(cert)) => {
                    let identity = Identity {
                        key_pem: String::from_utf8_lossy(&key).into_owned(),
                        cert_pem: String::from_utf8_lossy(&cert).into_owned(),
                    };
                    tracing::debug!(dir = %self.ctx.config.identity_dir.display(), "Using identity files");
                    packet.put(keys::IDENTITY, identity);
                    packet.put(keys::IDENTITY_SOURCE, IdentitySource::Files);
                    Ok(NextAction::success())
                }
                _ => Ok(NextAction::Continue),
            }
        })
    }
}

/// Use the identity Secret if it holds both entries.
struct ReadIdentitySecret {
    ctx: Arc<OperatorContext>,
}

impl Step for ReadIdentitySecret {
    fn name(&self) -> &str {
        "ReadIdentitySecret"
    }

    fn apply<'a>(&'a self, packet: &'a mut Packet) -> StepFuture<'a> {
        Box::pin(async move {
            let ns = &self.ctx.config.namespace;
            let secret = match self.ctx.client.get_opt::<Secret>(ns, IDENTITY_SECRET_NAME).await {
                Ok(secret) => secret,
                Err(e) => return retry(&self.ctx, packet, self.name(), &e),
            };
            self.ctx.config.retry.reset(packet, self.name());

            if let Some(secret) = secret {
                if let Some(identity) = secret_identity(&secret) {
                    tracing::debug!(secret = %IDENTITY_SECRET_NAME, "Using identity Secret");
                    packet.put(keys::IDENTITY, identity);
                    packet.put(keys::IDENTITY_SOURCE, IdentitySource::Secret);
                }
                packet.put(keys::IDENTITY_SECRET, secret);
            }
            Ok(NextAction::Continue)
        })
    }
}

/// Generate a self-signed identity when no source had one.
struct GenerateIdentity {
    ctx: Arc<OperatorContext>,
}

impl Step for GenerateIdentity {
    fn name(&self) -> &str {
        "GenerateIdentity"
    }

    fn apply<'a>(&'a self, packet: &'a mut Packet) -> StepFuture<'a> {
        Box::pin(async move {
            if packet.contains(keys::IDENTITY) {
                return Ok(NextAction::Continue);
            }
            let identity = self
                .ctx
                .identity
                .generate(&webhook_subject(&self.ctx.config.namespace))?;
            tracing::info!("Generated a new webhook identity");
            packet.put(keys::IDENTITY, identity);
            packet.put(keys::IDENTITY_SOURCE, IdentitySource::Generated);
            Ok(NextAction::Continue)
        })
    }
}

/// Write the identity to the identity files.
struct WriteIdentityFiles {
    ctx: Arc<OperatorContext>,
}

impl Step for WriteIdentityFiles {
    fn name(&self) -> &str {
        "WriteIdentityFiles"
    }

    fn apply<'a>(&'a self, packet: &'a mut Packet) -> StepFuture<'a> {
        Box::pin(async move {
            let identity = identity_of(packet)?;
            let dir = &self.ctx.config.identity_dir;
            self.ctx
                .fs
                .create_dir_all(dir)
                .map_err(|e| StepError::io(dir.display().to_string(), &e))?;

            for (path, contents) in [
                (self.ctx.config.identity_key_path(), &identity.key_pem),
                (self.ctx.config.identity_cert_path(), &identity.cert_pem),
            ] {
                self.ctx
                    .fs
                    .write(&path, contents.as_bytes())
                    .map_err(|e| StepError::io(path.display().to_string(), &e))?;
            }
            Ok(NextAction::Continue)
        })
    }
}

/// Create or replace the identity Secret with a generated identity.
///
/// A conflict triggers exactly one refetch followed by another write; a
/// second conflict is terminal.
struct PublishIdentitySecret {
    ctx: Arc<OperatorContext>,
}

impl PublishIdentitySecret {
    fn secret(&self, identity: &Identity, existing: Option<&Secret>) -> Secret {
        let mut data = existing
            .and_then(|s| s.data.clone())
            .unwrap_or_default();
        data.insert(KEY_ENTRY.to_string(), ByteString(identity.key_pem.as_bytes().to_vec()));
        data.insert(CERT_ENTRY.to_string(), ByteString(identity.cert_pem.as_bytes().to_vec()));

        let metadata = match existing {
            Some(secret) => secret.metadata.clone(),
            None => ObjectMeta {
                name: Some(IDENTITY_SECRET_NAME.to_string()),
                namespace: Some(self.ctx.config.namespace.clone()),
                labels: Some(BTreeMap::from([(
                    crate::resources::LABEL_CREATED_BY_OPERATOR.to_string(),
                    "true".to_string(),
                )])),
                ..Default::default()
            },
        };
        Secret {
            metadata,
            data: Some(data),
            type_: Some("Opaque".to_string()),
            ..Default::default()
        }
    }

    async fn write(&self, identity: &Identity, existing: Option<&Secret>) -> Result<(), wko_core::ApiError> {
        let ns = &self.ctx.config.namespace;
        let secret = self.secret(identity, existing);
        match existing {
            Some(_) => self
                .ctx
                .client
                .replace(ns, IDENTITY_SECRET_NAME, &secret)
                .await
                .map(|_| ()),
            None => self.ctx.client.create(ns, &secret).await.map(|_| ()),
        }
    }

    fn conflict_persisted(&self, err: &wko_core::ApiError) -> StepResult {
        Ok(NextAction::fail(
            Failure::new(
                FailureKind::Fatal,
                format!("conflict persisted writing Secret {}: {}", IDENTITY_SECRET_NAME, err),
            )
            .in_step(self.name()),
        ))
    }
}

impl Step for PublishIdentitySecret {
    fn name(&self) -> &str {
        "PublishIdentitySecret"
    }

    fn apply<'a>(&'a self, packet: &'a mut Packet) -> StepFuture<'a> {
        Box::pin(async move {
            if packet.get_cloned::<IdentitySource>(keys::IDENTITY_SOURCE)
                != Some(IdentitySource::Generated)
            {
                return Ok(NextAction::Continue);
            }
            let identity = identity_of(packet)?;
            let existing = packet.get_arc::<Secret>(keys::IDENTITY_SECRET);

            let err = match self.write(&identity, existing.as_deref()).await {
                Ok(()) => {
                    tracing::info!(secret = %IDENTITY_SECRET_NAME, "Published webhook identity");
                    self.ctx.config.retry.reset(packet, self.name());
                    return Ok(NextAction::Continue);
                }
                Err(e) => e,
            };
            if !err.is_conflict() {
                return retry(&self.ctx, packet, self.name(), &err);
            }

            tracing::debug!(secret = %IDENTITY_SECRET_NAME, "Conflict writing identity Secret, refetching");
            let ns = &self.ctx.config.namespace;
            let latest = match self.ctx.client.get_opt::<Secret>(ns, IDENTITY_SECRET_NAME).await {
                Ok(latest) => latest,
                Err(e) => return retry(&self.ctx, packet, self.name(), &e),
            };
            match self.write(&identity, latest.as_ref()).await {
                Ok(()) => {
                    tracing::info!(secret = %IDENTITY_SECRET_NAME, "Published webhook identity after refetch");
                    self.ctx.config.retry.reset(packet, self.name());
                    Ok(NextAction::Continue)
                }
                Err(e) if e.is_conflict() => self.conflict_persisted(&e),
                Err(e) => retry(&self.ctx, packet, self.name(), &e),
            }
        })
    }
}

/// The bootstrap chain.
pub fn identity_chain(ctx: &Arc<OperatorContext>) -> StepChain {
    StepChain::from_steps([
        Arc::new(ReadIdentityFiles { ctx: ctx.clone() }) as Arc<dyn Step>,
        Arc::new(ReadIdentitySecret { ctx: ctx.clone() }),
        Arc::new(GenerateIdentity { ctx: ctx.clone() }),
        Arc::new(WriteIdentityFiles { ctx: ctx.clone() }),
        Arc::new(PublishIdentitySecret { ctx: ctx.clone() }),
    ])
}

/// Establish the webhook identity, failing with an `IdentityBootstrapFailed`
/// event if it cannot be.
pub struct VerifyIdentity {
    ctx: Arc<OperatorContext>,
}

impl VerifyIdentity {
    /// Create the step.
    pub fn new(ctx: Arc<OperatorContext>) -> Self {
        Self { ctx }
    }
}

impl Step for VerifyIdentity {
    fn name(&self) -> &str {
        "VerifyIdentity"
    }

    fn apply<'a>(&'a self, _packet: &'a mut Packet) -> StepFuture<'a> {
        Box::pin(async move {
            Ok(NextAction::invoke(
                vec![identity_chain(&self.ctx)],
                StepChain::single(RecordIdentityOutcome {
                    ctx: self.ctx.clone(),
                }),
            ))
        })
    }
}

struct RecordIdentityOutcome {
    ctx: Arc<OperatorContext>,
}

impl Step for RecordIdentityOutcome {
    fn name(&self) -> &str {
        "RecordIdentityOutcome"
    }

    fn apply<'a>(&'a self, packet: &'a mut Packet) -> StepFuture<'a> {
        Box::pin(async move {
            let Some(failure) = packet.join_failure().cloned() else {
                return Ok(NextAction::Continue);
            };

            let message = format!("webhook identity could not be established: {}", failure);
            tracing::error!(failure = %failure, "Identity bootstrap failed");
            self.ctx
                .events
                .namespace_event(
                    &self.ctx.config.namespace,
                    EventType::Warning,
                    reasons::IDENTITY_BOOTSTRAP_FAILED,
                    &message,
                )
                .await;
            if let Ok(domain) = domain(packet) {
                let domain: &Domain = &domain;
                self.ctx
                    .events
                    .domain_event(
                        domain,
                        EventType::Warning,
                        reasons::IDENTITY_BOOTSTRAP_FAILED,
                        &message,
                    )
                    .await;
            }
            Ok(NextAction::fail(failure))
        })
    }
}
