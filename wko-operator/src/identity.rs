//! Webhook identity: a private key and a self-signed certificate.

use crate::error::OperatorResult;
use rcgen::{CertificateParams, DnType, KeyPair};

/// Name of the Secret mirroring the identity.
pub const IDENTITY_SECRET_NAME: &str = "webhook-secrets";
/// Secret key (and file name) of the private key.
pub const KEY_ENTRY: &str = "webhookKey";
/// Secret key (and file name) of the certificate.
pub const CERT_ENTRY: &str = "webhookCert";

/// PEM-encoded key pair and certificate.
#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    /// Private key (PEM).
    pub key_pem: String,
    /// Certificate (PEM).
    pub cert_pem: String,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("key_pem", &"<redacted>")
            .field("cert_len", &self.cert_pem.len())
            .finish()
    }
}

/// Generates fresh identities.
pub trait IdentityGenerator: Send + Sync {
    /// Generate a key pair and a certificate for `subject`.
    fn generate(&self, subject: &str) -> OperatorResult<Identity>;
}

/// Generator producing self-signed certificates.
#[derive(Debug, Clone, Default)]
pub struct SelfSignedGenerator;

impl IdentityGenerator for SelfSignedGenerator {
    fn generate(&self, subject: &str) -> OperatorResult<Identity> {
        let mut params = CertificateParams::new(vec![subject.to_string()])?;
        params.distinguished_name.push(DnType::CommonName, subject);

        let key_pair = KeyPair::generate()?;
        let cert = params.self_signed(&key_pair)?;

        tracing::debug!(subject = %subject, "Generated self-signed identity");
        Ok(Identity {
            key_pem: key_pair.serialize_pem(),
            cert_pem: cert.pem(),
        })
    }
}

/// DNS name of the operator's webhook service.
pub fn webhook_subject(namespace: &str) -> String {
    format!("weblogic-operator-webhook-svc.{}.svc", namespace)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_signed_identity_is_pem() {
        let identity = SelfSignedGenerator
            .generate(&webhook_subject("weblogic-operator"))
            .unwrap();
        assert!(identity.key_pem.contains("PRIVATE KEY"));
        assert!(identity.cert_pem.starts_with("-----BEGIN CERTIFICATE-----"));
    }

    #[test]
    fn debug_redacts_key() {
        let identity = Identity {
            key_pem: "secret".into(),
            cert_pem: "cert".into(),
        };
        assert!(!format!("{:?}", identity).contains("secret"));
    }
}
