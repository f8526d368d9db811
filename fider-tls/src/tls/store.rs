//! Operator-provided static certificate

use super::certificate::{CertError, LeafMetadata, TlsCertificate};
use std::path::Path;
use std::sync::Arc;

/// Holds the statically configured certificate, if any.
///
/// Written once at construction and only read afterwards, so it is shared
/// between handshakes without synchronization.
#[derive(Debug, Clone, Default)]
pub struct StaticCertificateStore {
    cert: Option<Arc<TlsCertificate>>,
}

impl StaticCertificateStore {
    /// A store without a certificate; selection then relies on ACME only
    pub fn empty() -> Self {
        Self { cert: None }
    }

    /// Load the certificate chain and key from PEM files
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self, CertError> {
        let cert = TlsCertificate::from_files(cert_path, key_path)?;
        tracing::info!(
            cert_path = %cert_path.display(),
            subject = %cert.leaf().subject,
            dns_names = ?cert.leaf().dns_names,
            expires_in_days = cert.leaf().days_until_expiry(),
            "Loaded static certificate"
        );
        if cert.leaf().is_expired() {
            tracing::warn!(
                cert_path = %cert_path.display(),
                "Static certificate is expired"
            );
        }
        Ok(Self::from_certificate(cert))
    }

    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, CertError> {
        Ok(Self::from_certificate(TlsCertificate::from_pem(
            cert_pem, key_pem,
        )?))
    }

    pub fn from_certificate(cert: TlsCertificate) -> Self {
        Self {
            cert: Some(Arc::new(cert)),
        }
    }

    pub fn certificate(&self) -> Option<&Arc<TlsCertificate>> {
        self.cert.as_ref()
    }

    pub fn leaf(&self) -> Option<&LeafMetadata> {
        self.cert.as_ref().map(|c| c.leaf())
    }

    pub fn is_configured(&self) -> bool {
        self.cert.is_some()
    }
}
