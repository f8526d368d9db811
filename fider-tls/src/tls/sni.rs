//! SNI-based certificate selection for TLS
//!
//! Implements dynamic certificate selection during TLS handshake
//! based on the SNI (Server Name Indication) hostname.

use super::certificate::TlsCertificate;
use super::manager::CertificateManager;
use async_trait::async_trait;
use openssl::error::ErrorStack;
use openssl::pkey::{PKey, Private};
use openssl::ssl::{NameType, SslRef};
use openssl::x509::X509;
use pingora_core::listeners::TlsAccept;
use std::sync::Arc;
use thiserror::Error;

/// Resolves the handshake certificate through the [`CertificateManager`]
pub struct SniCertResolver {
    manager: Arc<CertificateManager>,
}

impl SniCertResolver {
    pub fn new(manager: Arc<CertificateManager>) -> Self {
        Self { manager }
    }
}

impl std::fmt::Debug for SniCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SniCertResolver").finish()
    }
}

#[async_trait]
impl TlsAccept for SniCertResolver {
    async fn certificate_callback(&self, ssl: &mut SslRef) {
        let sni_hostname = ssl.servername(NameType::HOST_NAME).map(str::to_string);

        tracing::debug!(hostname = ?sni_hostname, "SNI certificate lookup");

        match self.manager.select_certificate(sni_hostname.as_deref()).await {
            Ok(cert) => {
                if let Err(e) = install_certificate(ssl, &cert) {
                    // The handshake fails on the partially configured session
                    tracing::error!(
                        hostname = ?sni_hostname,
                        subject = %cert.leaf().subject,
                        chain_len = cert.intermediates().len() + 1,
                        "Failed to install certificate, aborting handshake: {}", e
                    );
                }
            }
            Err(e) => {
                // Nothing installed, so the handshake fails
                tracing::warn!(hostname = ?sni_hostname, "Rejecting TLS handshake: {}", e);
            }
        }
    }
}

/// Step of certificate installation that failed
#[derive(Debug, Error)]
enum InstallError {
    #[error("setting leaf certificate: {0}")]
    Leaf(#[source] ErrorStack),

    #[error("adding intermediate {index}: {source}")]
    Intermediate {
        index: usize,
        #[source]
        source: ErrorStack,
    },

    #[error("setting private key: {0}")]
    PrivateKey(#[source] ErrorStack),
}

fn install_certificate(ssl: &mut SslRef, cert: &TlsCertificate) -> Result<(), InstallError> {
    install_parts(
        ssl,
        cert.leaf_certificate(),
        cert.intermediates(),
        cert.private_key(),
    )
}

fn install_parts(
    ssl: &mut SslRef,
    leaf: &X509,
    intermediates: &[X509],
    key: &PKey<Private>,
) -> Result<(), InstallError> {
    ssl.set_certificate(leaf).map_err(InstallError::Leaf)?;
    for (index, intermediate) in intermediates.iter().enumerate() {
        ssl.add_chain_cert(intermediate.clone())
            .map_err(|source| InstallError::Intermediate { index, source })?;
    }
    ssl.set_private_key(key).map_err(InstallError::PrivateKey)?;
    Ok(())
}

/// Create TLS callbacks for SNI-based certificate selection
pub fn create_sni_callbacks(manager: Arc<CertificateManager>) -> Box<dyn TlsAccept + Send + Sync> {
    Box::new(SniCertResolver::new(manager))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::autocert::{AutoCert, AutoCertError};
    use crate::tls::certificate::test_support::self_signed_pem;
    use crate::tls::manager::DeploymentPolicy;
    use crate::tls::store::StaticCertificateStore;
    use openssl::ssl::{Ssl, SslContext, SslMethod};

    struct NoAutoCert;

    #[async_trait]
    impl AutoCert for NoAutoCert {
        async fn issue_or_fetch(
            &self,
            server_name: &str,
        ) -> Result<Arc<TlsCertificate>, AutoCertError> {
            Err(AutoCertError::InvalidServerName(server_name.to_string()))
        }
    }

    #[test]
    fn test_install_certificate_sets_leaf_and_key() {
        let (cert_pem, key_pem) = self_signed_pem(&["feedback.fider.io"]);
        let cert = TlsCertificate::from_pem(cert_pem.as_bytes(), key_pem.as_bytes()).unwrap();

        let ctx = SslContext::builder(SslMethod::tls()).unwrap().build();
        let mut ssl = Ssl::new(&ctx).unwrap();
        install_certificate(&mut ssl, &cert).unwrap();

        let installed = ssl.certificate().unwrap();
        assert_eq!(
            installed.to_der().unwrap(),
            cert.leaf_certificate().to_der().unwrap()
        );
    }

    #[tokio::test]
    async fn test_failed_selection_installs_nothing() {
        let manager = Arc::new(CertificateManager::new(
            StaticCertificateStore::empty(),
            DeploymentPolicy::multi_tenant("fider.io"),
            Arc::new(NoAutoCert),
        ));
        let resolver = SniCertResolver::new(manager);

        let ctx = SslContext::builder(SslMethod::tls()).unwrap().build();
        let mut ssl = Ssl::new(&ctx).unwrap();

        resolver.certificate_callback(&mut ssl).await;
        assert!(ssl.certificate().is_none());
    }

    #[test]
    fn test_mismatched_key_reports_failing_step() {
        let (cert_pem, _) = self_signed_pem(&["feedback.fider.io"]);
        let (_, other_key_pem) = self_signed_pem(&["other.fider.io"]);
        let leaf = X509::from_pem(cert_pem.as_bytes()).unwrap();
        let key = PKey::private_key_from_pem(other_key_pem.as_bytes()).unwrap();

        let ctx = SslContext::builder(SslMethod::tls()).unwrap().build();
        let mut ssl = Ssl::new(&ctx).unwrap();
        let err = install_parts(&mut ssl, &leaf, &[], &key).unwrap_err();

        assert!(matches!(err, InstallError::PrivateKey(_)));
        assert!(err.to_string().starts_with("setting private key"));
    }
}
