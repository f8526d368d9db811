//! Certificate selection per TLS handshake
//!
//! Chooses between the operator-provided static certificate and the
//! automated (ACME) path based on the requested server name and the
//! deployment policy.

use super::autocert::{AutoCert, AutoCertError};
use super::certificate::TlsCertificate;
use super::name::{is_bare_name, is_within_domain, normalize_server_name};
use super::store::StaticCertificateStore;
use std::sync::Arc;
use thiserror::Error;

/// How hostnames relate to the static certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeploymentPolicy {
    /// One site; every named request gets the static certificate
    SingleHost,
    /// Tenants live under `base_domain`; anything else is a custom domain
    MultiTenant { base_domain: String },
}

impl DeploymentPolicy {
    pub fn multi_tenant(base_domain: &str) -> Self {
        Self::MultiTenant {
            base_domain: normalize_server_name(base_domain),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum SelectError {
    /// A tenant hostname the static certificate does not cover
    #[error("invalid server name \"{0}\"")]
    InvalidServerName(String),

    #[error(transparent)]
    AutoCert(#[from] AutoCertError),
}

/// Entry point for certificate selection, shared by all handshakes
pub struct CertificateManager {
    store: StaticCertificateStore,
    policy: DeploymentPolicy,
    autocert: Arc<dyn AutoCert>,
}

impl CertificateManager {
    pub fn new(
        store: StaticCertificateStore,
        policy: DeploymentPolicy,
        autocert: Arc<dyn AutoCert>,
    ) -> Self {
        Self {
            store,
            policy,
            autocert,
        }
    }

    pub fn has_static_certificate(&self) -> bool {
        self.store.is_configured()
    }

    /// Pick the certificate for a handshake requesting `requested_name`
    pub async fn select_certificate(
        &self,
        requested_name: Option<&str>,
    ) -> Result<Arc<TlsCertificate>, SelectError> {
        let name = normalize_server_name(requested_name.unwrap_or_default());

        let Some(static_cert) = self.store.certificate() else {
            tracing::debug!(hostname = %name, path = "autocert", "No static certificate configured");
            return self.delegate(&name).await;
        };

        if is_bare_name(&name) {
            tracing::debug!(hostname = %name, path = "static", "No qualified server name");
            return Ok(static_cert.clone());
        }

        let base_domain = match &self.policy {
            DeploymentPolicy::SingleHost => {
                tracing::debug!(hostname = %name, path = "static", "Single host mode");
                return Ok(static_cert.clone());
            }
            DeploymentPolicy::MultiTenant { base_domain } => base_domain,
        };

        if is_within_domain(&name, base_domain) {
            if static_cert.leaf().verify_hostname(&name) {
                tracing::debug!(hostname = %name, path = "static", "Tenant hostname");
                return Ok(static_cert.clone());
            }
            tracing::warn!(
                hostname = %name,
                base_domain = %base_domain,
                "Static certificate does not cover tenant hostname"
            );
            return Err(SelectError::InvalidServerName(name));
        }

        tracing::debug!(hostname = %name, path = "autocert", "Custom domain");
        self.delegate(&name).await
    }

    async fn delegate(&self, name: &str) -> Result<Arc<TlsCertificate>, SelectError> {
        self.autocert.issue_or_fetch(name).await.map_err(|e| {
            tracing::warn!(hostname = %name, "Automated certificate unavailable: {}", e);
            SelectError::from(e)
        })
    }
}

impl std::fmt::Debug for CertificateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateManager")
            .field("policy", &self.policy)
            .field("static_certificate", &self.store.is_configured())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::certificate::test_support::self_signed;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Records the names it is asked for and hands out one fixed certificate
    struct StubAutoCert {
        cert: Arc<TlsCertificate>,
        requested: Mutex<Vec<String>>,
    }

    impl StubAutoCert {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                cert: Arc::new(self_signed(&["customdomain.com"])),
                requested: Mutex::new(Vec::new()),
            })
        }

        fn requested(&self) -> Vec<String> {
            self.requested.lock().clone()
        }
    }

    #[async_trait]
    impl AutoCert for StubAutoCert {
        async fn issue_or_fetch(
            &self,
            server_name: &str,
        ) -> Result<Arc<TlsCertificate>, AutoCertError> {
            self.requested.lock().push(server_name.to_string());
            if server_name.is_empty() {
                return Err(AutoCertError::MissingServerName);
            }
            Ok(self.cert.clone())
        }
    }

    fn fider_store() -> StaticCertificateStore {
        StaticCertificateStore::from_certificate(self_signed(&["*.fider.io"]))
    }

    fn multi_tenant(store: StaticCertificateStore) -> (CertificateManager, Arc<StubAutoCert>) {
        let stub = StubAutoCert::new();
        let manager = CertificateManager::new(
            store,
            DeploymentPolicy::multi_tenant("fider.io"),
            stub.clone(),
        );
        (manager, stub)
    }

    fn is_static(manager: &CertificateManager, cert: &Arc<TlsCertificate>) -> bool {
        Arc::ptr_eq(cert, manager.store.certificate().unwrap())
    }

    #[tokio::test]
    async fn test_tenant_hostname_gets_static_certificate() {
        let (manager, stub) = multi_tenant(fider_store());
        let cert = manager
            .select_certificate(Some("feedback.fider.io"))
            .await
            .unwrap();
        assert!(is_static(&manager, &cert));
        assert!(stub.requested().is_empty());
    }

    #[tokio::test]
    async fn test_tenant_hostname_not_covered_is_rejected() {
        let store =
            StaticCertificateStore::from_certificate(self_signed(&["www.fider.io", "fider.io"]));
        let (manager, stub) = multi_tenant(store);

        let err = manager
            .select_certificate(Some("feedback.fider.io"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "invalid server name \"feedback.fider.io\"");
        assert!(stub.requested().is_empty());
    }

    #[tokio::test]
    async fn test_base_domain_itself_is_verified() {
        let (manager, stub) = multi_tenant(fider_store());

        // *.fider.io does not cover the apex
        let err = manager.select_certificate(Some("fider.io")).await.unwrap_err();
        assert!(matches!(err, SelectError::InvalidServerName(name) if name == "fider.io"));
        assert!(stub.requested().is_empty());
    }

    #[tokio::test]
    async fn test_custom_domain_is_delegated() {
        let (manager, stub) = multi_tenant(fider_store());
        let cert = manager
            .select_certificate(Some("customdomain.com"))
            .await
            .unwrap();
        assert!(!is_static(&manager, &cert));
        assert_eq!(stub.requested(), vec!["customdomain.com".to_string()]);
    }

    #[tokio::test]
    async fn test_suffix_without_label_boundary_is_custom_domain() {
        let (manager, stub) = multi_tenant(fider_store());
        manager.select_certificate(Some("notfider.io")).await.unwrap();
        assert_eq!(stub.requested(), vec!["notfider.io".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_or_bare_name_gets_static_certificate() {
        let (manager, stub) = multi_tenant(fider_store());
        for name in [None, Some(""), Some("."), Some("localhost")] {
            let cert = manager.select_certificate(name).await.unwrap();
            assert!(is_static(&manager, &cert), "{:?}", name);
        }
        assert!(stub.requested().is_empty());
    }

    #[tokio::test]
    async fn test_names_are_normalized_before_selection() {
        let (manager, stub) = multi_tenant(fider_store());

        let cert = manager
            .select_certificate(Some("Feedback.FIDER.io."))
            .await
            .unwrap();
        assert!(is_static(&manager, &cert));

        manager
            .select_certificate(Some("Example.COM."))
            .await
            .unwrap();
        manager
            .select_certificate(Some("example.com"))
            .await
            .unwrap();
        assert_eq!(
            stub.requested(),
            vec!["example.com".to_string(), "example.com".to_string()]
        );
    }

    #[tokio::test]
    async fn test_single_host_always_uses_static_certificate() {
        let stub = StubAutoCert::new();
        let manager =
            CertificateManager::new(fider_store(), DeploymentPolicy::SingleHost, stub.clone());

        for name in ["feedback.fider.io", "customdomain.com", "anything.example.org"] {
            let cert = manager.select_certificate(Some(name)).await.unwrap();
            assert!(is_static(&manager, &cert));
        }
        assert!(stub.requested().is_empty());
    }

    #[tokio::test]
    async fn test_without_static_certificate_everything_is_delegated() {
        let stub = StubAutoCert::new();
        let manager = CertificateManager::new(
            StaticCertificateStore::empty(),
            DeploymentPolicy::multi_tenant("fider.io"),
            stub.clone(),
        );
        assert!(!manager.has_static_certificate());

        manager
            .select_certificate(Some("feedback.fider.io"))
            .await
            .unwrap();
        let err = manager.select_certificate(None).await.unwrap_err();
        assert!(matches!(
            err,
            SelectError::AutoCert(AutoCertError::MissingServerName)
        ));
        assert_eq!(
            stub.requested(),
            vec!["feedback.fider.io".to_string(), String::new()]
        );
    }

    #[test]
    fn test_multi_tenant_base_domain_is_normalized() {
        assert_eq!(
            DeploymentPolicy::multi_tenant(".Fider.IO."),
            DeploymentPolicy::MultiTenant {
                base_domain: "fider.io".to_string()
            }
        );
    }
}
