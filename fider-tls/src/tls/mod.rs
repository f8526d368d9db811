//! TLS/Certificate management
//!
//! Handles:
//! - Static certificate loading and SNI-based certificate selection
//! - On-demand ACME (Let's Encrypt) issuance for custom domains
//! - HTTP-01 challenge serving
//! - Persistent certificate caching with automatic renewal

pub mod acme;
pub mod autocert;
pub mod cache;
pub mod certificate;
pub mod challenge;
pub mod manager;
pub mod name;
pub mod sni;
pub mod store;

pub use acme::{AcmeClient, AcmeConfig, AcmeError};
pub use autocert::{AutoCert, AutoCertError, AutoCertFallback, CertificateIssuer, IssuedCertificate};
pub use cache::{CacheError, CertificateCache, MemoryCache, SqliteCache};
pub use certificate::{CertError, LeafMetadata, TlsCertificate};
pub use challenge::{ChallengeServer, ChallengeServerError, ChallengeServerOptions, ChallengeStore};
pub use manager::{CertificateManager, DeploymentPolicy, SelectError};
pub use sni::{SniCertResolver, create_sni_callbacks};
pub use store::StaticCertificateStore;
