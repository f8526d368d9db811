//! Certificate material and parsed leaf identity

use super::name::{dns_name_matches, parse_ip_host};
use openssl::pkey::{PKey, Private};
use openssl::x509::X509;
use std::fmt;
use std::net::IpAddr;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use x509_parser::prelude::*;

/// Certificates inside this window before expiry are due for renewal.
pub const RENEWAL_WINDOW: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Errors raised while loading or parsing certificate material
#[derive(Debug, Error)]
pub enum CertError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("No certificate found in PEM data")]
    NoCertificate,

    #[error("Failed to load private key: {0}")]
    InvalidKey(String),

    #[error("Failed to load certificate: {0}")]
    LoadError(String),

    #[error("Failed to parse certificate: {0}")]
    ParseError(String),

    #[error("Private key does not match the leaf certificate")]
    KeyMismatch,
}

/// Identity of the end-entity certificate, parsed once at load time
#[derive(Debug, Clone)]
pub struct LeafMetadata {
    /// Subject distinguished name, RFC 4514 style
    pub subject: String,
    /// DNS subject-alternative names, lowercased
    pub dns_names: Vec<String>,
    /// IP address subject-alternative names
    pub ip_addresses: Vec<IpAddr>,
    pub not_before: SystemTime,
    pub not_after: SystemTime,
}

impl LeafMetadata {
    /// Parse leaf metadata from a DER encoded certificate
    pub fn from_der(der: &[u8]) -> Result<Self, CertError> {
        let (_, cert) =
            X509Certificate::from_der(der).map_err(|e| CertError::ParseError(e.to_string()))?;

        let mut dns_names = Vec::new();
        let mut ip_addresses = Vec::new();

        let san = cert
            .subject_alternative_name()
            .map_err(|e| CertError::ParseError(e.to_string()))?;
        if let Some(san) = san {
            for name in &san.value.general_names {
                match name {
                    GeneralName::DNSName(dns) => dns_names.push(dns.to_ascii_lowercase()),
                    GeneralName::IPAddress(bytes) => {
                        if let Some(ip) = ip_from_san_bytes(bytes) {
                            ip_addresses.push(ip);
                        }
                    }
                    _ => {}
                }
            }
        }

        let validity = cert.validity();
        Ok(Self {
            subject: cert.subject().to_string(),
            dns_names,
            ip_addresses,
            not_before: system_time_from_unix(validity.not_before.timestamp()),
            not_after: system_time_from_unix(validity.not_after.timestamp()),
        })
    }

    /// Check whether this certificate is valid for `host`.
    ///
    /// IP literals match IP SANs only; DNS names match DNS SANs exactly or by
    /// a left-most wildcard label. The subject common name is never used.
    pub fn verify_hostname(&self, host: &str) -> bool {
        if let Some(ip) = parse_ip_host(host) {
            return self.ip_addresses.contains(&ip);
        }
        self.dns_names
            .iter()
            .any(|pattern| dns_name_matches(pattern, host))
    }

    /// Check if certificate is expired
    pub fn is_expired(&self) -> bool {
        SystemTime::now() > self.not_after
    }

    /// Check if certificate needs renewal (expires within 30 days)
    pub fn needs_renewal(&self) -> bool {
        SystemTime::now() + RENEWAL_WINDOW > self.not_after
    }

    /// Days until expiry, negative once expired
    pub fn days_until_expiry(&self) -> i64 {
        match self.not_after.duration_since(SystemTime::now()) {
            Ok(duration) => (duration.as_secs() / 86400) as i64,
            Err(e) => -(e.duration().as_secs() as i64 / 86400),
        }
    }
}

/// A certificate chain (leaf first) with its private key
pub struct TlsCertificate {
    chain: Vec<X509>,
    key: PKey<Private>,
    leaf: LeafMetadata,
}

impl TlsCertificate {
    /// Build from PEM encoded chain and key.
    ///
    /// Both buffers may be the same combined blob; non-matching PEM blocks are
    /// skipped by the respective parser.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, CertError> {
        let chain =
            X509::stack_from_pem(cert_pem).map_err(|e| CertError::LoadError(e.to_string()))?;
        let key = PKey::private_key_from_pem(key_pem)
            .map_err(|e| CertError::InvalidKey(e.to_string()))?;
        Self::from_parts(chain, key)
    }

    /// Load from a certificate chain file and a key file
    pub fn from_files(cert_path: &Path, key_path: &Path) -> Result<Self, CertError> {
        let cert_pem = read_file(cert_path)?;
        let key_pem = read_file(key_path)?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    fn from_parts(chain: Vec<X509>, key: PKey<Private>) -> Result<Self, CertError> {
        let leaf_cert = chain.first().ok_or(CertError::NoCertificate)?;

        let leaf_public = leaf_cert
            .public_key()
            .map_err(|e| CertError::ParseError(e.to_string()))?;
        if !key.public_eq(&leaf_public) {
            return Err(CertError::KeyMismatch);
        }

        let der = leaf_cert
            .to_der()
            .map_err(|e| CertError::ParseError(e.to_string()))?;
        let leaf = LeafMetadata::from_der(&der)?;

        Ok(Self { chain, key, leaf })
    }

    /// Decode a cache entry written by [`TlsCertificate::to_cache_bytes`]
    pub fn from_cache_bytes(data: &[u8]) -> Result<Self, CertError> {
        Self::from_pem(data, data)
    }

    /// Serialize as private key PEM followed by the certificate chain PEM
    pub fn to_cache_bytes(&self) -> Result<Vec<u8>, CertError> {
        let mut out = self
            .key
            .private_key_to_pem_pkcs8()
            .map_err(|e| CertError::InvalidKey(e.to_string()))?;
        for cert in &self.chain {
            let pem = cert
                .to_pem()
                .map_err(|e| CertError::LoadError(e.to_string()))?;
            out.extend_from_slice(&pem);
        }
        Ok(out)
    }

    pub fn leaf(&self) -> &LeafMetadata {
        &self.leaf
    }

    /// End-entity certificate
    pub fn leaf_certificate(&self) -> &X509 {
        &self.chain[0]
    }

    /// Intermediates following the leaf
    pub fn intermediates(&self) -> &[X509] {
        &self.chain[1..]
    }

    pub fn private_key(&self) -> &PKey<Private> {
        &self.key
    }
}

impl fmt::Debug for TlsCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsCertificate")
            .field("subject", &self.leaf.subject)
            .field("dns_names", &self.leaf.dns_names)
            .field("chain_len", &self.chain.len())
            .finish()
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>, CertError> {
    std::fs::read(path).map_err(|source| CertError::Read {
        path: path.display().to_string(),
        source,
    })
}

fn ip_from_san_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => <[u8; 4]>::try_from(bytes).ok().map(IpAddr::from),
        16 => <[u8; 16]>::try_from(bytes).ok().map(IpAddr::from),
        _ => None,
    }
}

fn system_time_from_unix(timestamp: i64) -> SystemTime {
    if timestamp >= 0 {
        UNIX_EPOCH + Duration::from_secs(timestamp as u64)
    } else {
        UNIX_EPOCH - Duration::from_secs(timestamp.unsigned_abs())
    }
}
