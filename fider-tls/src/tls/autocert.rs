//! On-demand certificates for hostnames outside the static certificate
//!
//! Lookup order per hostname: decoded certificates held in memory, then the
//! persistent [`CertificateCache`], then a fresh issuance. Issuance is
//! rate-limited and not idempotent on the CA side, so concurrent requests for
//! the same hostname share one in-flight issuance and its outcome.

use super::acme::AcmeError;
use super::cache::CertificateCache;
use super::certificate::TlsCertificate;
use super::name::{has_invalid_issuance_chars, normalize_server_name, parse_ip_host};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;

/// PEM material returned by an issuance round-trip
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub cert_chain_pem: String,
    pub private_key_pem: String,
}

/// Runs a complete issuance (order, challenge, finalize) for one hostname
#[async_trait]
pub trait CertificateIssuer: Send + Sync + 'static {
    async fn issue(&self, domain: &str) -> Result<IssuedCertificate, AcmeError>;
}

/// Certificate for a hostname not covered by the static certificate,
/// fetched from cache or issued on demand
#[async_trait]
pub trait AutoCert: Send + Sync {
    async fn issue_or_fetch(&self, server_name: &str)
    -> Result<Arc<TlsCertificate>, AutoCertError>;
}

/// Errors from the automated path. Cloneable so every coalesced caller gets
/// the same outcome.
#[derive(Debug, Clone, Error)]
pub enum AutoCertError {
    #[error("missing server name")]
    MissingServerName,

    #[error("server name {0:?} is not eligible for a certificate")]
    InvalidServerName(String),

    #[error("certificate issuance for {domain} failed: {reason}")]
    Issuance { domain: String, reason: String },
}

/// Background renewal for a host is not retried within this long after a
/// failed attempt. The periodic sweep in [`AutoCertFallback::renew_expiring`]
/// still retries.
pub const RENEWAL_RETRY_BACKOFF: Duration = Duration::from_secs(60 * 60);

type IssueOutcome = Option<Result<Arc<TlsCertificate>, AutoCertError>>;

struct Inner {
    cache: Arc<dyn CertificateCache>,
    issuer: Arc<dyn CertificateIssuer>,
    /// Decoded certificates by hostname
    issued: DashMap<String, Arc<TlsCertificate>>,
    /// Issuances in progress by hostname
    in_flight: Mutex<HashMap<String, watch::Receiver<IssueOutcome>>>,
    /// Time of the last failed issuance by hostname
    last_failure: DashMap<String, Instant>,
}

/// What a caller needs before a held certificate makes issuing unnecessary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Need {
    /// Any unexpired certificate
    Usable,
    /// A certificate outside the renewal window
    Renewed,
}

impl Need {
    fn satisfied_by(self, cert: &TlsCertificate) -> bool {
        match self {
            Need::Usable => !cert.leaf().is_expired(),
            Need::Renewed => !cert.leaf().needs_renewal(),
        }
    }
}

enum Flight {
    Ready(Arc<TlsCertificate>),
    Pending(watch::Receiver<IssueOutcome>),
}

/// Cache-backed, single-flight on-demand issuance
#[derive(Clone)]
pub struct AutoCertFallback {
    inner: Arc<Inner>,
}

impl AutoCertFallback {
    pub fn new(cache: Arc<dyn CertificateCache>, issuer: Arc<dyn CertificateIssuer>) -> Self {
        Self {
            inner: Arc::new(Inner {
                cache,
                issuer,
                issued: DashMap::new(),
                in_flight: Mutex::new(HashMap::new()),
                last_failure: DashMap::new(),
            }),
        }
    }

    async fn fetch_or_issue(&self, domain: &str) -> Result<Arc<TlsCertificate>, AutoCertError> {
        validate_server_name(domain)?;

        if let Some(cert) = self.inner.held(domain, Need::Usable) {
            self.renew_in_background_if_due(domain, &cert);
            return Ok(cert);
        }
        self.inner
            .issued
            .remove_if(domain, |_, cert| cert.leaf().is_expired());

        if let Some(cert) = self.inner.load_cached(domain).await {
            tracing::debug!(hostname = %domain, "Using cached certificate");
            self.inner
                .issued
                .insert(domain.to_string(), cert.clone());
            self.renew_in_background_if_due(domain, &cert);
            return Ok(cert);
        }

        let flight = self.join_or_start_issuance(domain, Need::Usable);
        Self::await_outcome(domain, flight).await
    }

    fn renew_in_background_if_due(&self, domain: &str, cert: &TlsCertificate) {
        if !cert.leaf().needs_renewal() {
            return;
        }
        if let Some(failed_at) = self.inner.last_failure.get(domain).map(|t| *t)
            && failed_at.elapsed() < RENEWAL_RETRY_BACKOFF
        {
            tracing::debug!(hostname = %domain, "Renewal failed recently, not retrying yet");
            return;
        }
        tracing::info!(
            hostname = %domain,
            expires_in_days = cert.leaf().days_until_expiry(),
            "Certificate due for renewal, renewing in background"
        );
        let _ = self.join_or_start_issuance(domain, Need::Renewed);
    }

    /// Subscribe to the in-flight issuance for `domain`, starting one if none
    /// is running. The issuance runs detached from the caller so it completes
    /// and fills the cache even when every waiting handshake has gone away.
    ///
    /// A certificate meeting `need` that landed in memory since the caller
    /// last looked is returned instead. Finished issuances store their
    /// certificate before leaving `in_flight`, so checking both under the
    /// lock never misses one.
    fn join_or_start_issuance(&self, domain: &str, need: Need) -> Flight {
        let mut in_flight = self.inner.in_flight.lock();
        if let Some(rx) = in_flight.get(domain) {
            // A closed channel without an outcome means the task died
            if rx.has_changed().is_ok() || rx.borrow().is_some() {
                tracing::debug!(hostname = %domain, "Joining in-flight issuance");
                return Flight::Pending(rx.clone());
            }
        }

        if let Some(cert) = self.inner.held(domain, need) {
            return Flight::Ready(cert);
        }

        let (tx, rx) = watch::channel(None);
        in_flight.insert(domain.to_string(), rx.clone());
        drop(in_flight);

        let inner = self.inner.clone();
        let domain = domain.to_string();
        tokio::spawn(async move {
            let outcome = inner.issue_and_store(&domain).await;
            match &outcome {
                Ok(_) => {
                    inner.last_failure.remove(&domain);
                }
                Err(_) => {
                    inner.last_failure.insert(domain.clone(), Instant::now());
                }
            }
            let _ = tx.send(Some(outcome));
            inner.in_flight.lock().remove(&domain);
        });

        Flight::Pending(rx)
    }

    async fn await_outcome(
        domain: &str,
        flight: Flight,
    ) -> Result<Arc<TlsCertificate>, AutoCertError> {
        let mut rx = match flight {
            Flight::Ready(cert) => return Ok(cert),
            Flight::Pending(rx) => rx,
        };
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| {
            Err(AutoCertError::Issuance {
                domain: domain.to_string(),
                reason: "issuance task ended without a result".to_string(),
            })
        })
    }

    /// Re-issue every held certificate inside the renewal window
    pub async fn renew_expiring(&self) -> Vec<(String, Result<Arc<TlsCertificate>, AutoCertError>)> {
        let due: Vec<String> = self
            .inner
            .issued
            .iter()
            .filter(|entry| entry.value().leaf().needs_renewal())
            .map(|entry| entry.key().clone())
            .collect();

        let mut results = Vec::with_capacity(due.len());
        for domain in due {
            tracing::info!(hostname = %domain, "Certificate needs renewal");
            let flight = self.join_or_start_issuance(&domain, Need::Renewed);
            let result = Self::await_outcome(&domain, flight).await;
            results.push((domain, result));
        }
        results
    }
}

impl Inner {
    fn held(&self, domain: &str, need: Need) -> Option<Arc<TlsCertificate>> {
        self.issued
            .get(domain)
            .map(|c| c.value().clone())
            .filter(|cert| need.satisfied_by(cert))
    }

    async fn load_cached(&self, domain: &str) -> Option<Arc<TlsCertificate>> {
        let data = match self.cache.get(domain).await {
            Ok(Some(data)) => data,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(hostname = %domain, "Certificate cache read failed: {}", e);
                return None;
            }
        };

        match TlsCertificate::from_cache_bytes(&data) {
            Ok(cert) if cert.leaf().is_expired() => {
                tracing::info!(hostname = %domain, "Cached certificate expired");
                None
            }
            Ok(cert) if !cert.leaf().verify_hostname(domain) => {
                tracing::warn!(hostname = %domain, "Cached certificate does not cover hostname");
                None
            }
            Ok(cert) => Some(Arc::new(cert)),
            Err(e) => {
                tracing::warn!(hostname = %domain, "Discarding undecodable cache entry: {}", e);
                None
            }
        }
    }

    async fn issue_and_store(&self, domain: &str) -> Result<Arc<TlsCertificate>, AutoCertError> {
        let started = Instant::now();
        let issuance_error = |reason: String| AutoCertError::Issuance {
            domain: domain.to_string(),
            reason,
        };

        let issued = match self.issuer.issue(domain).await {
            Ok(issued) => issued,
            Err(e) => {
                tracing::error!(hostname = %domain, "Certificate issuance failed: {}", e);
                return Err(issuance_error(e.to_string()));
            }
        };

        let cert = TlsCertificate::from_pem(
            issued.cert_chain_pem.as_bytes(),
            issued.private_key_pem.as_bytes(),
        )
        .map_err(|e| issuance_error(format!("issued certificate is unusable: {}", e)))?;

        if !cert.leaf().verify_hostname(domain) {
            return Err(issuance_error(
                "issued certificate does not cover the hostname".to_string(),
            ));
        }

        match cert.to_cache_bytes() {
            Ok(bytes) => {
                if let Err(e) = self.cache.put(domain, &bytes).await {
                    tracing::warn!(hostname = %domain, "Failed to cache certificate: {}", e);
                }
            }
            Err(e) => {
                tracing::warn!(hostname = %domain, "Failed to encode certificate: {}", e);
            }
        }

        let cert = Arc::new(cert);
        self.issued.insert(domain.to_string(), cert.clone());

        tracing::info!(
            hostname = %domain,
            elapsed_ms = started.elapsed().as_millis() as u64,
            expires_in_days = cert.leaf().days_until_expiry(),
            "Certificate issued and cached"
        );

        Ok(cert)
    }
}

#[async_trait]
impl AutoCert for AutoCertFallback {
    async fn issue_or_fetch(
        &self,
        server_name: &str,
    ) -> Result<Arc<TlsCertificate>, AutoCertError> {
        let domain = normalize_server_name(server_name);
        self.fetch_or_issue(&domain).await
    }
}

fn validate_server_name(name: &str) -> Result<(), AutoCertError> {
    if name.is_empty() {
        return Err(AutoCertError::MissingServerName);
    }
    if !name.contains('.') || has_invalid_issuance_chars(name) || parse_ip_host(name).is_some() {
        return Err(AutoCertError::InvalidServerName(name.to_string()));
    }
    Ok(())
}
