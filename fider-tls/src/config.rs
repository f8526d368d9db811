//! Command line and environment configuration

use crate::tls::{AcmeConfig, ChallengeServerOptions, DeploymentPolicy};
use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Fider TLS front - HTTPS termination with on-demand certificates
#[derive(Parser, Debug, Clone)]
#[command(name = "fider-tls")]
#[command(version)]
#[command(about = "Fider TLS front - HTTPS termination with on-demand certificates")]
pub struct Args {
    /// PEM file with the static certificate chain
    #[arg(long, env = "SSL_CERT")]
    pub ssl_cert: Option<PathBuf>,

    /// PEM file with the static certificate private key
    #[arg(long, env = "SSL_CERT_KEY")]
    pub ssl_cert_key: Option<PathBuf>,

    /// Deployment mode
    #[arg(long, env = "HOST_MODE", value_enum, default_value_t = HostMode::Single)]
    pub host_mode: HostMode,

    /// Base domain tenants live under (multi mode only)
    #[arg(long, env = "HOST_DOMAIN")]
    pub host_domain: Option<String>,

    /// Use Let's Encrypt staging environment
    #[arg(long, env = "ACME_STAGING")]
    pub acme_staging: bool,

    /// ACME contact email for Let's Encrypt
    #[arg(long, env = "ACME_EMAIL")]
    pub acme_email: Option<String>,

    /// SQLite database for issued certificates (in-memory if unset)
    #[arg(long, env = "FIDER_TLS_CACHE_DB")]
    pub cache_db: Option<PathBuf>,

    /// Listen address for ACME HTTP-01 challenges
    #[arg(long, env = "HTTP_ADDR", default_value = "0.0.0.0:80")]
    pub http_addr: SocketAddr,

    /// Listen address for HTTPS
    #[arg(long, env = "HTTPS_ADDR", default_value = "0.0.0.0:443")]
    pub https_addr: SocketAddr,

    /// Application server receiving decrypted traffic
    #[arg(long, env = "UPSTREAM_ADDR", default_value = "127.0.0.1:3000")]
    pub upstream: SocketAddr,

    /// Redirect plain HTTP requests to HTTPS
    #[arg(long, env = "REDIRECT_HTTP")]
    pub redirect_http: bool,

    /// Certificate renewal check interval in hours (default: 12)
    #[arg(long, env = "RENEWAL_INTERVAL_HOURS", default_value_t = 12)]
    pub renewal_interval_hours: u64,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON")]
    pub log_json: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum HostMode {
    Single,
    Multi,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("--host-domain is required when --host-mode is multi")]
    MissingHostDomain,

    #[error("both --ssl-cert and --ssl-cert-key must be set, or neither")]
    IncompleteCertificatePair,

    #[error("--renewal-interval-hours must be at least 1")]
    InvalidRenewalInterval,
}

/// Validated server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub policy: DeploymentPolicy,
    /// Static certificate and key paths, when configured
    pub static_cert: Option<(PathBuf, PathBuf)>,
    pub acme: AcmeConfig,
    pub cache_db: Option<PathBuf>,
    pub http_addr: SocketAddr,
    pub https_addr: SocketAddr,
    pub upstream: SocketAddr,
    pub challenge: ChallengeServerOptions,
    pub renewal_interval: Duration,
}

impl ServerConfig {
    pub fn from_args(args: &Args) -> Result<Self, ConfigError> {
        let policy = match args.host_mode {
            HostMode::Single => DeploymentPolicy::SingleHost,
            HostMode::Multi => {
                let domain = args
                    .host_domain
                    .as_deref()
                    .map(str::trim)
                    .filter(|d| !d.trim_matches('.').is_empty())
                    .ok_or(ConfigError::MissingHostDomain)?;
                DeploymentPolicy::multi_tenant(domain)
            }
        };

        let static_cert = match (&args.ssl_cert, &args.ssl_cert_key) {
            (Some(cert), Some(key)) => Some((cert.clone(), key.clone())),
            (None, None) => None,
            _ => return Err(ConfigError::IncompleteCertificatePair),
        };

        if args.renewal_interval_hours == 0 {
            return Err(ConfigError::InvalidRenewalInterval);
        }

        Ok(Self {
            policy,
            static_cert,
            acme: AcmeConfig {
                staging: args.acme_staging,
                email: args.acme_email.clone().filter(|e| !e.is_empty()),
                ..Default::default()
            },
            cache_db: args.cache_db.clone(),
            http_addr: args.http_addr,
            https_addr: args.https_addr,
            upstream: args.upstream,
            challenge: ChallengeServerOptions {
                redirect_to_https: args.redirect_http,
            },
            renewal_interval: Duration::from_secs(args.renewal_interval_hours * 3600),
        })
    }
}
