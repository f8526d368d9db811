use clap::Parser;
use fider_tls::config::{Args, ServerConfig};
use fider_tls::proxy::{self, ProxyConfig};
use fider_tls::tls::{
    AcmeClient, AutoCertFallback, CertificateCache, CertificateManager, ChallengeServer,
    ChallengeStore, MemoryCache, SqliteCache, StaticCertificateStore,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Background task for automatic certificate renewal
async fn certificate_renewal_task(autocert: AutoCertFallback, interval: Duration) {
    tracing::info!(
        interval_hours = interval.as_secs() / 3600,
        "Starting certificate renewal task"
    );

    loop {
        tokio::time::sleep(interval).await;

        tracing::info!("Checking for certificates needing renewal...");

        for (hostname, result) in autocert.renew_expiring().await {
            match result {
                Ok(cert) => {
                    tracing::info!(
                        hostname = %hostname,
                        expires_in_days = cert.leaf().days_until_expiry(),
                        "Certificate renewed successfully"
                    );
                }
                Err(e) => {
                    tracing::error!(hostname = %hostname, "Certificate renewal failed: {}", e);
                }
            }
        }
    }
}

fn install_rustls_crypto_provider() {
    if rustls::crypto::CryptoProvider::get_default().is_some() {
        return;
    }

    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    install_rustls_crypto_provider();

    let args = Args::parse();
    init_tracing(args.log_json);

    let config = ServerConfig::from_args(&args)?;

    tracing::info!("Fider TLS v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(policy = ?config.policy, "Deployment policy");

    // Tokio runtime for the challenge listener, ACME and renewal.
    // Pingora manages its own runtime(s) internally.
    let rt = tokio::runtime::Runtime::new()?;

    let cache: Arc<dyn CertificateCache> = match &config.cache_db {
        Some(path) => {
            tracing::info!(path = %path.display(), "Using SQLite certificate cache");
            Arc::new(SqliteCache::open(path)?)
        }
        None => {
            tracing::warn!("No --cache-db set, issued certificates are lost on restart");
            Arc::new(MemoryCache::new())
        }
    };

    let store = match &config.static_cert {
        Some((cert, key)) => StaticCertificateStore::load(cert, key)?,
        None => {
            tracing::info!("No static certificate configured, every hostname uses ACME");
            StaticCertificateStore::empty()
        }
    };

    let challenges = ChallengeStore::new();
    let acme = Arc::new(AcmeClient::new(
        config.acme.clone(),
        cache.clone(),
        challenges.clone(),
    ));
    if acme.is_staging() {
        tracing::warn!("Using Let's Encrypt staging, issued certificates are not trusted");
    }

    let autocert = AutoCertFallback::new(cache, acme.clone());
    let manager = Arc::new(CertificateManager::new(
        store,
        config.policy.clone(),
        Arc::new(autocert.clone()),
    ));

    // Without the challenge listener no custom domain can ever be validated
    let challenge_server = rt.block_on(ChallengeServer::bind(
        config.http_addr,
        challenges,
        config.challenge,
    ))?;
    rt.spawn(challenge_server.run());

    rt.spawn(async move {
        if let Err(e) = acme.init().await {
            tracing::warn!("ACME account not ready, will retry on first issuance: {}", e);
        }
    });

    rt.spawn(certificate_renewal_task(autocert, config.renewal_interval));

    let server = proxy::build_server(
        &ProxyConfig {
            https_addr: config.https_addr,
            upstream: config.upstream,
        },
        manager,
    )?;

    // Run the server (this blocks)
    server.run_forever();
}
