//! HTTPS termination using Pingora
//!
//! Terminates TLS with the certificate chosen per handshake by the
//! [`CertificateManager`] and forwards decrypted requests to the application
//! server.

use crate::tls::{CertificateManager, create_sni_callbacks};
use async_trait::async_trait;
use pingora_core::listeners::tls::TlsSettings;
use pingora_core::prelude::*;
use pingora_core::upstreams::peer::HttpPeer;
use pingora_http::RequestHeader;
use pingora_proxy::{ProxyHttp, Session};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

/// Proxy configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// HTTPS listen address
    pub https_addr: SocketAddr,
    /// Application server
    pub upstream: SocketAddr,
}

/// Forwards every request to the single application upstream
pub struct FiderProxy {
    upstream: SocketAddr,
}

impl FiderProxy {
    pub fn new(upstream: SocketAddr) -> Self {
        Self { upstream }
    }
}

/// Per-request context
#[derive(Debug)]
pub struct RequestCtx {
    started: Instant,
}

#[async_trait]
impl ProxyHttp for FiderProxy {
    type CTX = RequestCtx;

    fn new_ctx(&self) -> Self::CTX {
        RequestCtx {
            started: Instant::now(),
        }
    }

    async fn upstream_peer(
        &self,
        _session: &mut Session,
        _ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>> {
        let peer = HttpPeer::new(self.upstream, false, String::new());
        Ok(Box::new(peer))
    }

    async fn upstream_request_filter(
        &self,
        session: &mut Session,
        upstream_request: &mut RequestHeader,
        _ctx: &mut Self::CTX,
    ) -> Result<()> {
        upstream_request.insert_header("X-Forwarded-Proto", "https")?;
        if let Some(client) = session.client_addr().and_then(|a| a.as_inet()) {
            upstream_request.insert_header("X-Forwarded-For", client.ip().to_string())?;
        }
        Ok(())
    }

    async fn logging(&self, session: &mut Session, _e: Option<&Error>, ctx: &mut Self::CTX) {
        let status = session
            .response_written()
            .map(|r| r.status.as_u16())
            .unwrap_or(0);

        let host = session
            .req_header()
            .headers
            .get("host")
            .and_then(|h| h.to_str().ok())
            .unwrap_or("-");

        let path = session.req_header().uri.path();
        let method = session.req_header().method.as_str();

        tracing::info!(
            host = host,
            method = method,
            path = path,
            status = status,
            elapsed_ms = ctx.started.elapsed().as_millis() as u64,
            "Request completed"
        );
    }
}

/// Build the Pingora server with an SNI-driven HTTPS listener
pub fn build_server(config: &ProxyConfig, manager: Arc<CertificateManager>) -> Result<Server> {
    let mut server = Server::new(None)?;
    server.bootstrap();

    let proxy = FiderProxy::new(config.upstream);
    let mut proxy_service = pingora_proxy::http_proxy_service(&server.configuration, proxy);

    let tls_settings = create_tls_settings(manager)?;
    proxy_service.add_tls_with_settings(&config.https_addr.to_string(), None, tls_settings);
    tracing::info!(addr = %config.https_addr, upstream = %config.upstream, "HTTPS listener enabled");

    server.add_service(proxy_service);
    Ok(server)
}

fn create_tls_settings(manager: Arc<CertificateManager>) -> Result<TlsSettings> {
    let callbacks = create_sni_callbacks(manager);

    let mut tls_settings = TlsSettings::with_callbacks(callbacks).map_err(|e| {
        Error::explain(
            ErrorType::InternalError,
            format!("Failed to create TLS settings with SNI callbacks: {}", e),
        )
    })?;

    tls_settings.enable_h2();

    Ok(tls_settings)
}
