//! HTTP-01 challenge tokens and the plain HTTP listener that serves them
//!
//! The ACME server validates domain ownership by fetching
//! `http://<domain>/.well-known/acme-challenge/<token>` on port 80. The
//! issuance path publishes tokens in a [`ChallengeStore`] and the
//! [`ChallengeServer`] answers from it.

use bytes::Bytes;
use dashmap::DashMap;
use http_body_util::Full;
use hyper::header::{CONTENT_TYPE, HOST, LOCATION};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;

/// HTTP-01 challenge path prefix
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Pending HTTP-01 challenges, token -> key authorization.
///
/// Cloning shares the underlying map.
#[derive(Debug, Clone, Default)]
pub struct ChallengeStore {
    tokens: Arc<DashMap<String, String>>,
}

impl ChallengeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a token so the listener can answer for it
    pub fn insert(&self, token: &str, key_authorization: &str) {
        tracing::debug!(token = %token, "Registering ACME HTTP-01 challenge");
        self.tokens
            .insert(token.to_string(), key_authorization.to_string());
    }

    pub fn remove(&self, token: &str) {
        if self.tokens.remove(token).is_some() {
            tracing::debug!(token = %token, "Removed ACME challenge");
        }
    }

    /// Key authorization for a token, if it is pending
    pub fn key_authorization(&self, token: &str) -> Option<String> {
        self.tokens.get(token).map(|v| v.clone())
    }

    /// Extract the token from a challenge request path
    pub fn extract_token(path: &str) -> Option<&str> {
        path.strip_prefix(ACME_CHALLENGE_PREFIX)
            .filter(|token| !token.is_empty() && !token.contains('/'))
    }

    pub fn pending_count(&self) -> usize {
        self.tokens.len()
    }
}

/// Fatal challenge listener errors
#[derive(Debug, Error)]
pub enum ChallengeServerError {
    #[error("Failed to bind ACME challenge listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Pause after an accept error that is not tied to a single connection,
/// such as running out of file descriptors
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Behaviour for requests that are not challenge requests
#[derive(Debug, Clone, Copy, Default)]
pub struct ChallengeServerOptions {
    /// Redirect GET/HEAD to HTTPS instead of answering 404
    pub redirect_to_https: bool,
}

/// Plain HTTP listener answering ACME HTTP-01 challenges
pub struct ChallengeServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    challenges: ChallengeStore,
    options: ChallengeServerOptions,
}

impl ChallengeServer {
    /// Bind the listener. Failure here means no hostname outside the static
    /// certificate can ever be issued, so callers should treat it as fatal.
    pub async fn bind(
        addr: SocketAddr,
        challenges: ChallengeStore,
        options: ChallengeServerOptions,
    ) -> Result<Self, ChallengeServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ChallengeServerError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ChallengeServerError::Bind { addr, source })?;

        tracing::info!(addr = %local_addr, "ACME challenge listener bound");

        Ok(Self {
            listener,
            local_addr,
            challenges,
            options,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve connections forever. Accept errors are logged and never end
    /// the loop.
    pub async fn run(self) {
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(v) => v,
                Err(e) => {
                    tracing::error!("Challenge listener accept error: {}", e);
                    let backoff = accept_error_backoff(&e);
                    if !backoff.is_zero() {
                        tokio::time::sleep(backoff).await;
                    }
                    continue;
                }
            };

            let challenges = self.challenges.clone();
            let options = self.options;

            tokio::spawn(async move {
                let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                    let response = respond(&challenges, options, &req);
                    async move { Ok::<_, Infallible>(response) }
                });

                if let Err(e) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    tracing::debug!(peer = %peer, "Challenge connection error: {}", e);
                }
            });
        }
    }
}

/// Errors about one aborted connection retry at once; anything else (fd
/// exhaustion included) waits before the next accept.
fn accept_error_backoff(e: &std::io::Error) -> Duration {
    match e.kind() {
        std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::Interrupted
        | std::io::ErrorKind::WouldBlock => Duration::ZERO,
        _ => ACCEPT_ERROR_BACKOFF,
    }
}

/// Build the response for a single request on the challenge listener
pub fn respond<B>(
    challenges: &ChallengeStore,
    options: ChallengeServerOptions,
    req: &Request<B>,
) -> Response<Full<Bytes>> {
    let path = req.uri().path();

    if let Some(token) = ChallengeStore::extract_token(path) {
        return match challenges.key_authorization(token) {
            Some(key_auth) => {
                tracing::info!(token = %token, "Served ACME HTTP-01 challenge");
                text_response(StatusCode::OK, key_auth)
            }
            None => {
                tracing::debug!(token = %token, "Unknown ACME challenge token");
                text_response(StatusCode::NOT_FOUND, "Not Found")
            }
        };
    }

    if !options.redirect_to_https {
        return text_response(StatusCode::NOT_FOUND, "Not Found");
    }

    if req.method() != Method::GET && req.method() != Method::HEAD {
        return text_response(StatusCode::BAD_REQUEST, "Use HTTPS");
    }

    let host = req
        .headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().host())
        .map(strip_port)
        .unwrap_or("");
    if host.is_empty() {
        return text_response(StatusCode::BAD_REQUEST, "Missing Host header");
    }

    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let location = format!("https://{}{}", host, path_and_query);

    Response::builder()
        .status(StatusCode::FOUND)
        .header(LOCATION, location)
        .header(CONTENT_TYPE, "text/plain")
        .body(Full::new(Bytes::from_static(b"Redirecting to HTTPS")))
        .unwrap_or_else(|_| text_response(StatusCode::BAD_REQUEST, "Invalid Host header"))
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain"),
    );
    response
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        // [v6]:port
        return host.split_once(']').map(|(h, _)| &host[..=h.len()]).unwrap_or(host);
    }
    match host.rsplit_once(':') {
        Some((h, port)) if port.chars().all(|c| c.is_ascii_digit()) => h,
        _ => host,
    }
}
