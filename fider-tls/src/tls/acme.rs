//! ACME client for Let's Encrypt certificate issuance
//!
//! Uses instant-acme for the ACME protocol implementation.
//! Supports HTTP-01 challenges for domain validation; tokens are published in
//! the shared [`ChallengeStore`] served by the challenge listener.

use super::autocert::{CertificateIssuer, IssuedCertificate};
use super::cache::CertificateCache;
use super::challenge::ChallengeStore;
use async_trait::async_trait;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, OrderStatus, RetryPolicy,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::OnceCell;

/// Cache key holding the serialized ACME account credentials.
///
/// The `+` cannot appear in a hostname, so it never collides with a
/// certificate entry.
pub const ACCOUNT_CACHE_KEY: &str = "acme_account+key";

pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Errors that can occur during ACME operations
#[derive(Debug, Error)]
pub enum AcmeError {
    #[error("ACME account not registered: {0}")]
    NotRegistered(String),

    #[error("Challenge failed: {0}")]
    ChallengeFailed(String),

    #[error("Certificate issuance failed: {0}")]
    IssuanceFailed(String),

    #[error("Invalid domain: {0}")]
    InvalidDomain(String),

    #[error("Order not ready: {0}")]
    OrderNotReady(String),

    #[error("ACME error: {0}")]
    Acme(#[from] instant_acme::Error),

    #[error("HTTP-01 challenge not available")]
    NoHttp01Challenge,
}

/// ACME configuration
#[derive(Debug, Clone)]
pub struct AcmeConfig {
    /// Use Let's Encrypt staging (for testing)
    pub staging: bool,
    /// Contact email for ACME account
    pub email: Option<String>,
    /// Upper bound for polling order and certificate status
    pub timeout: Duration,
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            staging: false,
            email: None,
            timeout: Duration::from_secs(300),
        }
    }
}

impl AcmeConfig {
    /// Get the ACME directory URL
    pub fn directory_url(&self) -> &'static str {
        if self.staging {
            LETS_ENCRYPT_STAGING
        } else {
            LETS_ENCRYPT_PRODUCTION
        }
    }
}

/// ACME client for certificate operations
pub struct AcmeClient {
    config: AcmeConfig,
    /// Account credentials are persisted next to issued certificates
    cache: Arc<dyn CertificateCache>,
    challenges: ChallengeStore,
    account: OnceCell<Account>,
}

impl AcmeClient {
    pub fn new(
        config: AcmeConfig,
        cache: Arc<dyn CertificateCache>,
        challenges: ChallengeStore,
    ) -> Self {
        Self {
            config,
            cache,
            challenges,
            account: OnceCell::new(),
        }
    }

    /// Check if using staging environment
    pub fn is_staging(&self) -> bool {
        self.config.staging
    }

    /// Load or register the ACME account. Runs at most once; concurrent
    /// callers wait for the first registration.
    pub async fn init(&self) -> Result<(), AcmeError> {
        self.account().await.map(|_| ())
    }

    async fn account(&self) -> Result<&Account, AcmeError> {
        self.account
            .get_or_try_init(|| self.load_or_create_account())
            .await
    }

    async fn load_or_create_account(&self) -> Result<Account, AcmeError> {
        match self.cache.get(ACCOUNT_CACHE_KEY).await {
            Ok(Some(stored)) => match self.load_account(&stored).await {
                Ok(account) => {
                    tracing::info!(id = %account.id(), "Loaded existing ACME account");
                    return Ok(account);
                }
                Err(e) => {
                    tracing::warn!("Failed to load ACME account, will create new: {}", e);
                }
            },
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("Failed to read ACME account from cache: {}", e);
            }
        }

        let (account, credentials) = self.create_account().await?;

        let credentials_json = serde_json::to_vec(&credentials).map_err(|e| {
            AcmeError::NotRegistered(format!("Failed to serialize credentials: {}", e))
        })?;
        if let Err(e) = self.cache.put(ACCOUNT_CACHE_KEY, &credentials_json).await {
            tracing::warn!("Failed to persist ACME account credentials: {}", e);
        }

        tracing::info!(
            staging = self.config.staging,
            id = %account.id(),
            "Created new ACME account"
        );

        Ok(account)
    }

    /// Load account from saved credentials
    async fn load_account(&self, stored: &[u8]) -> Result<Account, AcmeError> {
        let credentials: AccountCredentials = serde_json::from_slice(stored)
            .map_err(|e| AcmeError::NotRegistered(format!("Invalid credentials: {}", e)))?;

        let account = Account::builder()
            .map_err(AcmeError::Acme)?
            .from_credentials(credentials)
            .await?;

        Ok(account)
    }

    /// Create a new ACME account, accepting the CA terms of service
    async fn create_account(&self) -> Result<(Account, AccountCredentials), AcmeError> {
        let contact = self.config.email.as_ref().map(|e| format!("mailto:{}", e));

        let contact_refs: Vec<&str> = contact
            .as_ref()
            .map(|c| vec![c.as_str()])
            .unwrap_or_default();

        let new_account = NewAccount {
            contact: &contact_refs,
            terms_of_service_agreed: true,
            only_return_existing: false,
        };

        let (account, credentials) = Account::builder()
            .map_err(AcmeError::Acme)?
            .create(&new_account, self.config.directory_url().to_string(), None)
            .await?;

        Ok((account, credentials))
    }

    /// Request a certificate for a domain using HTTP-01 challenge
    pub async fn request_certificate(&self, domain: &str) -> Result<IssuedCertificate, AcmeError> {
        validate_domain(domain)?;

        let account = self.account().await?;

        tracing::info!(domain = domain, "Requesting certificate via ACME");

        let identifiers = [Identifier::Dns(domain.to_string())];
        let new_order = NewOrder::new(&identifiers);

        let mut order = account.new_order(&new_order).await?;

        // Removed from the store when dropped, whichever way the order ends
        let mut published = PublishedTokens::new(&self.challenges);

        let mut authorizations = order.authorizations();
        while let Some(auth_result) = authorizations.next().await {
            let mut auth = auth_result?;

            match auth.status {
                AuthorizationStatus::Pending => {
                    let mut challenge = auth
                        .challenge(ChallengeType::Http01)
                        .ok_or(AcmeError::NoHttp01Challenge)?;

                    let key_auth = challenge.key_authorization();
                    let token = challenge.token.clone();

                    published.publish(&token, key_auth.as_str());

                    tracing::info!(
                        domain = domain,
                        token = %token,
                        "HTTP-01 challenge ready at /.well-known/acme-challenge/{}",
                        token
                    );

                    challenge.set_ready().await?;
                }
                AuthorizationStatus::Valid => {
                    tracing::debug!(domain = domain, "Authorization already valid");
                }
                status => {
                    return Err(AcmeError::ChallengeFailed(format!(
                        "Unexpected authorization status: {:?}",
                        status
                    )));
                }
            }
        }

        let retry_policy = RetryPolicy::new().timeout(self.config.timeout);

        let order_status = order.poll_ready(&retry_policy).await?;

        match order_status {
            OrderStatus::Ready => {
                tracing::info!(domain = domain, "Order ready, finalizing");
            }
            OrderStatus::Invalid => {
                return Err(AcmeError::ChallengeFailed(
                    "Order became invalid".to_string(),
                ));
            }
            status => {
                return Err(AcmeError::OrderNotReady(format!("{:?}", status)));
            }
        }

        drop(published);

        // Finalize generates the key and CSR; returns the key as PEM
        let private_key_pem = order.finalize().await?;

        let cert_chain_pem = order.poll_certificate(&retry_policy).await?;

        tracing::info!(domain = domain, "Certificate issued successfully");

        Ok(IssuedCertificate {
            cert_chain_pem,
            private_key_pem,
        })
    }
}

#[async_trait]
impl CertificateIssuer for AcmeClient {
    async fn issue(&self, domain: &str) -> Result<IssuedCertificate, AcmeError> {
        self.request_certificate(domain).await
    }
}

fn validate_domain(domain: &str) -> Result<(), AcmeError> {
    if domain.is_empty()
        || domain.contains('/')
        || domain.starts_with('.')
        || !domain.contains('.')
    {
        return Err(AcmeError::InvalidDomain(domain.to_string()));
    }
    Ok(())
}

/// Tokens published for one order
struct PublishedTokens<'a> {
    store: &'a ChallengeStore,
    tokens: Vec<String>,
}

impl<'a> PublishedTokens<'a> {
    fn new(store: &'a ChallengeStore) -> Self {
        Self {
            store,
            tokens: Vec::new(),
        }
    }

    fn publish(&mut self, token: &str, key_authorization: &str) {
        self.store.insert(token, key_authorization);
        self.tokens.push(token.to_string());
    }
}

impl Drop for PublishedTokens<'_> {
    fn drop(&mut self) {
        for token in &self.tokens {
            self.store.remove(token);
        }
    }
}
