//! Process-wide bearer token slot.
//!
//! The first token is fetched at startup and a failure there is fatal. After
//! that, [`TokenCache::bearer`] hands out the held token until it enters the
//! refresh margin, at which point exactly one caller re-runs the fetcher while
//! the others wait on the same lock and reuse its result.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

use super::exchange::TokenExchanger;
use super::signer::CredentialSigner;
use super::{AccessToken, AuthError};
use crate::metrics::Metrics;

/// After a failed refresh of a still-valid token, wait this long before
/// trying again.
const REFRESH_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Source of fresh access tokens.
#[async_trait]
pub trait TokenFetcher: Send + Sync {
    async fn fetch(&self) -> Result<AccessToken, AuthError>;
}

/// Signs a new assertion and exchanges it on every fetch.
pub struct ServiceAccountFetcher {
    signer: CredentialSigner,
    exchanger: TokenExchanger,
}

impl ServiceAccountFetcher {
    pub fn new(signer: CredentialSigner, exchanger: TokenExchanger) -> Self {
        Self { signer, exchanger }
    }
}

#[async_trait]
impl TokenFetcher for ServiceAccountFetcher {
    async fn fetch(&self) -> Result<AccessToken, AuthError> {
        let assertion = self.signer.sign()?;
        self.exchanger.exchange(&assertion).await
    }
}

struct CachedToken {
    token: AccessToken,
    refresh_at: Instant,
}

impl CachedToken {
    fn new(token: AccessToken, margin: Duration) -> Self {
        let refresh_at = token.refresh_at(margin);
        Self { token, refresh_at }
    }

    fn is_fresh(&self) -> bool {
        Instant::now() < self.refresh_at
    }
}

/// Expiry-aware holder for the shared bearer token.
pub struct TokenCache {
    fetcher: Arc<dyn TokenFetcher>,
    slot: RwLock<CachedToken>,
    /// Serializes refreshes; holds the earliest instant a retry is allowed.
    refresh: Mutex<Option<Instant>>,
    margin: Duration,
    metrics: Option<Metrics>,
}

impl TokenCache {
    /// Fetch the initial token.
    pub async fn initialize(
        fetcher: Arc<dyn TokenFetcher>,
        margin: Duration,
        metrics: Option<Metrics>,
    ) -> Result<Self, AuthError> {
        let result = fetcher.fetch().await;
        if let Some(m) = &metrics {
            m.record_token_fetch(result.is_ok());
        }
        let token = result?;
        info!(expires_in_secs = token.remaining().as_secs(), "Initial access token obtained");

        Ok(Self {
            fetcher,
            slot: RwLock::new(CachedToken::new(token, margin)),
            refresh: Mutex::new(None),
            margin,
            metrics,
        })
    }

    /// Current bearer token, refreshing first if it is close to expiry.
    pub async fn bearer(&self) -> Result<String, AuthError> {
        {
            let cached = self.slot.read().await;
            if cached.is_fresh() {
                return Ok(cached.token.secret().to_string());
            }
        }
        self.refresh().await
    }

    async fn refresh(&self) -> Result<String, AuthError> {
        let mut retry_at = self.refresh.lock().await;

        let current = {
            let cached = self.slot.read().await;
            if cached.is_fresh() {
                return Ok(cached.token.secret().to_string());
            }
            cached.token.clone()
        };
        if let Some(at) = *retry_at {
            if Instant::now() < at && !current.is_expired() {
                return Ok(current.secret().to_string());
            }
        }

        let result = self.fetcher.fetch().await;
        if let Some(m) = &self.metrics {
            m.record_token_fetch(result.is_ok());
        }

        match result {
            Ok(token) => {
                info!(expires_in_secs = token.remaining().as_secs(), "Access token refreshed");
                let secret = token.secret().to_string();
                *self.slot.write().await = CachedToken::new(token, self.margin);
                *retry_at = None;
                Ok(secret)
            }
            Err(e) if !current.is_expired() => {
                warn!(
                    error = %e,
                    remaining_secs = current.remaining().as_secs(),
                    "Token refresh failed, keeping current token"
                );
                *retry_at = Some(Instant::now() + REFRESH_RETRY_DELAY);
                Ok(current.secret().to_string())
            }
            Err(e) => {
                error!(error = %e, "Token refresh failed and current token has expired");
                Err(AuthError::Expired)
            }
        }
    }
}
