//! Service-account authentication against Google OAuth2.
//!
//! - [`signer`]: RS256 JWT assertions carrying the service identity
//! - [`exchange`]: JWT-bearer grant trading an assertion for an access token
//! - [`cache`]: process-wide token slot with expiry-aware refresh

pub mod cache;
pub mod exchange;
pub mod signer;

use std::time::{Duration, Instant};

use thiserror::Error;

/// Scope requested for every assertion.
pub const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

/// Assertions (and, absent `expires_in`, tokens) are valid for one hour.
pub const TOKEN_LIFETIME: Duration = Duration::from_secs(3600);

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("invalid service account credential: {0}")]
    Credential(String),

    #[error("token exchange request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("token exchange rejected: status={status}, body={body}")]
    TokenExchange { status: u16, body: String },

    #[error("malformed token response: {0}")]
    MalformedResponse(String),

    #[error("cached access token has expired")]
    Expired,
}

/// A bearer token and the instant it stops being valid.
#[derive(Clone)]
pub struct AccessToken {
    secret: String,
    expires_at: Instant,
}

impl AccessToken {
    pub fn new(secret: impl Into<String>, lifetime: Duration) -> Self {
        Self {
            secret: secret.into(),
            expires_at: Instant::now() + lifetime,
        }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// Time left before expiry (zero once expired).
    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// When a refresh should start: `margin` before expiry, but no earlier
    /// than halfway through the lifetime left now. Short-lived tokens thus
    /// still serve for a while instead of being refetched on every use.
    pub fn refresh_at(&self, margin: Duration) -> Instant {
        let lead = margin.min(self.remaining() / 2);
        self.expires_at.checked_sub(lead).unwrap_or(self.expires_at)
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("secret", &"<redacted>")
            .field("remaining", &self.remaining())
            .finish()
    }
}
