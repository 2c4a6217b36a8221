//! OAuth2 JWT-bearer grant (RFC 7523).

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;

use super::{AccessToken, AuthError, TOKEN_LIFETIME};

pub const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Trades signed assertions for bearer tokens at a fixed endpoint.
#[derive(Clone)]
pub struct TokenExchanger {
    http: Client,
    token_url: String,
}

impl TokenExchanger {
    pub fn new(http: Client, token_url: impl Into<String>) -> Self {
        Self {
            http,
            token_url: token_url.into(),
        }
    }

    /// POST the assertion as a form and parse `access_token` from the reply.
    pub async fn exchange(&self, assertion: &str) -> Result<AccessToken, AuthError> {
        let resp = self
            .http
            .post(&self.token_url)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion)])
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;

        if status != StatusCode::OK {
            return Err(AuthError::TokenExchange {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| AuthError::MalformedResponse(e.to_string()))?;
        if parsed.access_token.is_empty() {
            return Err(AuthError::MalformedResponse(
                "empty access_token".to_string(),
            ));
        }

        let lifetime = parsed
            .expires_in
            .map(Duration::from_secs)
            .unwrap_or(TOKEN_LIFETIME);
        debug!(lifetime_secs = lifetime.as_secs(), "Access token issued");

        Ok(AccessToken::new(parsed.access_token, lifetime))
    }
}
