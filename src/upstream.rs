//! Upstream inference endpoint.
//!
//! Requests go to the regional Vertex AI `streamRawPredict` URL for a fixed
//! publisher/model pair, bearer-authorized with the shared service token.

use std::time::Duration;

use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Response};
use thiserror::Error;
use tracing::debug;

use crate::config::UpstreamConfig;

#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("upstream request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("upstream did not respond within {0:?}")]
    Timeout(Duration),
}

/// Regional host for a Vertex AI location.
pub fn regional_base_url(region: &str) -> String {
    format!("https://{region}-aiplatform.googleapis.com")
}

/// Full `streamRawPredict` URL for the configured model.
pub fn stream_raw_predict_url(cfg: &UpstreamConfig) -> String {
    let base = cfg
        .base_url
        .clone()
        .unwrap_or_else(|| regional_base_url(&cfg.region));
    format!(
        "{}/v1/projects/{}/locations/{}/publishers/{}/models/{}:streamRawPredict",
        base.trim_end_matches('/'),
        cfg.project_id,
        cfg.region,
        cfg.publisher,
        cfg.model
    )
}

/// HTTP client bound to one upstream URL.
#[derive(Clone)]
pub struct UpstreamClient {
    http: Client,
    url: String,
    response_timeout: Duration,
}

impl UpstreamClient {
    /// Build a client whose body reads fail after `idle_timeout` of silence.
    pub fn new(cfg: &UpstreamConfig) -> Result<Self, UpstreamError> {
        let http = Client::builder()
            .read_timeout(cfg.idle_timeout)
            .build()?;
        Ok(Self::with_client(http, cfg))
    }

    pub fn with_client(http: Client, cfg: &UpstreamConfig) -> Self {
        Self {
            http,
            url: stream_raw_predict_url(cfg),
            response_timeout: cfg.response_timeout,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Forward `body` verbatim and wait (bounded) for the response headers.
    ///
    /// The body of the returned response is not read here.
    pub async fn send(&self, bearer: &str, body: Bytes) -> Result<Response, UpstreamError> {
        debug!(url = %self.url, bytes = body.len(), "Forwarding request upstream");

        let request = self
            .http
            .post(&self.url)
            .bearer_auth(bearer)
            .header(CONTENT_TYPE, "application/json; charset=utf-8")
            .body(body)
            .send();

        let response = tokio::time::timeout(self.response_timeout, request)
            .await
            .map_err(|_| UpstreamError::Timeout(self.response_timeout))??;

        Ok(response)
    }
}
