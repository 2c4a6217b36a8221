//! Client-facing rejections.
//!
//! Each variant maps to a status and a fixed short text body. Internal error
//! details are logged where they occur and never reach the client.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayError {
    #[error("Method not allowed")]
    MethodNotAllowed,

    #[error("API key is required")]
    MissingApiKey,

    /// Unknown key, or the ledger could not be consulted.
    #[error("Invalid or expired API key")]
    InvalidApiKey,

    #[error("API key has no remaining calls")]
    QuotaExhausted,

    #[error("Request body too large")]
    PayloadTooLarge,

    #[error("Error reading request body")]
    BadRequest,

    #[error("Timed out reading request body")]
    BodyTimeout,

    #[error("Upstream authorization unavailable")]
    TokenUnavailable,

    #[error("Upstream request failed")]
    UpstreamTransport,

    #[error("Upstream request timed out")]
    UpstreamTimeout,
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            GatewayError::MissingApiKey | GatewayError::InvalidApiKey => StatusCode::UNAUTHORIZED,
            GatewayError::QuotaExhausted => StatusCode::FORBIDDEN,
            GatewayError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::BadRequest => StatusCode::BAD_REQUEST,
            GatewayError::BodyTimeout => StatusCode::REQUEST_TIMEOUT,
            GatewayError::TokenUnavailable | GatewayError::UpstreamTransport => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            GatewayError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Label used for the `outcome` metric.
    pub fn outcome(&self) -> &'static str {
        match self {
            GatewayError::MethodNotAllowed => "method_not_allowed",
            GatewayError::MissingApiKey | GatewayError::InvalidApiKey => "unauthorized",
            GatewayError::QuotaExhausted => "exhausted",
            GatewayError::PayloadTooLarge
            | GatewayError::BadRequest
            | GatewayError::BodyTimeout => "bad_request",
            GatewayError::TokenUnavailable => "token_unavailable",
            GatewayError::UpstreamTransport => "upstream_error",
            GatewayError::UpstreamTimeout => "upstream_timeout",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        (self.status(), format!("{self}\n")).into_response()
    }
}
