//! Forwarding gateway and liveness probe.
//!
//! - `/`        POST only: quota check, forward upstream, line-streamed reply
//! - `/health`  pings the quota ledger's store
//! - `/metrics` Prometheus text format

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::{CACHE_CONTROL, CONNECTION, CONTENT_TYPE};
use axum::http::{HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::Router;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::auth::cache::TokenCache;
use crate::ledger::{LedgerError, QuotaLedger, QuotaOutcome};
use crate::metrics::Metrics;
use crate::server::error::GatewayError;
use crate::server::streaming::line_frames;
use crate::upstream::{UpstreamClient, UpstreamError};

/// Header carrying the caller's API key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Response header reporting the calls left after this one.
pub const RATE_LIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");

/// Dependencies shared by all handlers.
pub struct AppState {
    pub ledger: Arc<dyn QuotaLedger>,
    pub tokens: Arc<TokenCache>,
    pub upstream: UpstreamClient,
    pub metrics: Metrics,
    /// Inbound bodies above this size are rejected with 413.
    pub max_body_bytes: usize,
    /// The whole inbound body must arrive within this deadline.
    pub body_read_timeout: Duration,
}

/// Build the axum router with all routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", any(forward))
        .route("/health", any(health))
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn forward(State(state): State<Arc<AppState>>, req: Request) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let result = relay(&state, req, &request_id).await;

    let outcome = match &result {
        Ok(_) => "relayed",
        Err(e) => e.outcome(),
    };
    state.metrics.record_request(outcome);

    match result {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn relay(
    state: &AppState,
    req: Request,
    request_id: &str,
) -> Result<Response, GatewayError> {
    if req.method() != Method::POST {
        return Err(GatewayError::MethodNotAllowed);
    }

    let api_key = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|k| !k.is_empty())
        .ok_or(GatewayError::MissingApiKey)?
        .to_string();

    let remaining = match state.ledger.check_and_decrement(&api_key).await {
        Ok(QuotaOutcome::Granted { remaining }) => remaining,
        Ok(QuotaOutcome::Exhausted) => {
            info!(request_id, key = %key_prefix(&api_key), "API key has no remaining calls");
            return Err(GatewayError::QuotaExhausted);
        }
        Err(LedgerError::KeyNotFound) => {
            info!(request_id, key = %key_prefix(&api_key), "Unknown API key");
            return Err(GatewayError::InvalidApiKey);
        }
        Err(e @ LedgerError::Storage(_)) => {
            // Fail closed: no ledger, no authorization.
            error!(request_id, error = %e, "Quota ledger unavailable");
            return Err(GatewayError::InvalidApiKey);
        }
    };

    let read = axum::body::to_bytes(req.into_body(), state.max_body_bytes);
    let body = tokio::time::timeout(state.body_read_timeout, read)
        .await
        .map_err(|_| {
            info!(request_id, "Timed out reading request body");
            GatewayError::BodyTimeout
        })?
        .map_err(|e| {
            if is_length_limit(&e) {
                info!(request_id, limit = state.max_body_bytes, "Request body too large");
                GatewayError::PayloadTooLarge
            } else {
                warn!(request_id, error = %e, "Failed to read request body");
                GatewayError::BadRequest
            }
        })?;
    debug!(request_id, body = %String::from_utf8_lossy(&body), "Request body");

    let bearer = state.tokens.bearer().await.map_err(|e| {
        error!(request_id, error = %e, "No usable access token");
        GatewayError::TokenUnavailable
    })?;

    let upstream = state.upstream.send(&bearer, body).await.map_err(|e| match e {
        UpstreamError::Timeout(_) => {
            warn!(request_id, error = %e, "Upstream timed out");
            GatewayError::UpstreamTimeout
        }
        UpstreamError::Transport(_) => {
            error!(request_id, error = %e, "Upstream request failed");
            GatewayError::UpstreamTransport
        }
    })?;

    let status = StatusCode::from_u16(upstream.status().as_u16())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_success() {
        info!(
            request_id,
            status = status.as_u16(),
            remaining,
            "Streaming upstream response"
        );
    } else {
        warn!(
            request_id,
            status = status.as_u16(),
            remaining,
            "Upstream returned an error status"
        );
    }

    let frames = line_frames(upstream.bytes_stream(), request_id);

    let mut response = Response::new(Body::from_stream(frames));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(remaining));

    Ok(response)
}

/// Short, log-safe prefix of an API key.
fn key_prefix(key: &str) -> String {
    let prefix: String = key.chars().take(4).collect();
    format!("{prefix}…")
}

fn is_length_limit(err: &axum::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = source {
        if e.is::<http_body_util::LengthLimitError>() {
            return true;
        }
        source = e.source();
    }
    false
}

async fn health(State(state): State<Arc<AppState>>) -> Response {
    match state.ledger.ping().await {
        Ok(()) => (StatusCode::OK, "OK").into_response(),
        Err(e) => {
            warn!(error = %e, "Health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "Database connection failed").into_response()
        }
    }
}

async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    match state.metrics.encode() {
        Ok(text) => (
            StatusCode::OK,
            [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            text,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response()
        }
    }
}
