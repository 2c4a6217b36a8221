//! Prometheus counters for the relay.

use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

/// Request and token counters, registered on a private registry.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Forwarding outcomes (`relayed`, `unauthorized`, `exhausted`, ...).
    pub requests: IntCounterVec,
    /// Token fetch attempts by `result` (`ok` / `error`).
    pub token_fetches: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests = IntCounterVec::new(
            Opts::new("relay_requests_total", "Forwarding requests by outcome"),
            &["outcome"],
        )?;
        let token_fetches = IntCounterVec::new(
            Opts::new("relay_token_fetches_total", "Bearer token fetches by result"),
            &["result"],
        )?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(token_fetches.clone()))?;

        Ok(Self {
            registry,
            requests,
            token_fetches,
        })
    }

    pub fn record_request(&self, outcome: &str) {
        self.requests.with_label_values(&[outcome]).inc();
    }

    pub fn record_token_fetch(&self, ok: bool) {
        let result = if ok { "ok" } else { "error" };
        self.token_fetches.with_label_values(&[result]).inc();
    }

    /// Render all series in the text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}
