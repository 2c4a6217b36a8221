//! vertex-relay: quota-metered streaming relay for Vertex AI.
//!
//! Callers present an API key; each request spends one call from the key's
//! budget in a Postgres ledger, is forwarded to a Vertex AI
//! `streamRawPredict` endpoint under a service-account bearer token, and the
//! upstream's newline-delimited event stream is relayed back line by line.

pub mod auth;
pub mod config;
pub mod ledger;
pub mod metrics;
pub mod server;
pub mod upstream;
