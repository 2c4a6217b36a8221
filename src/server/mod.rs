//! HTTP surface of the relay.
//!
//! - [`gateway`]: router, shared state, forwarding and health handlers
//! - [`streaming`]: line-at-a-time relay of upstream bodies
//! - [`error`]: client-facing rejections

pub mod error;
pub mod gateway;
pub mod streaming;
