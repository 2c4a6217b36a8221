//! Quota ledger: API key → remaining call budget.
//!
//! - [`postgres`]: production backend over a bounded `sqlx` pool
//! - [`memory`]: in-process backend for tests and local runs
//!
//! Every backend must make check-and-decrement a single indivisible step, so
//! concurrent callers can never both spend the last remaining call.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("API key not found")]
    KeyNotFound,

    #[error("storage error: {0}")]
    Storage(String),
}

impl From<sqlx::Error> for LedgerError {
    fn from(e: sqlx::Error) -> Self {
        LedgerError::Storage(e.to_string())
    }
}

/// Result of a check-and-decrement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaOutcome {
    /// One call was consumed; `remaining` is the budget left afterwards.
    Granted { remaining: u32 },
    /// The budget was already zero; nothing was changed.
    Exhausted,
}

#[async_trait]
pub trait QuotaLedger: Send + Sync {
    /// Atomically spend one call from `key`'s budget.
    ///
    /// Unknown keys fail with [`LedgerError::KeyNotFound`]. A key with no
    /// budget left yields [`QuotaOutcome::Exhausted`] and is not modified.
    async fn check_and_decrement(&self, key: &str) -> Result<QuotaOutcome, LedgerError>;

    /// Check that the backing store is reachable.
    async fn ping(&self) -> Result<(), LedgerError>;
}
