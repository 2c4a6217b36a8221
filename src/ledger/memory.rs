//! In-process ledger guarded by a single async mutex.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{LedgerError, QuotaLedger, QuotaOutcome};

#[derive(Default)]
pub struct MemoryLedger {
    keys: Mutex<HashMap<String, u32>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a ledger pre-seeded with `(key, remaining_calls)` pairs.
    pub fn with_keys<I, K>(keys: I) -> Self
    where
        I: IntoIterator<Item = (K, u32)>,
        K: Into<String>,
    {
        Self {
            keys: Mutex::new(keys.into_iter().map(|(k, n)| (k.into(), n)).collect()),
        }
    }

    pub async fn insert(&self, key: impl Into<String>, remaining_calls: u32) {
        self.keys.lock().await.insert(key.into(), remaining_calls);
    }

    pub async fn remaining(&self, key: &str) -> Option<u32> {
        self.keys.lock().await.get(key).copied()
    }
}

#[async_trait]
impl QuotaLedger for MemoryLedger {
    async fn check_and_decrement(&self, key: &str) -> Result<QuotaOutcome, LedgerError> {
        let mut keys = self.keys.lock().await;
        let remaining = keys.get_mut(key).ok_or(LedgerError::KeyNotFound)?;

        if *remaining == 0 {
            return Ok(QuotaOutcome::Exhausted);
        }
        *remaining -= 1;
        Ok(QuotaOutcome::Granted {
            remaining: *remaining,
        })
    }

    async fn ping(&self) -> Result<(), LedgerError> {
        Ok(())
    }
}
