//! Postgres-backed quota ledger.
//!
//! The table is created on startup if it does not exist:
//!
//! ```sql
//! CREATE TABLE IF NOT EXISTS api_keys (
//!     key TEXT PRIMARY KEY,
//!     remaining_calls INTEGER NOT NULL
//! )
//! ```
//!
//! Rows are provisioned out of band; this service only decrements them.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgSslMode};
use tracing::{debug, info};

use super::{LedgerError, QuotaLedger, QuotaOutcome};
use crate::config::DatabaseConfig;

/// How long a request waits for a pooled connection before failing.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

const CREATE_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS api_keys (
        key TEXT PRIMARY KEY,
        remaining_calls INTEGER NOT NULL
    )
"#;

// The WHERE guard and the decrement run as one statement under the row lock,
// so two concurrent callers cannot both take the last call.
const DECREMENT: &str = r#"
    UPDATE api_keys
    SET remaining_calls = remaining_calls - 1
    WHERE key = $1 AND remaining_calls > 0
    RETURNING remaining_calls
"#;

const KEY_EXISTS: &str = "SELECT EXISTS (SELECT 1 FROM api_keys WHERE key = $1)";

#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    /// Open a bounded pool, verify connectivity and ensure the schema exists.
    pub async fn connect(cfg: &DatabaseConfig) -> Result<Self, LedgerError> {
        let options = PgConnectOptions::new()
            .host(&cfg.host)
            .port(cfg.port)
            .username(&cfg.user)
            .password(&cfg.password)
            .database(&cfg.name)
            .ssl_mode(PgSslMode::Disable);

        let pool = PgPoolOptions::new()
            .max_connections(cfg.max_connections)
            .max_lifetime(cfg.max_lifetime)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_with(options)
            .await?;

        info!(
            host = %cfg.host,
            port = cfg.port,
            database = %cfg.name,
            max_connections = cfg.max_connections,
            "Connected to quota ledger"
        );

        let ledger = Self { pool };
        ledger.ensure_schema().await?;
        Ok(ledger)
    }

    /// Wrap an existing pool (schema is not touched).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<(), LedgerError> {
        sqlx::query(CREATE_TABLE).execute(&self.pool).await?;
        debug!("api_keys table ready");
        Ok(())
    }

    /// Insert or overwrite a key's budget.
    pub async fn set_remaining(&self, key: &str, remaining_calls: i32) -> Result<(), LedgerError> {
        sqlx::query(
            "INSERT INTO api_keys (key, remaining_calls) VALUES ($1, $2) \
             ON CONFLICT (key) DO UPDATE SET remaining_calls = EXCLUDED.remaining_calls",
        )
        .bind(key)
        .bind(remaining_calls)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remaining(&self, key: &str) -> Result<Option<i32>, LedgerError> {
        let value = sqlx::query_scalar::<_, i32>(
            "SELECT remaining_calls FROM api_keys WHERE key = $1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(value)
    }
}

#[async_trait]
impl QuotaLedger for PgLedger {
    async fn check_and_decrement(&self, key: &str) -> Result<QuotaOutcome, LedgerError> {
        let updated = sqlx::query_scalar::<_, i32>(DECREMENT)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        if let Some(remaining) = updated {
            return Ok(QuotaOutcome::Granted {
                remaining: u32::try_from(remaining).unwrap_or(0),
            });
        }

        // Nothing updated: either the key is unknown or its budget is spent.
        // Budgets only ever shrink, so this follow-up read cannot misreport.
        let exists = sqlx::query_scalar::<_, bool>(KEY_EXISTS)
            .bind(key)
            .fetch_one(&self.pool)
            .await?;

        if exists {
            Ok(QuotaOutcome::Exhausted)
        } else {
            Err(LedgerError::KeyNotFound)
        }
    }

    async fn ping(&self) -> Result<(), LedgerError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
