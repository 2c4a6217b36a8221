//! Quota ledger semantics and concurrency.
//!
//! The in-memory backend always runs. The Postgres backend runs only when
//! `TEST_DATABASE_URL` points at a scratch database.

use std::collections::BTreeSet;
use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use vertex_relay::ledger::memory::MemoryLedger;
use vertex_relay::ledger::postgres::PgLedger;
use vertex_relay::ledger::{LedgerError, QuotaLedger, QuotaOutcome};

async fn run_concurrent(
    ledger: Arc<dyn QuotaLedger>,
    key: &str,
    callers: usize,
) -> Vec<QuotaOutcome> {
    let tasks: Vec<_> = (0..callers)
        .map(|_| {
            let ledger = ledger.clone();
            let key = key.to_string();
            tokio::spawn(async move { ledger.check_and_decrement(&key).await.unwrap() })
        })
        .collect();

    let mut outcomes = Vec::with_capacity(callers);
    for task in tasks {
        outcomes.push(task.await.unwrap());
    }
    outcomes
}

fn granted_remaining(outcome: &QuotaOutcome) -> Option<u32> {
    match outcome {
        QuotaOutcome::Granted { remaining } => Some(*remaining),
        QuotaOutcome::Exhausted => None,
    }
}

#[tokio::test]
async fn test_decrement_returns_remaining_after() {
    let ledger = MemoryLedger::with_keys([("abc", 3)]);

    assert_eq!(
        ledger.check_and_decrement("abc").await.unwrap(),
        QuotaOutcome::Granted { remaining: 2 }
    );
    assert_eq!(ledger.remaining("abc").await, Some(2));
}

#[tokio::test]
async fn test_sequence_down_to_exhaustion() {
    let ledger = MemoryLedger::with_keys([("abc", 3)]);

    let mut seen = Vec::new();
    for _ in 0..4 {
        seen.push(ledger.check_and_decrement("abc").await.unwrap());
    }

    assert_eq!(
        seen,
        vec![
            QuotaOutcome::Granted { remaining: 2 },
            QuotaOutcome::Granted { remaining: 1 },
            QuotaOutcome::Granted { remaining: 0 },
            QuotaOutcome::Exhausted,
        ]
    );
}

#[tokio::test]
async fn test_exhausted_key_is_left_unchanged() {
    let ledger = MemoryLedger::with_keys([("empty", 0)]);

    let outcome = ledger.check_and_decrement("empty").await.unwrap();
    assert_eq!(outcome, QuotaOutcome::Exhausted);
    assert_eq!(ledger.remaining("empty").await, Some(0));
}

#[tokio::test]
async fn test_unknown_key() {
    let ledger = MemoryLedger::new();
    ledger.insert("known", 1).await;

    assert!(matches!(
        ledger.check_and_decrement("unknown").await,
        Err(LedgerError::KeyNotFound)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_callers_never_overspend() {
    let ledger = Arc::new(MemoryLedger::with_keys([("shared", 5)]));

    let outcomes = run_concurrent(ledger.clone(), "shared", 40).await;

    let granted: Vec<u32> = outcomes.iter().filter_map(granted_remaining).collect();
    assert_eq!(granted.len(), 5);
    assert_eq!(
        granted.into_iter().collect::<BTreeSet<u32>>(),
        (0..5).collect::<BTreeSet<u32>>()
    );
    assert_eq!(ledger.remaining("shared").await, Some(0));
}

// ─── Postgres ──────────────────────────────────────────────────────────────

async fn pg_ledger() -> Option<PgLedger> {
    let url = std::env::var("TEST_DATABASE_URL").ok()?;
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .expect("TEST_DATABASE_URL is set but not reachable");
    let ledger = PgLedger::from_pool(pool);
    ledger.ensure_schema().await.unwrap();
    Some(ledger)
}

fn scratch_key() -> String {
    format!("test-{}", Uuid::new_v4())
}

#[tokio::test]
async fn test_pg_sequence_down_to_exhaustion() {
    let Some(ledger) = pg_ledger().await else {
        return;
    };
    let key = scratch_key();
    ledger.set_remaining(&key, 2).await.unwrap();

    assert_eq!(
        ledger.check_and_decrement(&key).await.unwrap(),
        QuotaOutcome::Granted { remaining: 1 }
    );
    assert_eq!(
        ledger.check_and_decrement(&key).await.unwrap(),
        QuotaOutcome::Granted { remaining: 0 }
    );
    assert_eq!(
        ledger.check_and_decrement(&key).await.unwrap(),
        QuotaOutcome::Exhausted
    );
    assert_eq!(ledger.remaining(&key).await.unwrap(), Some(0));
}

#[tokio::test]
async fn test_pg_unknown_key_and_ping() {
    let Some(ledger) = pg_ledger().await else {
        return;
    };
    ledger.ping().await.unwrap();
    assert!(matches!(
        ledger.check_and_decrement(&scratch_key()).await,
        Err(LedgerError::KeyNotFound)
    ));
}

#[tokio::test]
async fn test_pg_negative_budget_is_not_touched() {
    let Some(ledger) = pg_ledger().await else {
        return;
    };
    let key = scratch_key();
    ledger.set_remaining(&key, -3).await.unwrap();

    assert_eq!(
        ledger.check_and_decrement(&key).await.unwrap(),
        QuotaOutcome::Exhausted
    );
    assert_eq!(ledger.remaining(&key).await.unwrap(), Some(-3));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_pg_concurrent_callers_never_overspend() {
    let Some(ledger) = pg_ledger().await else {
        return;
    };
    let key = scratch_key();
    ledger.set_remaining(&key, 7).await.unwrap();

    let shared: Arc<dyn QuotaLedger> = Arc::new(ledger.clone());
    let outcomes = run_concurrent(shared, &key, 30).await;

    assert_eq!(outcomes.iter().filter_map(granted_remaining).count(), 7);
    assert_eq!(ledger.remaining(&key).await.unwrap(), Some(0));
}
