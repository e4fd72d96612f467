//! Integration tests against a real Postgres instance (via `#[sqlx::test]`),
//! covering admission dedup, outbox consistency, and the dispatch/DLQ
//! transitions.

use std::sync::Arc;

use broker::{Broker, InMemoryBroker};
use chrono::Utc;
use serde_json::json;
use sqlx::PgPool;
use task_core::config::{AdmissionConfig, RetryConfig};
use task_core::{admission, dispatcher, store};

fn admission_config() -> AdmissionConfig {
    AdmissionConfig {
        dedupe_window_ms: 60_000,
        clock_skew_ms: 500,
    }
}

#[sqlx::test]
async fn submit_within_skew_window_deduplicates(pool: PgPool) -> sqlx::Result<()> {
    let config = admission_config();
    let t = Utc::now();

    let first = admission::submit(&pool, &config, "trx.tasks", "echo", json!({"msg": "hi"}), Some(t))
        .await
        .unwrap();
    assert!(!first.deduped);

    let second = admission::submit(
        &pool,
        &config,
        "trx.tasks",
        "echo",
        json!({"msg": "hi"}),
        Some(t + chrono::Duration::milliseconds(config.clock_skew_ms - 10)),
    )
    .await
    .unwrap();

    assert!(second.deduped);
    assert_eq!(first.task.id, second.task.id);

    Ok(())
}

#[sqlx::test]
async fn submit_rejects_non_object_payload(pool: PgPool) -> sqlx::Result<()> {
    let config = admission_config();
    let err = admission::submit(&pool, &config, "trx.tasks", "echo", json!("not an object"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, task_core::error::AdmissionError::InvalidPayload(_)));
    Ok(())
}

#[sqlx::test]
async fn different_payloads_get_different_tasks(pool: PgPool) -> sqlx::Result<()> {
    let config = admission_config();
    let t = Utc::now();

    let a = admission::submit(&pool, &config, "trx.tasks", "echo", json!({"x": 1}), Some(t))
        .await
        .unwrap();
    let b = admission::submit(&pool, &config, "trx.tasks", "echo", json!({"x": 2}), Some(t))
        .await
        .unwrap();

    assert!(!a.deduped);
    assert!(!b.deduped);
    assert_ne!(a.task.id, b.task.id);
    assert_ne!(a.task.execution_key, b.task.execution_key);

    Ok(())
}

#[sqlx::test]
async fn dispatch_task_is_idempotent(pool: PgPool) -> sqlx::Result<()> {
    let config = admission_config();
    let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
    broker.ensure_group("trx.tasks", "trx.workers").await.unwrap();

    let outcome = admission::submit(&pool, &config, "trx.tasks", "echo", json!({"x": 1}), None)
        .await
        .unwrap();

    let first = dispatcher::dispatch_task(&pool, &broker, "trx.tasks", 10_000, outcome.task.id)
        .await
        .unwrap();
    let stream_id = match first {
        dispatcher::DispatchOutcome::Published(id) => id,
        other => panic!("expected Published, got {other:?}"),
    };

    let second = dispatcher::dispatch_task(&pool, &broker, "trx.tasks", 10_000, outcome.task.id)
        .await
        .unwrap();
    assert_eq!(second, dispatcher::DispatchOutcome::AlreadyPublished(stream_id));

    Ok(())
}

#[sqlx::test]
async fn outbox_sent_at_and_stream_id_are_consistent(pool: PgPool) -> sqlx::Result<()> {
    let config = admission_config();
    let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
    broker.ensure_group("trx.tasks", "trx.workers").await.unwrap();

    let outcome = admission::submit(&pool, &config, "trx.tasks", "echo", json!({"x": 1}), None)
        .await
        .unwrap();

    dispatcher::dispatch_task(&pool, &broker, "trx.tasks", 10_000, outcome.task.id)
        .await
        .unwrap();

    let mut tx = pool.begin().await?;
    let (outbox, _task) = store::lock_outbox_for_dispatch(&mut tx, outcome.task.id)
        .await
        .unwrap()
        .unwrap();
    assert!(outbox.sent_at.is_some());
    assert!(outbox.stream_id.is_some());
    tx.rollback().await?;

    Ok(())
}

#[sqlx::test]
async fn not_yet_due_outbox_rows_are_skipped(pool: PgPool) -> sqlx::Result<()> {
    let config = admission_config();
    let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
    broker.ensure_group("trx.tasks", "trx.workers").await.unwrap();

    let future = Utc::now() + chrono::Duration::seconds(60);
    let outcome = admission::submit(&pool, &config, "trx.tasks", "echo", json!({"x": 1}), Some(future))
        .await
        .unwrap();

    let result = dispatcher::dispatch_task(&pool, &broker, "trx.tasks", 10_000, outcome.task.id)
        .await
        .unwrap();
    assert_eq!(result, dispatcher::DispatchOutcome::NotYetDue);

    Ok(())
}

#[sqlx::test]
async fn flush_due_publishes_only_due_rows(pool: PgPool) -> sqlx::Result<()> {
    let config = admission_config();
    let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
    broker.ensure_group("trx.tasks", "trx.workers").await.unwrap();

    let due = admission::submit(&pool, &config, "trx.tasks", "echo", json!({"x": 1}), None)
        .await
        .unwrap();
    let not_due = admission::submit(
        &pool,
        &config,
        "trx.tasks",
        "echo",
        json!({"x": 2}),
        Some(Utc::now() + chrono::Duration::seconds(120)),
    )
    .await
    .unwrap();

    let published = dispatcher::flush_due(&pool, &broker, "trx.tasks", 10_000, 10)
        .await
        .unwrap();
    assert_eq!(published, 1);

    let mut tx = pool.begin().await?;
    let (due_outbox, _) = store::lock_outbox_for_dispatch(&mut tx, due.task.id)
        .await
        .unwrap()
        .unwrap();
    assert!(due_outbox.sent_at.is_some());

    let (not_due_outbox, _) = store::lock_outbox_for_dispatch(&mut tx, not_due.task.id)
        .await
        .unwrap()
        .unwrap();
    assert!(not_due_outbox.sent_at.is_none());
    tx.rollback().await?;

    Ok(())
}

#[sqlx::test]
async fn retry_then_dead_letter_records_one_dlq_row(pool: PgPool) -> sqlx::Result<()> {
    let config = admission_config();
    let retry_config = RetryConfig {
        max_attempts: 2,
        backoff_base_ms: 1,
        backoff_multiplier: 1.0,
        handler_timeout_ms: 0,
    };

    let outcome = admission::submit(&pool, &config, "trx.tasks", "echo", json!({"x": 1}), None)
        .await
        .unwrap();

    // First failure: attempts=1 < max_attempts=2, retries.
    let mut tx = pool.begin().await?;
    store::set_task_started(&mut tx, outcome.task.id, &outcome.task.execution_key)
        .await
        .unwrap();
    let attempts = store::set_task_finished_failure(&mut tx, outcome.task.id, "boom")
        .await
        .unwrap();
    assert_eq!(attempts, 1);
    let decision = task_core::retry::decide(&retry_config, attempts as u32);
    assert!(matches!(decision, task_core::retry::RetryDecision::Retry { .. }));
    store::mark_task_retry(&mut tx, outcome.task.id, Utc::now(), Utc::now())
        .await
        .unwrap();
    tx.commit().await?;

    // Second failure: attempts=2 == max_attempts=2, dead-letters.
    let mut tx = pool.begin().await?;
    store::set_task_started(&mut tx, outcome.task.id, &outcome.task.execution_key)
        .await
        .unwrap();
    let attempts = store::set_task_finished_failure(&mut tx, outcome.task.id, "boom again")
        .await
        .unwrap();
    assert_eq!(attempts, 2);
    let decision = task_core::retry::decide(&retry_config, attempts as u32);
    assert_eq!(decision, task_core::retry::RetryDecision::DeadLetter);
    store::move_to_dead_letter(
        &mut tx,
        outcome.task.id,
        &outcome.task.execution_key,
        "echo",
        "{}",
        "boom again",
    )
    .await
    .unwrap();
    let dlq_count = store::count_dead_letter(&mut tx).await.unwrap();
    tx.commit().await?;

    assert_eq!(dlq_count, 1);
    Ok(())
}
