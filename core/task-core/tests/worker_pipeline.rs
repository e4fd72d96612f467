//! End-to-end tests for the consume/claim/execute/finalize pipeline against
//! an [`InMemoryBroker`]: happy path, flaky-retry-succeeds, terminal DLQ,
//! duplicate delivery, and crash recovery via claim.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use broker::{Broker, InMemoryBroker, TaskEnvelope};
use serde_json::json;
use sqlx::PgPool;
use task_core::config::{AdmissionConfig, BrokerConfig, RetryConfig};
use task_core::error::HandlerError;
use task_core::handlers::HandlerRegistry;
use task_core::metrics::Metrics;
use task_core::worker::Worker;
use task_core::{admission, dispatcher, store};

const STREAM: &str = "trx.tasks";
const GROUP: &str = "trx.workers";

fn admission_config() -> AdmissionConfig {
    AdmissionConfig {
        dedupe_window_ms: 60_000,
        clock_skew_ms: 500,
    }
}

fn broker_config(consumer: &str) -> BrokerConfig {
    BrokerConfig {
        redis_url: String::new(),
        stream: STREAM.to_string(),
        dlq_stream: "trx.tasks.dlq".to_string(),
        group: GROUP.to_string(),
        consumer: consumer.to_string(),
        block_ms: 0,
        max_len: 10_000,
    }
}

fn retry_config(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        backoff_base_ms: 1,
        backoff_multiplier: 1.0,
        handler_timeout_ms: 0,
    }
}

/// Deliver one pending entry for `consumer`, then let a worker for that
/// same consumer claim-and-process it immediately (`min_idle_ms = 0`).
/// Exercises the exact recovery path a crashed-consumer restart takes,
/// without needing the busy-poll `Worker::run` loop in a test.
async fn deliver_and_process(broker: &Arc<dyn Broker>, worker: &Worker, consumer: &str) -> usize {
    broker
        .read_group(STREAM, GROUP, consumer, 16, 0)
        .await
        .unwrap();
    worker.claim_and_process(0).await
}

async fn task_status(pool: &PgPool, task_id: i64) -> String {
    let (status,): (String,) = sqlx::query_as("SELECT status FROM tasks WHERE id = $1")
        .bind(task_id)
        .fetch_one(pool)
        .await
        .unwrap();
    status
}

async fn task_attempts(pool: &PgPool, task_id: i64) -> i32 {
    let (attempts,): (i32,) = sqlx::query_as("SELECT attempts FROM tasks WHERE id = $1")
        .bind(task_id)
        .fetch_one(pool)
        .await
        .unwrap();
    attempts
}

#[sqlx::test]
async fn happy_path_succeeds_on_first_attempt(pool: PgPool) -> sqlx::Result<()> {
    let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
    broker.ensure_group(STREAM, GROUP).await.unwrap();

    let outcome = admission::submit(&pool, &admission_config(), STREAM, "echo", json!({"msg": "hi"}), None)
        .await
        .unwrap();
    dispatcher::dispatch_task(&pool, &broker, STREAM, 10_000, outcome.task.id)
        .await
        .unwrap();

    let worker = Worker::new(
        pool.clone(),
        broker.clone(),
        broker_config("worker-1"),
        retry_config(5),
        admission_config(),
        HandlerRegistry::with_reference_handlers(),
        Arc::new(Metrics::new()),
    );

    let processed = deliver_and_process(&broker, &worker, "worker-1").await;
    assert_eq!(processed, 1);

    assert_eq!(task_status(&pool, outcome.task.id).await, "done");
    assert_eq!(task_attempts(&pool, outcome.task.id).await, 1);

    let pending = broker.pending_range(STREAM, GROUP, 10).await.unwrap();
    assert!(pending.is_empty());

    Ok(())
}

#[sqlx::test]
async fn flaky_handler_retries_then_succeeds(pool: PgPool) -> sqlx::Result<()> {
    let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
    broker.ensure_group(STREAM, GROUP).await.unwrap();

    let outcome = admission::submit(&pool, &admission_config(), STREAM, "flaky", json!({}), None)
        .await
        .unwrap();
    dispatcher::dispatch_task(&pool, &broker, STREAM, 10_000, outcome.task.id)
        .await
        .unwrap();

    let failures_left = Arc::new(AtomicUsize::new(1));
    let mut handlers = HandlerRegistry::new();
    handlers.register("flaky", move |_payload| {
        let failures_left = failures_left.clone();
        async move {
            if failures_left.fetch_sub(1, Ordering::SeqCst) > 0 {
                Err(HandlerError::Failed("transient".into()))
            } else {
                Ok(())
            }
        }
    });

    let worker = Worker::new(
        pool.clone(),
        broker.clone(),
        broker_config("worker-1"),
        retry_config(3),
        admission_config(),
        handlers,
        Arc::new(Metrics::new()),
    );

    // First delivery fails and reschedules, via `schedule_delayed_republish`
    // spawned on the current runtime; give it a moment to land the re-publish.
    let processed = deliver_and_process(&broker, &worker, "worker-1").await;
    assert_eq!(processed, 1);
    assert_eq!(task_status(&pool, outcome.task.id).await, "retrying");
    assert_eq!(task_attempts(&pool, outcome.task.id).await, 1);

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let processed = deliver_and_process(&broker, &worker, "worker-1").await;
    assert_eq!(processed, 1);
    assert_eq!(task_status(&pool, outcome.task.id).await, "done");
    assert_eq!(task_attempts(&pool, outcome.task.id).await, 2);

    let mut tx = pool.begin().await?;
    let dlq_count = store::count_dead_letter(&mut tx).await.unwrap();
    tx.rollback().await?;
    assert_eq!(dlq_count, 0);

    Ok(())
}

#[sqlx::test]
async fn always_failing_handler_terminates_in_dead_letter(pool: PgPool) -> sqlx::Result<()> {
    let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
    broker.ensure_group(STREAM, GROUP).await.unwrap();

    let outcome = admission::submit(&pool, &admission_config(), STREAM, "always_fails", json!({}), None)
        .await
        .unwrap();
    dispatcher::dispatch_task(&pool, &broker, STREAM, 10_000, outcome.task.id)
        .await
        .unwrap();

    let mut handlers = HandlerRegistry::new();
    handlers.register("always_fails", |_payload| async move {
        Err(HandlerError::Failed("boom".into()))
    });

    let worker = Worker::new(
        pool.clone(),
        broker.clone(),
        broker_config("worker-1"),
        retry_config(1),
        admission_config(),
        handlers,
        Arc::new(Metrics::new()),
    );

    let processed = deliver_and_process(&broker, &worker, "worker-1").await;
    assert_eq!(processed, 1);
    assert_eq!(task_status(&pool, outcome.task.id).await, "dead_letter");

    let mut tx = pool.begin().await?;
    let dlq_count = store::count_dead_letter(&mut tx).await.unwrap();
    tx.rollback().await?;
    assert_eq!(dlq_count, 1);

    let dlq_entries = broker
        .read_group("trx.tasks.dlq", "ignored", "inspector", 10, 0)
        .await;
    assert!(dlq_entries.is_err(), "dlq stream exists but has no group yet");

    Ok(())
}

#[sqlx::test]
async fn duplicate_delivery_of_the_same_task_is_skipped_once(pool: PgPool) -> sqlx::Result<()> {
    let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
    broker.ensure_group(STREAM, GROUP).await.unwrap();

    let outcome = admission::submit(&pool, &admission_config(), STREAM, "echo", json!({"x": 1}), None)
        .await
        .unwrap();

    let envelope = TaskEnvelope {
        task_id: outcome.task.id,
        name: "echo".to_string(),
        payload: outcome.task.payload.to_string(),
        execution_key: outcome.task.execution_key.clone(),
        scheduled_at: outcome.task.scheduled_at,
        attempt: 1,
    };

    // Two independent broker deliveries of the same logical task, as a
    // redelivery race (not two outbox rows) would produce.
    broker.publish(STREAM, envelope.to_fields(), 10_000).await.unwrap();
    broker.publish(STREAM, envelope.to_fields(), 10_000).await.unwrap();

    let worker = Worker::new(
        pool.clone(),
        broker.clone(),
        broker_config("worker-1"),
        retry_config(5),
        admission_config(),
        HandlerRegistry::with_reference_handlers(),
        Arc::new(Metrics::new()),
    );

    broker
        .read_group(STREAM, GROUP, "worker-1", 16, 0)
        .await
        .unwrap();
    let processed = worker.claim_and_process(0).await;
    assert_eq!(processed, 2);

    assert_eq!(task_status(&pool, outcome.task.id).await, "done");
    assert_eq!(task_attempts(&pool, outcome.task.id).await, 1);

    Ok(())
}

#[sqlx::test]
async fn handler_exceeding_timeout_is_reported_as_execution_failure(pool: PgPool) -> sqlx::Result<()> {
    let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
    broker.ensure_group(STREAM, GROUP).await.unwrap();

    let outcome = admission::submit(&pool, &admission_config(), STREAM, "slow", json!({}), None)
        .await
        .unwrap();
    dispatcher::dispatch_task(&pool, &broker, STREAM, 10_000, outcome.task.id)
        .await
        .unwrap();

    let mut handlers = HandlerRegistry::new();
    handlers.register("slow", |_payload| async move {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        Ok(())
    });

    let mut retry = retry_config(1);
    retry.handler_timeout_ms = 5;

    let worker = Worker::new(
        pool.clone(),
        broker.clone(),
        broker_config("worker-1"),
        retry,
        admission_config(),
        handlers,
        Arc::new(Metrics::new()),
    );

    let processed = deliver_and_process(&broker, &worker, "worker-1").await;
    assert_eq!(processed, 1);
    assert_eq!(task_status(&pool, outcome.task.id).await, "dead_letter");

    Ok(())
}

#[sqlx::test]
async fn crashed_consumers_pending_entry_is_recovered_by_claim(pool: PgPool) -> sqlx::Result<()> {
    let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
    broker.ensure_group(STREAM, GROUP).await.unwrap();

    let outcome = admission::submit(&pool, &admission_config(), STREAM, "echo", json!({"x": 1}), None)
        .await
        .unwrap();
    dispatcher::dispatch_task(&pool, &broker, STREAM, 10_000, outcome.task.id)
        .await
        .unwrap();

    // worker-1 reads the entry (now pending) and then "crashes": it never
    // calls claim_and_process, so the entry is never handled or acked.
    broker
        .read_group(STREAM, GROUP, "worker-1", 16, 0)
        .await
        .unwrap();

    let pending = broker.pending_range(STREAM, GROUP, 10).await.unwrap();
    assert_eq!(pending.len(), 1);

    // worker-2 takes over with min_idle_ms = 0, claiming immediately.
    let worker_2 = Worker::new(
        pool.clone(),
        broker.clone(),
        broker_config("worker-2"),
        retry_config(5),
        admission_config(),
        HandlerRegistry::with_reference_handlers(),
        Arc::new(Metrics::new()),
    );
    let processed = worker_2.claim_and_process(0).await;
    assert_eq!(processed, 1);

    assert_eq!(task_status(&pool, outcome.task.id).await, "done");

    let pending = broker.pending_range(STREAM, GROUP, 10).await.unwrap();
    assert!(pending.is_empty());

    Ok(())
}
