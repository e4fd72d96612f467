//! Idempotent worker pipeline: consumes broker entries, enforces
//! single-execution-per-attempt via the inbox, runs the handler, and
//! finalizes the outcome into retry or dead-letter.

use std::sync::Arc;
use std::time::Duration;

use broker::{Broker, DlqEnvelope, Fields, TaskEnvelope};
use rand::Rng;
use sqlx::PgPool;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{AdmissionConfig, BrokerConfig, RetryConfig};
use crate::dispatcher;
use crate::error::WorkerError;
use crate::handlers::HandlerRegistry;
use crate::metrics::{Metrics, Timer};
use crate::retry::{self, RetryDecision};
use crate::store;

/// Fresh 128-bit trace id / 64-bit span id pair, bound for the duration of
/// one message. Held as plain values rather than a
/// `tokio::task_local!` pair: each message is handled to completion inside
/// one `tokio::spawn`'d task with no nested sub-tasks that would need to
/// inherit it implicitly, so passing it through the `tracing` span covers
/// every log line the handler body emits.
#[derive(Debug, Clone, Copy)]
struct TraceContext {
    trace_id: u128,
    span_id: u64,
}

impl TraceContext {
    fn generate() -> Self {
        let mut rng = rand::thread_rng();
        Self {
            trace_id: rng.gen::<u128>(),
            span_id: rng.gen::<u64>(),
        }
    }

    fn trace_id_hex(&self) -> String {
        format!("{:032x}", self.trace_id)
    }

    fn span_id_hex(&self) -> String {
        format!("{:016x}", self.span_id)
    }
}

/// What happened to one message, for tests and structured logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    Success,
    Retrying { attempts: i32 },
    DeadLetter { attempts: i32 },
    Skipped,
    DecodeFailed,
    /// The handler ran to a result, but the finalizing transaction itself
    /// failed to begin, commit, or record that result. The entry is left
    /// unacked so `claim` recovers it once the store is healthy again.
    FinalizeError,
}

/// The idempotent worker pipeline: owns a store handle, a broker handle,
/// a handler registry, and the retry policy, and processes broker entries
/// to completion one at a time. A single-threaded cooperative loop per
/// process: parallelism is process-level via multiple consumer names in
/// the same group.
pub struct Worker {
    pool: PgPool,
    broker: Arc<dyn Broker>,
    config: BrokerConfig,
    retry_config: RetryConfig,
    admission_config: AdmissionConfig,
    handlers: HandlerRegistry,
    metrics: Arc<Metrics>,
}

impl Worker {
    pub fn new(
        pool: PgPool,
        broker: Arc<dyn Broker>,
        config: BrokerConfig,
        retry_config: RetryConfig,
        admission_config: AdmissionConfig,
        handlers: HandlerRegistry,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            pool,
            broker,
            config,
            retry_config,
            admission_config,
            handlers,
            metrics,
        }
    }

    /// Run the consume loop until `shutdown` is triggered. Each iteration
    /// reads up to `max` entries for this worker's consumer name, blocking
    /// `block_ms` for new data, then handles each in turn. The in-flight
    /// message is always drained to completion before the loop checks
    /// `shutdown` again, so an in-flight message always drains to
    /// completion before a shutdown signal takes effect.
    pub async fn run(&self, shutdown: CancellationToken) {
        if let Err(err) = self.broker.ensure_group(&self.config.stream, &self.config.group).await
        {
            tracing::error!(error = %err, "failed to ensure consumer group, worker exiting");
            return;
        }

        tracing::info!(
            stream = %self.config.stream,
            group = %self.config.group,
            consumer = %self.config.consumer,
            "worker started"
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let entries = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.broker.read_group(
                    &self.config.stream,
                    &self.config.group,
                    &self.config.consumer,
                    16,
                    self.config.block_ms,
                ) => match result {
                    Ok(entries) => entries,
                    Err(err) => {
                        tracing::warn!(error = %err, "broker read failed, backing off");
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        continue;
                    }
                },
            };

            for (entry_id, fields) in entries {
                let outcome = self.handle(&entry_id, &fields).await;
                tracing::debug!(entry_id = %entry_id, outcome = ?outcome, "message handled");
            }
        }

        tracing::info!(consumer = %self.config.consumer, "worker stopped");
    }

    /// Claim and process entries abandoned by a dead consumer. Call this
    /// periodically alongside `run`, or once at startup to recover from a
    /// prior crash of this same consumer name.
    pub async fn claim_and_process(&self, min_idle_ms: u64) -> usize {
        let claimed = match self
            .broker
            .claim(&self.config.stream, &self.config.group, &self.config.consumer, min_idle_ms)
            .await
        {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(error = %err, "claim failed");
                return 0;
            }
        };

        let count = claimed.len();
        for (entry_id, fields) in claimed {
            self.handle(&entry_id, &fields).await;
        }
        count
    }

    /// Process one stream entry end-to-end.
    ///
    /// `WorkerError` surfaces only for the decode and claim-transaction
    /// boundary: handler exceptions are caught exactly once, at the
    /// handler-invocation boundary below, not here. A `Decode` error still
    /// acks and drops; a `Store` or `Broker` error at the claim boundary is
    /// logged and the entry is left unacked, to be recovered later via
    /// `claim`.
    async fn handle(&self, entry_id: &str, fields: &Fields) -> MessageOutcome {
        let trace = TraceContext::generate();
        let span = tracing::info_span!(
            "task.handle",
            trace_id = %trace.trace_id_hex(),
            span_id = %trace.span_id_hex(),
            entry_id = %entry_id,
        );
        let _enter = span.enter();

        match self.try_claim(entry_id, fields).await {
            Ok(Some((envelope, payload))) => {
                self.metrics.attempts.inc();
                let timer = Timer::start();
                let result = self.dispatch_with_timeout(&envelope.name, payload.clone()).await;

                let (outcome, committed) = match result {
                    Ok(()) => {
                        let committed = self.finalize_success(envelope.task_id, &timer).await;
                        (MessageOutcome::Success, committed)
                    }
                    Err(err) => {
                        match self.finalize_failure(&envelope, &payload, &err.to_string()).await {
                            Some(outcome) => (outcome, true),
                            None => (MessageOutcome::FinalizeError, false),
                        }
                    }
                };

                if committed {
                    let _ = self.broker.ack(&self.config.stream, &self.config.group, entry_id).await;
                } else {
                    tracing::error!(
                        task_id = envelope.task_id,
                        "finalize transaction failed, leaving entry pending for claim recovery"
                    );
                }
                outcome
            }
            Ok(None) => MessageOutcome::Skipped,
            Err(WorkerError::Decode(err)) => {
                tracing::warn!(error = %err, "malformed envelope, acking and dropping");
                self.metrics.tasks_failure.inc();
                let _ = self.broker.ack(&self.config.stream, &self.config.group, entry_id).await;
                MessageOutcome::DecodeFailed
            }
            Err(err) => {
                tracing::error!(error = %err, "claim boundary failed, leaving entry pending for recovery");
                MessageOutcome::FinalizeError
            }
        }
    }

    /// Run the handler for `name`, bounded by the configured wall-clock
    /// timeout when one is set. A handler that overruns the budget is
    /// reported as `HandlerError::Timeout`, an ordinary execution failure
    /// subject to the same retry/DLQ policy as any other.
    async fn dispatch_with_timeout(
        &self,
        name: &str,
        payload: serde_json::Value,
    ) -> Result<(), crate::error::HandlerError> {
        let dispatch = self.handlers.dispatch(name, payload);
        match self.retry_config.handler_timeout() {
            Some(budget) => match tokio::time::timeout(budget, dispatch).await {
                Ok(result) => result,
                Err(_) => Err(crate::error::HandlerError::Timeout),
            },
            None => dispatch.await,
        }
    }

    /// Decode the envelope and transactionally claim the task. Returns
    /// `Ok(None)` for a duplicate delivery (skip), `Ok(Some(..))` when
    /// execution should proceed.
    async fn try_claim(
        &self,
        entry_id: &str,
        fields: &Fields,
    ) -> Result<Option<(TaskEnvelope, serde_json::Value)>, WorkerError> {
        let envelope = TaskEnvelope::from_fields(fields)?;
        let payload: serde_json::Value =
            serde_json::from_str(&envelope.payload).unwrap_or_else(|_| serde_json::json!({}));

        let mut tx = self.pool.begin().await.map_err(|e| WorkerError::Store(e.into()))?;
        let claimed = store::set_task_started(&mut tx, envelope.task_id, &envelope.execution_key).await?;

        if !claimed {
            tx.rollback().await.map_err(|e| WorkerError::Store(e.into()))?;
            tracing::info!(task_id = envelope.task_id, "duplicate delivery, skipping");
            self.metrics.tasks_skipped.inc();
            let _ = self.broker.ack(&self.config.stream, &self.config.group, entry_id).await;
            return Ok(None);
        }

        tx.commit().await.map_err(|e| WorkerError::Store(e.into()))?;
        Ok(Some((envelope, payload)))
    }

    /// Record a successful run. Returns whether the finalizing transaction
    /// actually committed; the caller must only ack the broker entry when
    /// this is `true`.
    async fn finalize_success(&self, task_id: i64, timer: &Timer) -> bool {
        let mut tx = match self.pool.begin().await {
            Ok(tx) => tx,
            Err(err) => {
                tracing::error!(error = %err, "failed to begin success-finalize transaction");
                return false;
            }
        };
        if let Err(err) = store::set_task_finished_success(&mut tx, task_id).await {
            tracing::error!(error = %err, "set_task_finished_success failed");
            let _ = tx.rollback().await;
            return false;
        }
        if let Err(err) = tx.commit().await {
            tracing::error!(error = %err, "failed to commit success-finalize transaction");
            return false;
        }
        self.metrics.tasks_success.inc();
        self.metrics.task_duration.observe(timer.elapsed_secs());
        true
    }

    /// Record a failed run and decide retry vs. dead-letter. Returns
    /// `None` when the finalizing transaction itself failed to begin,
    /// record the failure, or commit; the caller must leave the broker
    /// entry unacked in that case so `claim` recovers it later.
    async fn finalize_failure(
        &self,
        envelope: &TaskEnvelope,
        payload: &serde_json::Value,
        error: &str,
    ) -> Option<MessageOutcome> {
        self.metrics.tasks_failure.inc();

        let mut tx = match self.pool.begin().await {
            Ok(tx) => tx,
            Err(err) => {
                tracing::error!(error = %err, "failed to begin failure-finalize transaction");
                return None;
            }
        };

        let attempts = match store::set_task_finished_failure(&mut tx, envelope.task_id, error).await
        {
            Ok(attempts) => attempts,
            Err(err) => {
                tracing::error!(error = %err, "set_task_finished_failure failed");
                let _ = tx.rollback().await;
                return None;
            }
        };

        let decision = retry::decide(&self.retry_config, attempts as u32);

        match decision {
            RetryDecision::Retry { delay } => {
                let new_scheduled_at = chrono::Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or_default();
                let new_window_start = crate::admission::window_start(
                    new_scheduled_at,
                    self.admission_config.dedupe_window_ms,
                );

                if let Err(err) =
                    store::mark_task_retry(&mut tx, envelope.task_id, new_scheduled_at, new_window_start)
                        .await
                {
                    tracing::error!(error = %err, "mark_task_retry failed");
                    let _ = tx.rollback().await;
                    return None;
                }
                if let Err(err) = tx.commit().await {
                    tracing::error!(error = %err, "failed to commit retry transaction");
                    return None;
                }

                self.schedule_delayed_republish(envelope.task_id, delay);
                Some(MessageOutcome::Retrying { attempts })
            }
            RetryDecision::DeadLetter => {
                if let Err(err) = store::move_to_dead_letter(
                    &mut tx,
                    envelope.task_id,
                    &envelope.execution_key,
                    &envelope.name,
                    &payload.to_string(),
                    error,
                )
                .await
                {
                    tracing::error!(error = %err, "move_to_dead_letter failed");
                    let _ = tx.rollback().await;
                    return None;
                }

                let dlq_size = store::count_dead_letter(&mut tx).await.unwrap_or(0);

                if let Err(err) = tx.commit().await {
                    tracing::error!(error = %err, "failed to commit dead-letter transaction");
                    return None;
                }

                let dlq_envelope = DlqEnvelope {
                    task_id: envelope.task_id,
                    execution_key: envelope.execution_key.clone(),
                    name: envelope.name.clone(),
                    payload: payload.to_string(),
                    error: error.to_string(),
                    failed_at: chrono::Utc::now(),
                };
                if let Err(err) = self
                    .broker
                    .publish(&self.config.dlq_stream, dlq_envelope.to_fields(), 0)
                    .await
                {
                    tracing::error!(error = %err, "failed to publish DLQ envelope");
                }

                self.metrics.dlq_size.set(dlq_size as f64);
                Some(MessageOutcome::DeadLetter { attempts })
            }
        }
    }

    /// Sleep `delay`, then re-dispatch the outbox row on a detached task.
    /// Errors are logged, not propagated: the next `flush_due` tick will
    /// pick up any row this misses.
    fn schedule_delayed_republish(&self, task_id: i64, delay: Duration) {
        let pool = self.pool.clone();
        let broker = self.broker.clone();
        let stream = self.config.stream.clone();
        let max_len = self.config.max_len;

        tokio::spawn(async move {
            let jittered = jittered_delay(delay);
            tokio::time::sleep_until(Instant::now() + jittered).await;
            if let Err(err) = dispatcher::dispatch_task(&pool, &broker, &stream, max_len, task_id).await
            {
                tracing::warn!(task_id, error = %err, "delayed republish failed");
            }
        });
    }
}

/// Add up to ±10% jitter to a backoff delay. No jitter is required for
/// correctness; this narrows the thundering-herd window when many tasks
/// retry on the same schedule.
fn jittered_delay(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let factor = rng.gen_range(0.9..=1.1);
    Duration::from_secs_f64(delay.as_secs_f64() * factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_context_hex_widths_are_128_and_64_bit() {
        let ctx = TraceContext::generate();
        assert_eq!(ctx.trace_id_hex().len(), 32);
        assert_eq!(ctx.span_id_hex().len(), 16);
    }

    #[test]
    fn jittered_delay_stays_within_ten_percent() {
        let base = Duration::from_millis(1000);
        for _ in 0..50 {
            let jittered = jittered_delay(base);
            assert!(jittered.as_millis() >= 899 && jittered.as_millis() <= 1101);
        }
    }
}
