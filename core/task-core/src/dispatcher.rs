//! Transactional outbox dispatcher: reads due outbox rows under a row lock
//! and publishes them to the broker, so persistence and publication never
//! diverge across a crash.

use std::sync::Arc;

use broker::{Broker, TaskEnvelope};
use sqlx::PgPool;

use crate::error::DispatchError;
use crate::store;

/// Outcome of [`dispatch_task`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Published just now; carries the broker-assigned entry id.
    Published(String),
    /// Already published on a prior call; same entry id returned
    /// (publish is idempotent).
    AlreadyPublished(String),
    /// `available_at` is still in the future.
    NotYetDue,
}

/// Publish the outbox row for `task_id`, if due and not already sent. Holds
/// a `FOR UPDATE` lock on the outbox/task pair for the duration of the
/// broker publish call so a concurrent dispatcher cannot double-publish the
/// same row.
pub async fn dispatch_task(
    pool: &PgPool,
    broker: &Arc<dyn Broker>,
    stream: &str,
    max_len: u64,
    task_id: i64,
) -> Result<DispatchOutcome, DispatchError> {
    let mut tx = pool.begin().await.map_err(|e| DispatchError::Store(e.into()))?;

    let Some((outbox, task)) = store::lock_outbox_for_dispatch(&mut tx, task_id).await? else {
        return Err(DispatchError::MissingOutboxRow(task_id));
    };

    if let Some(stream_id) = outbox.stream_id.clone() {
        tx.commit().await.map_err(|e| DispatchError::Store(e.into()))?;
        return Ok(DispatchOutcome::AlreadyPublished(stream_id));
    }

    if outbox.available_at > chrono::Utc::now() {
        tx.commit().await.map_err(|e| DispatchError::Store(e.into()))?;
        return Ok(DispatchOutcome::NotYetDue);
    }

    let envelope = TaskEnvelope {
        task_id: task.id,
        name: task.name.clone(),
        payload: outbox.payload.clone(),
        execution_key: task.execution_key.clone(),
        scheduled_at: task.scheduled_at,
        attempt: (task.attempts + 1) as u32,
    };

    let stream_id = broker
        .publish(stream, envelope.to_fields(), max_len)
        .await?;

    store::mark_dispatched(&mut tx, task_id, &stream_id).await?;
    tx.commit().await.map_err(|e| DispatchError::Store(e.into()))?;

    Ok(DispatchOutcome::Published(stream_id))
}

/// Drain up to `limit` due outbox rows, publishing each. Returns the number
/// of rows successfully published.
///
/// Best-effort termination: stopping once a pass yields fewer than `limit`
/// task ids assumes the underlying `SELECT ... FOR
/// UPDATE SKIP LOCKED` query makes monotonic progress; under heavy
/// contention with many not-yet-due rows it may return before every due row
/// has been published. Callers relying on exhaustive flushing should call
/// this repeatedly (e.g. on every scheduler tick) rather than once.
pub async fn flush_due(
    pool: &PgPool,
    broker: &Arc<dyn Broker>,
    stream: &str,
    max_len: u64,
    limit: i64,
) -> Result<usize, DispatchError> {
    let mut published = 0;

    loop {
        let mut tx = pool.begin().await.map_err(|e| DispatchError::Store(e.into()))?;
        let task_ids = store::select_due_outbox_task_ids(&mut tx, limit).await?;
        tx.commit().await.map_err(|e| DispatchError::Store(e.into()))?;

        let batch_len = task_ids.len();
        for task_id in task_ids {
            match dispatch_task(pool, broker, stream, max_len, task_id).await {
                Ok(DispatchOutcome::Published(_)) => published += 1,
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(task_id, error = %err, "dispatch_task failed during flush_due");
                }
            }
        }

        if batch_len < limit as usize {
            break;
        }
    }

    Ok(published)
}
