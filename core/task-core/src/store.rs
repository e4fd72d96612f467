//! Relational persistence for tasks, outbox, inbox, and dead-letter rows.
//! This is the single unit of atomicity: every mutating operation here runs
//! inside a caller-supplied transaction so admission, dispatch, and worker
//! finalization each commit-or-rollback as one step.
//!
//! Query shapes (`FOR UPDATE SKIP LOCKED`, `UPDATE ... RETURNING`) follow
//! common outbox-polling patterns for the same row-lock coordination
//! problem.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{FromRow, Postgres, Transaction};

use crate::error::StoreError;

pub type Tx<'a> = Transaction<'a, Postgres>;

#[derive(Debug, Clone, FromRow)]
pub struct Task {
    pub id: i64,
    pub name: String,
    pub payload: Value,
    pub payload_hash: String,
    pub status: String,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub scheduled_window_start: DateTime<Utc>,
    pub execution_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow)]
pub struct OutboxEntry {
    pub task_id: i64,
    pub stream: String,
    pub execution_key: String,
    pub payload: String,
    pub available_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub stream_id: Option<String>,
    pub delivery_attempts: i32,
}

#[derive(Debug, Clone, FromRow)]
pub struct InboxEntry {
    pub task_id: i64,
    pub execution_key: String,
    pub attempts: i32,
    pub last_seen_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Find a Task row whose `(name, payload_hash, scheduled_window_start)`
/// matches one of `window_candidates`, primary window first.
pub async fn find_task_by_candidates(
    tx: &mut Tx<'_>,
    name: &str,
    payload_hash: &str,
    window_candidates: &[DateTime<Utc>],
) -> Result<Option<Task>, StoreError> {
    for window_start in window_candidates {
        let found = sqlx::query_as::<_, Task>(
            r#"
            SELECT * FROM tasks
            WHERE name = $1 AND payload_hash = $2 AND scheduled_window_start = $3
            "#,
        )
        .bind(name)
        .bind(payload_hash)
        .bind(window_start)
        .fetch_optional(&mut **tx)
        .await?;

        if let Some(task) = found {
            return Ok(Some(task));
        }
    }
    Ok(None)
}

/// Insert a new Task plus its Outbox row in the caller's transaction.
pub async fn insert_task_with_outbox(
    tx: &mut Tx<'_>,
    name: &str,
    payload: &Value,
    payload_hash: &str,
    scheduled_at: DateTime<Utc>,
    scheduled_window_start: DateTime<Utc>,
    execution_key: &str,
    stream: &str,
) -> Result<Task, StoreError> {
    let task = sqlx::query_as::<_, Task>(
        r#"
        INSERT INTO tasks
            (name, payload, payload_hash, status, attempts, scheduled_at,
             scheduled_window_start, execution_key)
        VALUES ($1, $2, $3, 'queued', 0, $4, $5, $6)
        RETURNING *
        "#,
    )
    .bind(name)
    .bind(payload)
    .bind(payload_hash)
    .bind(scheduled_at)
    .bind(scheduled_window_start)
    .bind(execution_key)
    .fetch_one(&mut **tx)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO task_outbox
            (task_id, stream, execution_key, payload, available_at, delivery_attempts)
        VALUES ($1, $2, $3, $4, $5, 0)
        "#,
    )
    .bind(task.id)
    .bind(stream)
    .bind(execution_key)
    .bind(payload.to_string())
    .bind(scheduled_at)
    .execute(&mut **tx)
    .await?;

    Ok(task)
}

/// Lock the `(outbox, task)` pair for `task_id` under `FOR UPDATE`. Used by
/// `dispatch_task`, which holds this lock across the broker publish call.
pub async fn lock_outbox_for_dispatch(
    tx: &mut Tx<'_>,
    task_id: i64,
) -> Result<Option<(OutboxEntry, Task)>, StoreError> {
    let outbox = sqlx::query_as::<_, OutboxEntry>(
        r#"SELECT * FROM task_outbox WHERE task_id = $1 FOR UPDATE"#,
    )
    .bind(task_id)
    .fetch_optional(&mut **tx)
    .await?;

    let Some(outbox) = outbox else {
        return Ok(None);
    };

    let task = sqlx::query_as::<_, Task>(r#"SELECT * FROM tasks WHERE id = $1"#)
        .bind(task_id)
        .fetch_one(&mut **tx)
        .await?;

    Ok(Some((outbox, task)))
}

/// Select up to `limit` not-yet-sent outbox rows, skipping rows already
/// locked by another dispatcher.
pub async fn select_due_outbox_task_ids(
    tx: &mut Tx<'_>,
    limit: i64,
) -> Result<Vec<i64>, StoreError> {
    let rows: Vec<(i64,)> = sqlx::query_as(
        r#"
        SELECT task_id FROM task_outbox
        WHERE sent_at IS NULL AND available_at <= now()
        ORDER BY available_at
        LIMIT $1
        FOR UPDATE SKIP LOCKED
        "#,
    )
    .bind(limit)
    .fetch_all(&mut **tx)
    .await?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Record a successful publish.
pub async fn mark_dispatched(
    tx: &mut Tx<'_>,
    task_id: i64,
    stream_id: &str,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE task_outbox
        SET sent_at = now(), stream_id = $2, delivery_attempts = delivery_attempts + 1
        WHERE task_id = $1
        "#,
    )
    .bind(task_id)
    .bind(stream_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Transactionally claim a task for execution. Returns `true` if the
/// claim succeeded (caller should proceed), `false`
/// if this is a duplicate delivery that must be skipped.
pub async fn set_task_started(
    tx: &mut Tx<'_>,
    task_id: i64,
    execution_key: &str,
) -> Result<bool, StoreError> {
    let task = sqlx::query_as::<_, Task>(r#"SELECT * FROM tasks WHERE id = $1 FOR UPDATE"#)
        .bind(task_id)
        .fetch_optional(&mut **tx)
        .await?;

    let Some(task) = task else {
        return Ok(false);
    };
    if task.execution_key != execution_key {
        return Ok(false);
    }

    let already_processed: Option<(Option<DateTime<Utc>>,)> = sqlx::query_as(
        r#"SELECT processed_at FROM task_inbox WHERE task_id = $1 FOR UPDATE"#,
    )
    .bind(task_id)
    .fetch_optional(&mut **tx)
    .await?;

    if let Some((Some(_),)) = already_processed {
        return Ok(false);
    }

    sqlx::query(
        r#"
        UPDATE tasks
        SET status = 'running', started_at = now(), attempts = attempts + 1, updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(task_id)
    .execute(&mut **tx)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO task_inbox (task_id, execution_key, attempts, last_seen_at, processed_at)
        VALUES ($1, $2, 1, now(), NULL)
        ON CONFLICT (task_id) DO UPDATE
        SET attempts = task_inbox.attempts + 1, last_seen_at = now()
        "#,
    )
    .bind(task_id)
    .bind(execution_key)
    .execute(&mut **tx)
    .await?;

    Ok(true)
}

/// Finalize a successful run.
pub async fn set_task_finished_success(tx: &mut Tx<'_>, task_id: i64) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE tasks
        SET status = 'done', finished_at = now(), last_error = NULL, updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(task_id)
    .execute(&mut **tx)
    .await?;

    sqlx::query(r#"UPDATE task_inbox SET processed_at = now() WHERE task_id = $1"#)
        .bind(task_id)
        .execute(&mut **tx)
        .await?;

    Ok(())
}

/// Record a failed run and return the post-increment `attempts` count used
/// to decide retry vs. dead-letter.
pub async fn set_task_finished_failure(
    tx: &mut Tx<'_>,
    task_id: i64,
    error: &str,
) -> Result<i32, StoreError> {
    let (attempts,): (i32,) = sqlx::query_as(
        r#"
        UPDATE tasks
        SET status = 'failed', last_error = $2, updated_at = now()
        WHERE id = $1
        RETURNING attempts
        "#,
    )
    .bind(task_id)
    .bind(error)
    .fetch_one(&mut **tx)
    .await?;

    Ok(attempts)
}

/// Reschedule for retry: clears the outbox send markers, advances
/// `available_at`, and recomputes the task's window. `execution_key` is
/// left unchanged, so a late duplicate submission still finds this task.
pub async fn mark_task_retry(
    tx: &mut Tx<'_>,
    task_id: i64,
    new_scheduled_at: DateTime<Utc>,
    new_window_start: DateTime<Utc>,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE tasks
        SET status = 'retrying', scheduled_at = $2, scheduled_window_start = $3, updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(task_id)
    .bind(new_scheduled_at)
    .bind(new_window_start)
    .execute(&mut **tx)
    .await?;

    sqlx::query(
        r#"
        UPDATE task_outbox
        SET sent_at = NULL, stream_id = NULL, available_at = $2
        WHERE task_id = $1
        "#,
    )
    .bind(task_id)
    .bind(new_scheduled_at)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// Terminal transition to the dead-letter queue.
pub async fn move_to_dead_letter(
    tx: &mut Tx<'_>,
    task_id: i64,
    execution_key: &str,
    name: &str,
    payload: &str,
    error: &str,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"UPDATE tasks SET status = 'dead_letter', updated_at = now() WHERE id = $1"#,
    )
    .bind(task_id)
    .execute(&mut **tx)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO task_dead_letter (task_id, execution_key, name, payload, error)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (task_id, execution_key) DO NOTHING
        "#,
    )
    .bind(task_id)
    .bind(execution_key)
    .bind(name)
    .bind(payload)
    .bind(error)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// Count of dead-letter rows, surfaced as the `dlq_size` gauge.
pub async fn count_dead_letter(tx: &mut Tx<'_>) -> Result<i64, StoreError> {
    let (count,): (i64,) = sqlx::query_as(r#"SELECT count(*) FROM task_dead_letter"#)
        .fetch_one(&mut **tx)
        .await?;
    Ok(count)
}
