//! Dedup/admission: derives the canonical payload hash and dedupe-window
//! candidates, then finds-or-creates the logical Task row.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::PgPool;

use crate::config::AdmissionConfig;
use crate::error::AdmissionError;
use crate::store::{self, Task};

/// Result of [`submit`]: the resolved task and `deduped = !created`.
#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub task: Task,
    pub deduped: bool,
}

/// Canonicalize `payload` (recursively sort object keys, compact
/// separators) and hash it with SHA-256, hex-encoded. Stable across
/// equivalent objects regardless of source key order.
pub fn payload_hash(payload: &Value) -> String {
    let canonical = canonicalize(payload);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// Re-serialize a `serde_json::Value` with object keys sorted and no
/// incidental whitespace. `serde_json::Value::Object` is already backed by
/// a `BTreeMap` in this crate's default feature set, so `to_string` already
/// sorts keys; this function exists to make that guarantee explicit and
/// independent of `serde_json`'s `preserve_order` feature ever being
/// enabled transitively.
fn canonicalize(value: &Value) -> String {
    fn sort(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut sorted: std::collections::BTreeMap<String, Value> =
                    std::collections::BTreeMap::new();
                for (k, v) in map {
                    sorted.insert(k.clone(), sort(v));
                }
                Value::Object(sorted.into_iter().collect())
            }
            Value::Array(items) => Value::Array(items.iter().map(sort).collect()),
            other => other.clone(),
        }
    }
    sort(value).to_string()
}

/// Align `instant` to the start of its `window_ms`-wide bucket.
pub fn window_start(instant: DateTime<Utc>, window_ms: i64) -> DateTime<Utc> {
    let epoch_ms = instant.timestamp_millis();
    let bucket = epoch_ms.div_euclid(window_ms) * window_ms;
    Utc.timestamp_millis_opt(bucket).single().unwrap_or(instant)
}

/// Up to three candidate window starts for `instant`: primary (no skew),
/// `+skew_ms`, `-skew_ms`, deduplicated with the primary first.
pub fn window_candidates(
    instant: DateTime<Utc>,
    window_ms: i64,
    skew_ms: i64,
) -> Vec<DateTime<Utc>> {
    let primary = window_start(instant, window_ms);
    let mut candidates = vec![primary];

    let plus = window_start(instant + chrono::Duration::milliseconds(skew_ms), window_ms);
    if !candidates.contains(&plus) {
        candidates.push(plus);
    }
    let minus = window_start(instant - chrono::Duration::milliseconds(skew_ms), window_ms);
    if !candidates.contains(&minus) {
        candidates.push(minus);
    }

    candidates
}

/// Build the globally-unique execution key for `(name, payload_hash,
/// window_start)`.
pub fn execution_key(name: &str, payload_hash: &str, window_start: DateTime<Utc>) -> String {
    format!("{name}:{payload_hash}:{}", window_start.timestamp_millis())
}

/// Find-or-create a Task for `(name, payload)`, scheduled at `scheduled_at`
/// (defaulting to now when absent, so callers that never pass a schedule
/// and callers that need one go through the same entrypoint). Runs in one
/// transaction; a
/// unique-constraint violation on `execution_key` means a concurrent
/// submitter won the race, in which case this function retries the lookup
/// once rather than surfacing the conflict.
pub async fn submit(
    pool: &PgPool,
    config: &AdmissionConfig,
    stream: &str,
    name: &str,
    payload: Value,
    scheduled_at: Option<DateTime<Utc>>,
) -> Result<SubmitOutcome, AdmissionError> {
    if !payload.is_object() {
        return Err(AdmissionError::InvalidPayload(value_kind(&payload)));
    }

    let scheduled_at = scheduled_at.unwrap_or_else(Utc::now);
    let hash = payload_hash(&payload);
    let candidates = window_candidates(scheduled_at, config.dedupe_window_ms, config.clock_skew_ms);
    let primary_window = candidates[0];
    let key = execution_key(name, &hash, primary_window);

    let mut tx = pool.begin().await.map_err(|e| AdmissionError::Store(e.into()))?;

    if let Some(existing) =
        store::find_task_by_candidates(&mut tx, name, &hash, &candidates).await?
    {
        tx.commit().await.map_err(|e| AdmissionError::Store(e.into()))?;
        return Ok(SubmitOutcome {
            task: existing,
            deduped: true,
        });
    }

    let insert = store::insert_task_with_outbox(
        &mut tx,
        name,
        &payload,
        &hash,
        scheduled_at,
        primary_window,
        &key,
        stream,
    )
    .await;

    match insert {
        Ok(task) => {
            tx.commit().await.map_err(|e| AdmissionError::Store(e.into()))?;
            Ok(SubmitOutcome {
                task,
                deduped: false,
            })
        }
        Err(err) if is_unique_violation(&err) => {
            // Lost the race: another submitter committed the same
            // execution_key between our lookup and our insert. Roll back
            // and re-read under a fresh transaction.
            drop(tx);
            let mut retry_tx =
                pool.begin().await.map_err(|e| AdmissionError::Store(e.into()))?;
            let existing =
                store::find_task_by_candidates(&mut retry_tx, name, &hash, &candidates).await?;
            retry_tx
                .commit()
                .await
                .map_err(|e| AdmissionError::Store(e.into()))?;
            match existing {
                Some(task) => Ok(SubmitOutcome {
                    task,
                    deduped: true,
                }),
                None => Err(AdmissionError::Store(err)),
            }
        }
        Err(err) => Err(AdmissionError::Store(err)),
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn is_unique_violation(err: &crate::error::StoreError) -> bool {
    match err {
        crate::error::StoreError::Database(sqlx::Error::Database(db_err)) => {
            db_err.is_unique_violation()
        }
        _ => false,
    }
}
