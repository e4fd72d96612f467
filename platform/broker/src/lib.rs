//! # Broker Abstraction
//!
//! A platform-level abstraction over a Redis-Streams-shaped append-only log
//! with consumer groups, pending-entry tracking, and claim-on-timeout
//! recovery.
//!
//! ## Why This Lives in Tier 1
//!
//! The broker is a **shared runtime capability**: the dispatcher publishes
//! through it, the worker consumes through it, and both need the same
//! durability guarantees (at-least-once delivery, idempotent ack,
//! claim-based recovery from dead consumers) regardless of which task-core
//! component is driving it.
//!
//! ## Implementations
//!
//! - **RedisBroker**: production implementation backed by Redis Streams
//!   (XADD / XGROUP / XREADGROUP / XACK / XCLAIM / XPENDING).
//! - **InMemoryBroker**: single-process double for tests that still
//!   exercises consumer-group and claim semantics, so the worker pipeline
//!   can be tested without a live Redis server.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use broker::{Broker, InMemoryBroker};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
//! broker.ensure_group("trx.tasks", "trx.workers").await?;
//!
//! let fields = vec![("task_id".to_string(), "1".to_string())];
//! broker.publish("trx.tasks", fields, 10_000).await?;
//!
//! let entries = broker
//!     .read_group("trx.tasks", "trx.workers", "worker-1", 10, 100)
//!     .await?;
//! for (entry_id, _fields) in entries {
//!     broker.ack("trx.tasks", "trx.workers", &entry_id).await?;
//! }
//! # Ok(())
//! # }
//! ```

mod envelope;
mod inmemory_broker;
mod redis_broker;

pub use envelope::{DlqEnvelope, EnvelopeDecodeError, TaskEnvelope};
pub use inmemory_broker::InMemoryBroker;
pub use redis_broker::RedisBroker;

use async_trait::async_trait;
use std::fmt;

/// Fields carried by a single stream entry, in insertion order.
pub type Fields = Vec<(String, String)>;

/// A stream entry as returned by a read/claim operation.
pub type StreamEntry = (String, Fields);

/// Errors that can occur when using the broker.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("failed to publish entry: {0}")]
    Publish(String),

    #[error("failed to read from stream: {0}")]
    Read(String),

    #[error("failed to acknowledge entry: {0}")]
    Ack(String),

    #[error("failed to claim pending entries: {0}")]
    Claim(String),

    #[error("failed to ensure consumer group: {0}")]
    GroupSetup(String),

    #[error("connection error: {0}")]
    Connection(String),
}

/// Result type for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Core broker abstraction: an append-only stream with consumer-group
/// semantics.
///
/// This trait defines the interface both the dispatcher (publisher) and the
/// worker (consumer) are written against. Every method maps directly onto a
/// Redis Streams command.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Append `fields` to `stream`, returning the broker-assigned monotone
    /// entry id. `max_len` bounds the stream's approximate retention.
    async fn publish(&self, stream: &str, fields: Fields, max_len: u64) -> BrokerResult<String>;

    /// Idempotently create `group` on `stream`, starting from the stream
    /// tail. Creating a group that already exists is not an error.
    async fn ensure_group(&self, stream: &str, group: &str) -> BrokerResult<()>;

    /// Read up to `max` new entries for `consumer` within `group`, blocking
    /// up to `block_ms` for new data. Entries remain pending until acked.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        max: usize,
        block_ms: u64,
    ) -> BrokerResult<Vec<StreamEntry>>;

    /// Remove `entry_id` from `group`'s pending list. Idempotent: acking an
    /// already-acked or unknown entry is not an error.
    async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> BrokerResult<()>;

    /// Reassign entries in `group` that have been pending longer than
    /// `min_idle_ms` to `consumer`, returning the claimed entries. This is
    /// how a replacement worker recovers work left in-flight by a crashed
    /// one.
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
    ) -> BrokerResult<Vec<StreamEntry>>;

    /// Inspect the pending-entries list for `group` (entry id plus
    /// milliseconds since last delivery), for diagnostics and tests.
    async fn pending_range(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> BrokerResult<Vec<(String, u64)>>;
}

impl fmt::Debug for dyn Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Broker")
    }
}
