//! Error taxonomy: one leaf enum per component boundary. Nothing in this
//! crate returns a boxed catch-all; callers match on the variant to decide
//! ack/retry/skip behavior.

use broker::BrokerError;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("payload must be a JSON object, got {0}")]
    InvalidPayload(&'static str),
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("outbox row for task {0} not found")]
    MissingOutboxRow(i64),
}

/// Error surfaced by a task handler. `Failed` carries the source error that
/// is recorded verbatim on `Task.last_error` and the DLQ row.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("unknown task name: {0}")]
    UnknownTask(String),

    #[error("handler failed: {0}")]
    Failed(#[from] Box<dyn std::error::Error + Send + Sync>),

    #[error("handler timed out")]
    Timeout,
}

/// Errors the worker pipeline itself can raise outside of handler execution
/// (decode, claim, finalize). Every variant maps to one of: ack+drop, skip,
/// or propagate to retry/DLQ.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("malformed message envelope: {0}")]
    Decode(#[from] broker::EnvelopeDecodeError),
}
