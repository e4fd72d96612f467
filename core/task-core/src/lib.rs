//! # task-core
//!
//! Durable, idempotent task-execution core of a distributed task runner:
//! dedup/admission, a transactional outbox dispatcher, and an idempotent
//! worker pipeline with exponential-backoff retry and dead-lettering.
//!
//! ## Why This Crate Exists
//!
//! This is the hard-engineering center of the system: it guarantees
//! exactly-once *effective* execution across crashes, duplicate
//! submissions, and worker failures. Everything around it, the HTTP
//! submission surface, config loading at the process boundary, the
//! periodic scheduler tick, is thin glue layered on top of the functions
//! exposed here.
//!
//! ## Modules
//!
//! - [`admission`]: canonical payload hashing, dedupe-window bucketing,
//!   find-or-create submission.
//! - [`dispatcher`]: outbox polling and publication under row lock.
//! - [`worker`]: the consume/claim/execute/finalize pipeline.
//! - [`retry`]: backoff calculation and the retry-vs-dead-letter decision.
//! - [`handlers`]: the typed name-to-handler registry.
//! - [`store`]: relational persistence for tasks, outbox, inbox,
//!   dead-letter.
//! - [`metrics`]: the process-local counters/timers/gauges collector.
//! - [`config`]: environment-backed configuration structs.
//! - [`error`]: the per-boundary typed error taxonomy.

pub mod admission;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod retry;
pub mod store;
pub mod worker;

pub use admission::{submit, SubmitOutcome};
pub use dispatcher::{dispatch_task, flush_due, DispatchOutcome};
pub use handlers::HandlerRegistry;
pub use metrics::Metrics;
pub use store::Task;
pub use worker::{MessageOutcome, Worker};

/// Run the crate's sqlx migrations against `pool`. Each binary calls this
/// once at startup.
pub async fn run_migrations(pool: &sqlx::PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
