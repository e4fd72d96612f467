//! Shared process-startup glue for the `task-runner` binaries: logging
//! setup, database connection, and broker construction. Kept out of
//! `task-core`: logging *setup* and the scheduler tick are thin glue
//! around the core, not the core itself.

use std::sync::Arc;

use broker::{Broker, RedisBroker};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use task_core::config::Config;

/// Initialize `tracing-subscriber` from `RUST_LOG` (default `info`).
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

/// Connect to Postgres and run the crate's migrations.
pub async fn connect_and_migrate(config: &Config) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(std::time::Duration::from_secs(10))
        .connect(&config.database_url)
        .await?;

    task_core::run_migrations(&pool).await?;
    Ok(pool)
}

/// Connect to Redis and return a broker handle, with both primary and DLQ
/// consumer groups ensured to exist.
pub async fn connect_broker(config: &Config) -> anyhow::Result<Arc<dyn Broker>> {
    let broker = RedisBroker::connect(&config.broker.redis_url).await?;
    broker.ensure_group(&config.broker.stream, &config.broker.group).await?;
    Ok(Arc::new(broker))
}
