//! Dispatcher process entrypoint. Polls the outbox on a fixed tick and
//! publishes due rows to the broker's primary stream. The tick itself is
//! a thin periodic scheduler; `flush_due` does the actual work.

use task_core::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    task_runner::init_logging();
    let config = Config::from_env();

    let pool = task_runner::connect_and_migrate(&config).await?;
    let broker = task_runner::connect_broker(&config).await?;

    let tick = std::env::var("DISPATCHER_TICK_MS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(250u64);
    let batch_limit = std::env::var("DISPATCHER_BATCH_LIMIT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(100i64);

    tracing::info!(tick_ms = tick, batch_limit, "dispatcher started");

    let mut interval = tokio::time::interval(std::time::Duration::from_millis(tick));
    let mut shutdown = std::pin::pin!(wait_for_shutdown_signal());

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match task_core::flush_due(
                    &pool,
                    &broker,
                    &config.broker.stream,
                    config.broker.max_len,
                    batch_limit,
                )
                .await
                {
                    Ok(count) if count > 0 => tracing::info!(count, "flushed due outbox rows"),
                    Ok(_) => {}
                    Err(err) => tracing::warn!(error = %err, "flush_due failed"),
                }
            }
            _ = &mut shutdown => {
                tracing::info!("shutdown signal received");
                break;
            }
        }
    }

    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
