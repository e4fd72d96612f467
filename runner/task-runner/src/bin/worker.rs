//! Worker process entrypoint. Runs one `Worker::run` consume loop under
//! this process's `WORKER_NAME` consumer identity; parallelism comes from
//! running more of these processes, not from concurrency inside one.

use std::sync::Arc;

use task_core::config::Config;
use task_core::handlers::HandlerRegistry;
use task_core::metrics::Metrics;
use task_core::worker::Worker;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    task_runner::init_logging();
    let config = Config::from_env();

    let pool = task_runner::connect_and_migrate(&config).await?;
    let broker = task_runner::connect_broker(&config).await?;
    let metrics = Arc::new(Metrics::new());
    let handlers = HandlerRegistry::with_reference_handlers();

    let worker = Arc::new(Worker::new(
        pool,
        broker,
        config.broker.clone(),
        config.retry.clone(),
        config.admission.clone(),
        handlers,
        metrics.clone(),
    ));

    let shutdown = CancellationToken::new();

    // Recover any entries this consumer name left pending from a prior
    // crash before joining the steady-state read loop.
    let recovered = worker.claim_and_process(30_000).await;
    if recovered > 0 {
        tracing::info!(recovered, "recovered pending entries from a prior run");
    }

    let run_handle = {
        let worker = worker.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { worker.run(shutdown).await })
    };

    let metrics_handle = spawn_metrics_server(metrics.clone());

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received, draining in-flight message");
    shutdown.cancel();

    let _ = run_handle.await;
    metrics_handle.abort();

    Ok(())
}

/// Bind a tiny HTTP server exposing `/metrics` in Prometheus text format,
/// the mount point an external observability scraper polls.
fn spawn_metrics_server(metrics: Arc<Metrics>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = axum::Router::new().route(
            "/metrics",
            axum::routing::get(move || {
                let metrics = metrics.clone();
                async move { metrics.render() }
            }),
        );

        let port: u16 = std::env::var("METRICS_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(9090);
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));

        match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => {
                tracing::info!(%addr, "metrics endpoint listening");
                if let Err(err) = axum::serve(listener, app).await {
                    tracing::error!(error = %err, "metrics server exited");
                }
            }
            Err(err) => tracing::error!(error = %err, "failed to bind metrics endpoint"),
        }
    })
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
