use std::sync::Arc;

use anyhow::Context;

use estatehub_infra::jobs::{JobRuntime, RedisConnector, RuntimeConfig};
use estatehub_worker::{build_app, in_memory_services, shutdown_signal, WorkerSettings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    estatehub_observability::init();

    let config = RuntimeConfig::from_env();
    let settings = WorkerSettings::from_env();
    tracing::info!(
        broker_url = %config.broker_url,
        queue_enabled = config.queue_enabled,
        concurrency = config.worker_concurrency,
        "starting worker"
    );

    tracing::warn!("no persistence backend configured; using in-memory domain services");
    let connector = RedisConnector::new().with_timeout(config.broker_timeout);
    let runtime = Arc::new(JobRuntime::new(
        config,
        Arc::new(connector),
        in_memory_services(),
    ));

    runtime
        .start_workers()
        .await
        .context("broker unreachable at startup")?;
    runtime.start_recovery_loop().await;

    let (stop_tx, mut stop_rx) = tokio::sync::watch::channel(false);
    let server = match settings.metrics_addr {
        Some(addr) => {
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind {addr}"))?;
            tracing::info!("metrics listening on {}", listener.local_addr()?);

            let app = build_app(runtime.clone());
            Some(tokio::spawn(async move {
                let stopped = async move {
                    let _ = stop_rx.changed().await;
                };
                if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(stopped).await {
                    tracing::error!(error = %e, "metrics server failed");
                }
            }))
        }
        None => None,
    };

    shutdown_signal().await;

    let _ = stop_tx.send(true);
    runtime.shutdown().await;
    if let Some(server) = server {
        let _ = server.await;
    }
    Ok(())
}
