//! Worker process: job runtime wiring and the queue metrics endpoint.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::Extension,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use tower::ServiceBuilder;
use tracing::{info, warn};

use estatehub_ai::{InMemoryAiJobsService, InMemoryReviewQueue, InMemoryVocalsService};
use estatehub_infra::jobs::{JobRuntime, JobServices, MetricsSnapshot};

pub const ENV_METRICS_ADDR: &str = "WORKER_METRICS_ADDR";
pub const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:9464";

/// Worker process settings beyond the job runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    /// Address of the metrics endpoint; `None` disables it.
    pub metrics_addr: Option<SocketAddr>,
}

impl WorkerSettings {
    pub fn from_env() -> Self {
        Self::resolve(std::env::var(ENV_METRICS_ADDR).ok().as_deref())
    }

    /// Empty disables the endpoint; unparsable values fall back to the
    /// default address.
    pub fn resolve(metrics_addr: Option<&str>) -> Self {
        let default = || DEFAULT_METRICS_ADDR.parse::<SocketAddr>().ok();
        let metrics_addr = match metrics_addr.map(str::trim) {
            None => default(),
            Some("") => None,
            Some(raw) => raw.parse::<SocketAddr>().ok().or_else(|| {
                warn!(var = ENV_METRICS_ADDR, value = raw, "invalid metrics address; using default");
                default()
            }),
        };
        Self { metrics_addr }
    }
}

/// In-process domain services for running the worker without a
/// persistence backend.
pub fn in_memory_services() -> JobServices {
    JobServices {
        ai: Arc::new(InMemoryAiJobsService::new()),
        vocals: Arc::new(InMemoryVocalsService::new()),
        review: Arc::new(InMemoryReviewQueue::new()),
    }
}

/// Build the metrics router.
pub fn build_app(runtime: Arc<JobRuntime>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics/queues", get(queue_metrics))
        .route("/metrics/queues/reset", post(reset_queue_metrics))
        .layer(ServiceBuilder::new().layer(Extension(runtime)))
}

pub async fn health() -> StatusCode {
    StatusCode::OK
}

pub async fn queue_metrics(Extension(runtime): Extension<Arc<JobRuntime>>) -> Json<MetricsSnapshot> {
    Json(runtime.metrics_snapshot())
}

pub async fn reset_queue_metrics(Extension(runtime): Extension<Arc<JobRuntime>>) -> StatusCode {
    runtime.reset_metrics();
    StatusCode::NO_CONTENT
}

/// Resolves on Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
