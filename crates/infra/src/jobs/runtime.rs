//! Job runtime context.
//!
//! Built once by the entry point and shared by reference: owns the
//! configuration, the broker connection, the dispatcher, the metrics and
//! the worker/recovery lifecycles.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::info;

use estatehub_ai::{AiJobsService, ReviewQueueService, VocalsService};
use estatehub_core::{Clock, SystemClock};

use super::broker::BrokerError;
use super::config::RuntimeConfig;
use super::connection::{ConnectionManager, Connector};
use super::dispatch::Dispatcher;
use super::failures::FailureRecorder;
use super::metrics::{MetricsSnapshot, QueueMetrics};
use super::processors::JobProcessors;
use super::recovery::{RecoveryLoop, RecoverySweeper};
use super::worker::{WorkerPool, WorkerPoolConfig};

/// Default idle wait of worker consumers.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    #[error("failed to start workers: {0}")]
    Broker(#[from] BrokerError),
}

/// Domain services driven by the job core.
#[derive(Clone)]
pub struct JobServices {
    pub ai: Arc<dyn AiJobsService>,
    pub vocals: Arc<dyn VocalsService>,
    pub review: Arc<dyn ReviewQueueService>,
}

pub struct JobRuntime {
    config: RuntimeConfig,
    connection: Arc<ConnectionManager>,
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<QueueMetrics>,
    processors: JobProcessors,
    failures: FailureRecorder,
    sweeper: Arc<RecoverySweeper>,
    poll_interval: Duration,
    workers: Mutex<Option<WorkerPool>>,
    recovery: Mutex<Option<RecoveryLoop>>,
}

impl core::fmt::Debug for JobRuntime {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobRuntime")
            .field("config", &self.config)
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

impl JobRuntime {
    pub fn new(config: RuntimeConfig, connector: Arc<dyn Connector>, services: JobServices) -> Self {
        Self::with_clock(config, connector, services, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: RuntimeConfig,
        connector: Arc<dyn Connector>,
        services: JobServices,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let connection = Arc::new(
            ConnectionManager::new(config.broker_url.clone(), connector)
                .with_connect_timeout(config.broker_timeout),
        );
        let dispatcher = Arc::new(Dispatcher::new(
            config.queue_enabled,
            config.default_job_options,
            connection.clone(),
        ));
        let failures = FailureRecorder::new(services.vocals.clone(), services.review.clone());
        let processors = JobProcessors::new(services.ai, services.vocals.clone(), clock.clone());
        let sweeper = Arc::new(RecoverySweeper::new(
            services.vocals,
            failures.clone(),
            dispatcher.clone(),
            clock,
            config.recovery,
        ));

        Self {
            config,
            connection,
            dispatcher,
            metrics: Arc::new(QueueMetrics::new()),
            processors,
            failures,
            sweeper,
            poll_interval: DEFAULT_POLL_INTERVAL,
            workers: Mutex::new(None),
            recovery: Mutex::new(None),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn recovery_sweeper(&self) -> &Arc<RecoverySweeper> {
        &self.sweeper
    }

    /// Start the worker pool; a no-op when it is already running.
    pub async fn start_workers(&self) -> Result<(), RuntimeError> {
        let mut slot = self.workers.lock().await;
        if slot.is_some() {
            return Ok(());
        }

        let broker = self.connection.get_connection().await?;
        let config = WorkerPoolConfig::default()
            .with_concurrency(self.config.worker_concurrency)
            .with_poll_interval(self.poll_interval)
            .with_job_options(self.config.default_job_options)
            .with_lock_ttl(self.config.lock_ttl);
        *slot = Some(WorkerPool::start(
            config,
            broker,
            self.processors.clone(),
            self.metrics.clone(),
            self.failures.clone(),
        ));
        Ok(())
    }

    pub async fn workers_running(&self) -> bool {
        self.workers.lock().await.is_some()
    }

    /// Stop the worker pool (if any) and close the broker connection.
    pub async fn stop_workers(&self) {
        let pool = self.workers.lock().await.take();
        if let Some(pool) = pool {
            pool.shutdown().await;
        }
        self.connection.close_connection().await;
    }

    /// Start the recovery loop; returns false when it was already running.
    pub async fn start_recovery_loop(&self) -> bool {
        let mut slot = self.recovery.lock().await;
        if slot.is_some() {
            return false;
        }
        *slot = Some(RecoveryLoop::start(self.sweeper.clone()));
        true
    }

    pub async fn stop_recovery_loop(&self) {
        let recovery = self.recovery.lock().await.take();
        if let Some(recovery) = recovery {
            recovery.stop().await;
        }
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn reset_metrics(&self) {
        self.metrics.reset();
    }

    /// Stop recovery first so no pass enqueues into a closing connection.
    pub async fn shutdown(&self) {
        self.stop_recovery_loop().await;
        self.stop_workers().await;
        info!("job runtime stopped");
    }
}
