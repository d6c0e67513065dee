//! Worker pool: one named worker per job kind, each running `concurrency`
//! consumer tasks against the shared broker connection.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use super::broker::{Broker, Delivery};
use super::config::DEFAULT_LOCK_TTL_MS;
use super::failures::{FailureRecorder, MAX_REVIEW_ERROR_CHARS, truncate_chars};
use super::metrics::QueueMetrics;
use super::processors::JobProcessors;
use super::types::{JobKind, JobOptions};

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Consumer tasks per job kind.
    pub concurrency: usize,
    /// Idle wait between empty polls, and after a broker error.
    pub poll_interval: Duration,
    /// Retry/retention policy applied when settling deliveries.
    pub job_options: JobOptions,
    /// Lock taken on each reserved job; an unsettled job is redelivered
    /// once it expires.
    pub lock_ttl: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            poll_interval: Duration::from_millis(250),
            job_options: JobOptions::default(),
            lock_ttl: Duration::from_millis(DEFAULT_LOCK_TTL_MS),
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_job_options(mut self, options: JobOptions) -> Self {
        self.job_options = options;
        self
    }

    pub fn with_lock_ttl(mut self, lock_ttl: Duration) -> Self {
        self.lock_ttl = lock_ttl;
        self
    }
}

struct WorkerContext {
    broker: Arc<dyn Broker>,
    processors: JobProcessors,
    metrics: Arc<QueueMetrics>,
    failures: FailureRecorder,
    options: JobOptions,
    lock_ttl: Duration,
    poll_interval: Duration,
    /// Failure-persistence tasks still running; drained at shutdown.
    background: Mutex<JoinSet<()>>,
}

/// Handle to a running worker pool.
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    consumers: Vec<(String, JoinHandle<()>)>,
    ctx: Arc<WorkerContext>,
}

impl core::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("consumers", &self.consumers.len())
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// Spawn the consumers. Must be called from within a tokio runtime.
    pub fn start(
        config: WorkerPoolConfig,
        broker: Arc<dyn Broker>,
        processors: JobProcessors,
        metrics: Arc<QueueMetrics>,
        failures: FailureRecorder,
    ) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let concurrency = config.concurrency.max(1);
        let ctx = Arc::new(WorkerContext {
            broker,
            processors,
            metrics,
            failures,
            options: config.job_options,
            lock_ttl: config.lock_ttl,
            poll_interval: config.poll_interval,
            background: Mutex::new(JoinSet::new()),
        });

        let mut consumers = Vec::with_capacity(JobKind::ALL.len() * concurrency);
        for kind in JobKind::ALL {
            for slot in 0..concurrency {
                let name = format!("{}-worker-{}", kind.queue_name(), slot);
                let handle = tokio::spawn(consume(ctx.clone(), kind, shutdown_rx.clone()));
                consumers.push((name, handle));
            }
            info!(queue = %kind, concurrency, "worker started");
        }

        Self {
            shutdown,
            consumers,
            ctx,
        }
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Stop polling, let in-flight jobs finish, then drain pending
    /// failure-persistence tasks.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);

        // Consumers run concurrently; awaiting in turn waits for the slowest.
        for (name, handle) in self.consumers {
            if let Err(e) = handle.await {
                error!(worker = %name, error = %e, "worker task ended abnormally");
            }
        }

        let mut background = std::mem::take(&mut *self.ctx.background.lock().unwrap());
        while let Some(res) = background.join_next().await {
            if let Err(e) = res {
                error!(error = %e, "failure persistence task ended abnormally");
            }
        }
        info!("worker pool stopped");
    }
}

async fn consume(ctx: Arc<WorkerContext>, kind: JobKind, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        match ctx.broker.reserve(kind, ctx.lock_ttl).await {
            Ok(Some(delivery)) => ctx.handle(delivery).await,
            Ok(None) => {
                if idle(&mut shutdown, ctx.poll_interval).await {
                    break;
                }
            }
            Err(e) => {
                warn!(queue = %kind, error = %e, "failed to poll broker");
                if idle(&mut shutdown, ctx.poll_interval).await {
                    break;
                }
            }
        }
    }
}

/// Sleep for `interval` unless shutdown is signalled first. Returns true
/// when the consumer should stop.
async fn idle(shutdown: &mut watch::Receiver<bool>, interval: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(interval) => false,
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

impl WorkerContext {
    async fn handle(self: &Arc<Self>, delivery: Delivery) {
        let job = &delivery.job;
        let kind = job.kind;

        self.metrics.record_started(kind);
        debug!(
            queue = %kind,
            job_id = %job.job_id,
            attempt = job.attempts_made + 1,
            "job started"
        );

        match self.processors.process(job).await {
            Ok(outcome) => {
                self.metrics.record_completed(kind);
                if let Err(e) = self.broker.complete(&delivery, &self.options).await {
                    warn!(queue = %kind, job_id = %job.job_id, error = %e, "failed to settle completed job");
                }
                info!(
                    queue = %kind,
                    job_id = %job.job_id,
                    processed_at = %outcome.processed_at,
                    "job completed"
                );
            }
            Err(err) => {
                self.metrics.record_failed(kind);
                let message = err.service_message();
                let attempts_allowed = job.attempts_allowed;
                let attempts_made = match self.broker.fail(&delivery, &message, &self.options).await {
                    Ok(failed) => failed.attempts_made,
                    Err(e) => {
                        warn!(queue = %kind, job_id = %job.job_id, error = %e, "failed to settle failed job");
                        job.attempts_made + 1
                    }
                };
                warn!(
                    queue = %kind,
                    job_id = %job.job_id,
                    org_id = %job.payload.org_id,
                    entity_id = %job.payload.entity_id,
                    attempts_made,
                    attempts_allowed,
                    error = %err,
                    "job failed"
                );

                if kind.vocal_step().is_some() {
                    self.spawn_failure_persistence(delivery.clone(), message, attempts_made);
                }
            }
        }
    }

    fn spawn_failure_persistence(self: &Arc<Self>, delivery: Delivery, message: String, attempts_made: u32) {
        let ctx = self.clone();
        let mut background = self.background.lock().unwrap();
        // Reap finished tasks so the set stays bounded on long runs.
        while background.try_join_next().is_some() {}
        background.spawn(async move {
            ctx.persist_failure(delivery, message, attempts_made).await;
        });
    }

    async fn persist_failure(&self, delivery: Delivery, message: String, attempts_made: u32) {
        let job = &delivery.job;
        let Some(step) = job.kind.vocal_step() else {
            return;
        };
        let org_id = job.payload.org_id;
        let id = job.payload.entity_id;
        let is_final = attempts_made >= job.attempts_allowed;

        if let Err(e) = self
            .failures
            .mark(org_id, id, step, message.clone(), is_final)
            .await
        {
            error!(
                queue = %job.kind,
                job_id = %job.job_id,
                entity_id = %id,
                error = %e,
                "failed to record processing failure"
            );
        }

        if !is_final {
            return;
        }

        let payload = json!({
            "step": step,
            "queue": job.kind.queue_name(),
            "attemptsMade": attempts_made,
            "attemptsAllowed": job.attempts_allowed,
            "error": truncate_chars(&message, MAX_REVIEW_ERROR_CHARS),
        });
        if let Err(e) = self.failures.open_review_item(org_id, id, payload).await {
            error!(
                queue = %job.kind,
                job_id = %job.job_id,
                entity_id = %id,
                error = %e,
                "failed to open review item"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::in_memory::{InMemoryBroker, StoredJobState};
    use crate::jobs::metrics::QueueCounters;
    use crate::jobs::types::{Backoff, JobEnvelope, JobId, JobPayload};
    use estatehub_ai::{
        InMemoryAiJobsService, InMemoryReviewQueue, InMemoryVocalsService, ProcessingStep,
        VOCAL_ITEM_TYPE, VOCAL_PROCESSING_ERROR, VocalStatus,
    };
    use estatehub_core::{EntityId, OrgId, SystemClock};

    struct Fixture {
        broker: Arc<InMemoryBroker>,
        ai: Arc<InMemoryAiJobsService>,
        vocals: Arc<InMemoryVocalsService>,
        review: Arc<InMemoryReviewQueue>,
        metrics: Arc<QueueMetrics>,
    }

    fn fixture() -> Fixture {
        Fixture {
            broker: InMemoryBroker::arc(),
            ai: Arc::new(InMemoryAiJobsService::new()),
            vocals: Arc::new(InMemoryVocalsService::new()),
            review: Arc::new(InMemoryReviewQueue::new()),
            metrics: Arc::new(QueueMetrics::new()),
        }
    }

    fn options(attempts: u32) -> JobOptions {
        JobOptions {
            attempts,
            backoff: Backoff::exponential(1),
            remove_on_complete: 100,
            remove_on_fail: 100,
        }
    }

    fn start(f: &Fixture, attempts: u32) -> WorkerPool {
        start_with(f, options(attempts))
    }

    fn start_with(f: &Fixture, job_options: JobOptions) -> WorkerPool {
        let config = WorkerPoolConfig::default()
            .with_concurrency(2)
            .with_poll_interval(Duration::from_millis(5))
            .with_job_options(job_options);
        WorkerPool::start(
            config,
            f.broker.clone(),
            JobProcessors::new(f.ai.clone(), f.vocals.clone(), Arc::new(SystemClock)),
            f.metrics.clone(),
            FailureRecorder::new(f.vocals.clone(), f.review.clone()),
        )
    }

    async fn add(f: &Fixture, kind: JobKind, org: OrgId, id: EntityId, attempts: u32) -> JobId {
        let payload = JobPayload::new(org, id);
        let job_id = JobId::deterministic(kind, &payload);
        let job = JobEnvelope::new(kind, payload, job_id.clone(), attempts);
        f.broker.add(job, &options(attempts)).await.unwrap();
        job_id
    }

    async fn wait_until<F: Fn() -> bool>(cond: F) {
        for _ in 0..400 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn counts_successes_and_failures() {
        let f = fixture();
        let org = OrgId::new();
        let (n, m) = (3u64, 2u64);
        let mut ids = Vec::new();
        for i in 0..(n + m) {
            let id = EntityId::new();
            if i >= n {
                f.ai.fail_for(id, "classifier down");
            }
            ids.push(add(&f, JobKind::MessageAi, org, id, 1).await);
        }

        let pool = start(&f, 1);
        assert_eq!(pool.consumer_count(), JobKind::ALL.len() * 2);
        let metrics = f.metrics.clone();
        wait_until(|| {
            let c = metrics.get(JobKind::MessageAi);
            c.completed + c.failed == n + m
        })
        .await;
        pool.shutdown().await;

        assert_eq!(
            f.metrics.get(JobKind::MessageAi),
            QueueCounters {
                started: n + m,
                completed: n,
                failed: m,
            }
        );
        assert_eq!(f.ai.processed_messages().len() as u64, n);
        assert_eq!(f.broker.state_of(&ids[0]), Some(StoredJobState::Completed));
        // Non-vocal failures are not recorded against any memo.
        assert!(f.vocals.failures().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn retried_vocal_failure_is_recorded_as_non_final() {
        let f = fixture();
        let org = OrgId::new();
        let vocal = f.vocals.insert_uploaded(org);
        f.vocals.fail_step(ProcessingStep::Transcribe, "speech api 503");
        add(&f, JobKind::VocalTranscription, org, vocal, 3).await;

        // Long backoff keeps the retry out of the test window.
        let pool = start_with(
            &f,
            JobOptions {
                backoff: Backoff::exponential(60_000),
                ..options(3)
            },
        );
        let vocals = f.vocals.clone();
        wait_until(|| !vocals.failures().is_empty()).await;
        pool.shutdown().await;

        let first = &f.vocals.failures()[0];
        assert_eq!(first.id, vocal);
        assert_eq!(first.step, ProcessingStep::Transcribe);
        assert_eq!(first.message, "processing failed: speech api 503");
        assert!(!first.is_final);
        assert!(f.review.items().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn final_vocal_failure_opens_review_item() {
        let f = fixture();
        let org = OrgId::new();
        let vocal = f.vocals.insert_uploaded(org);
        let long_error = "e".repeat(1_500);
        f.vocals.fail_step(ProcessingStep::DetectType, long_error);
        add(&f, JobKind::VocalTypeDetection, org, vocal, 1).await;

        let pool = start(&f, 1);
        let metrics = f.metrics.clone();
        wait_until(|| metrics.get(JobKind::VocalTypeDetection).failed == 1).await;
        // Shutdown drains the failure persistence task.
        pool.shutdown().await;

        let failures = f.vocals.failures();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].is_final);
        assert_eq!(f.vocals.get(vocal).unwrap().status, VocalStatus::ReviewRequired);

        let items = f.review.open_items_for(vocal);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].item_type, VOCAL_ITEM_TYPE);
        assert_eq!(items[0].reason, VOCAL_PROCESSING_ERROR);
        assert_eq!(items[0].payload["step"], "detect_type");
        assert_eq!(items[0].payload["queue"], "vocal-type-detection");
        assert_eq!(items[0].payload["attemptsMade"], 1);
        assert_eq!(items[0].payload["attemptsAllowed"], 1);
        assert_eq!(
            items[0].payload["error"].as_str().unwrap().chars().count(),
            MAX_REVIEW_ERROR_CHARS
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn persistence_errors_do_not_stop_the_worker() {
        let f = fixture();
        let org = OrgId::new();
        let failing = f.vocals.insert_uploaded(org);
        f.vocals.fail_failure_writes(true);
        f.review.fail_writes(true);
        f.vocals.fail_step(ProcessingStep::ExtractInsights, "llm quota");
        add(&f, JobKind::VocalInsights, org, failing, 1).await;

        let pool = start(&f, 1);
        let metrics = f.metrics.clone();
        wait_until(|| metrics.get(JobKind::VocalInsights).failed == 1).await;

        let message = EntityId::new();
        add(&f, JobKind::MessageAi, org, message, 1).await;
        wait_until(|| metrics.get(JobKind::MessageAi).completed == 1).await;
        pool.shutdown().await;

        assert!(f.review.items().is_empty());
        assert_eq!(f.ai.processed_messages(), vec![(org, message)]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn broker_outage_is_survived() {
        let f = fixture();
        f.broker.set_unavailable(true);
        let pool = start(&f, 1);
        tokio::time::sleep(Duration::from_millis(20)).await;

        f.broker.set_unavailable(false);
        let org = OrgId::new();
        add(&f, JobKind::FileAi, org, EntityId::new(), 1).await;
        let metrics = f.metrics.clone();
        wait_until(|| metrics.get(JobKind::FileAi).completed == 1).await;
        pool.shutdown().await;
    }
}
