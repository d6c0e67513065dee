//! Recovery of voice memos stuck on a processing step.
//!
//! The sweeper scans domain state, not broker state: a memo waiting on
//! transcription or type detection whose last update is older than
//! `stale_after` is re-enqueued under a fresh recovery ID until it reaches
//! `max_attempts`, then finalized (review-required + one review item).
//! A record whose bookkeeping fails is logged and skipped; only a failed
//! listing aborts the pass.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use estatehub_ai::{
    ExhaustedQuery, ProcessingStep, RecoveryQuery, ServiceError, VocalRecord, VocalsService,
};
use estatehub_core::{Clock, EntityId};

use super::config::RecoveryConfig;
use super::dispatch::Dispatcher;
use super::failures::FailureRecorder;
use super::types::{JobId, JobKind, JobPayload};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecoveryError {
    #[error("failed to list vocals for recovery: {0}")]
    Listing(#[source] ServiceError),

    #[error("recovery of vocal {id} failed: {source}")]
    Vocal {
        id: EntityId,
        #[source]
        source: ServiceError,
    },
}

/// Counters of one recovery pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoverySummary {
    pub requeued_transcriptions: usize,
    pub requeued_type_detections: usize,
    pub finalized: usize,
    /// Records skipped because a domain-service call failed.
    pub failed: usize,
}

impl RecoverySummary {
    pub fn is_empty(&self) -> bool {
        self.requeued_transcriptions == 0
            && self.requeued_type_detections == 0
            && self.finalized == 0
            && self.failed == 0
    }

    fn record(&mut self, step: ProcessingStep, result: Result<Requeue, RecoveryError>) {
        match result {
            Ok(Requeue::Requeued) if step == ProcessingStep::DetectType => {
                self.requeued_type_detections += 1
            }
            Ok(Requeue::Requeued) => self.requeued_transcriptions += 1,
            Ok(Requeue::Finalized) => self.finalized += 1,
            Ok(Requeue::Deferred) => {}
            Err(e) => {
                self.failed += 1;
                log_record_error(&e);
            }
        }
    }
}

fn log_record_error(e: &RecoveryError) {
    match e {
        RecoveryError::Vocal { id, source } => {
            error!(entity_id = %id, error = %source, "vocal recovery failed; record skipped")
        }
        RecoveryError::Listing(source) => error!(error = %source, "vocal recovery failed"),
    }
}

enum Requeue {
    Requeued,
    /// Enqueue failed; the memo stays recoverable.
    Deferred,
    Finalized,
}

/// Resets the in-flight flag however the pass ends.
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct RecoverySweeper {
    vocals: Arc<dyn VocalsService>,
    failures: FailureRecorder,
    dispatcher: Arc<Dispatcher>,
    clock: Arc<dyn Clock>,
    config: RecoveryConfig,
    in_flight: AtomicBool,
}

impl core::fmt::Debug for RecoverySweeper {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RecoverySweeper")
            .field("config", &self.config)
            .field("in_flight", &self.in_flight)
            .finish_non_exhaustive()
    }
}

impl RecoverySweeper {
    pub fn new(
        vocals: Arc<dyn VocalsService>,
        failures: FailureRecorder,
        dispatcher: Arc<Dispatcher>,
        clock: Arc<dyn Clock>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            vocals,
            failures,
            dispatcher,
            clock,
            config,
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Run one pass. Returns `Ok(None)` without doing anything when another
    /// pass is still running.
    pub async fn run_pass(&self) -> Result<Option<RecoverySummary>, RecoveryError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("recovery pass already running; skipped");
            return Ok(None);
        }
        let _guard = PassGuard(&self.in_flight);

        let summary = self.sweep().await?;
        if !summary.is_empty() {
            info!(
                requeued_transcriptions = summary.requeued_transcriptions,
                requeued_type_detections = summary.requeued_type_detections,
                finalized = summary.finalized,
                failed = summary.failed,
                "vocal recovery pass"
            );
        }
        Ok(Some(summary))
    }

    async fn sweep(&self) -> Result<RecoverySummary, RecoveryError> {
        let stale_before = stale_before(self.clock.now(), self.config.stale_after);
        let mut summary = RecoverySummary::default();

        let abandoned = self
            .vocals
            .list_abandoned_for_recovery(RecoveryQuery {
                stale_before,
                max_attempts: self.config.max_attempts,
                limit: self.config.batch_size,
            })
            .await
            .map_err(RecoveryError::Listing)?;

        for record in &abandoned.transcribe {
            let result = self.requeue(record, ProcessingStep::Transcribe).await;
            summary.record(ProcessingStep::Transcribe, result);
        }
        for record in &abandoned.detect_type {
            let result = self.requeue(record, ProcessingStep::DetectType).await;
            summary.record(ProcessingStep::DetectType, result);
        }

        let exhausted = self
            .vocals
            .list_recovery_exhausted(ExhaustedQuery {
                stale_before,
                min_attempts: self.config.max_attempts,
                limit: self.config.batch_size,
            })
            .await
            .map_err(RecoveryError::Listing)?;

        for record in &exhausted {
            let Some(step) = record.status.pending_step() else {
                continue;
            };
            let message = format!(
                "processing abandoned: no progress after {} attempts",
                record.processing_attempts
            );
            let result = self
                .failures
                .finalize(
                    record.org_id,
                    record.id,
                    step,
                    &message,
                    json!({
                        "source": "recovery",
                        "attempts": record.processing_attempts,
                        "maxAttempts": self.config.max_attempts,
                    }),
                )
                .await
                .map(|()| Requeue::Finalized)
                .map_err(|source| RecoveryError::Vocal {
                    id: record.id,
                    source,
                });
            summary.record(step, result);
        }

        Ok(summary)
    }

    async fn requeue(
        &self,
        record: &VocalRecord,
        step: ProcessingStep,
    ) -> Result<Requeue, RecoveryError> {
        let Some(kind) = JobKind::for_recovery_step(step) else {
            return Ok(Requeue::Deferred);
        };
        let vocal_err = |source| RecoveryError::Vocal {
            id: record.id,
            source,
        };

        // The attempt is consumed even if the enqueue below fails.
        let attempt = self
            .vocals
            .register_recovery_attempt(record.org_id, record.id)
            .await
            .map_err(vocal_err)?;

        let payload = JobPayload::new(record.org_id, record.id);
        let job_id = JobId::recovery(kind, &payload, attempt, self.clock.now());

        match self.dispatcher.try_enqueue(kind, payload, job_id).await {
            Ok(job_id) => {
                info!(queue = %kind, job_id = %job_id, entity_id = %record.id, attempt, "vocal re-enqueued");
                Ok(Requeue::Requeued)
            }
            Err(e) if attempt >= self.config.max_attempts => {
                warn!(queue = %kind, entity_id = %record.id, attempt, error = %e, "re-enqueue failed on last attempt");
                self.failures
                    .finalize(
                        record.org_id,
                        record.id,
                        step,
                        &format!("reprise impossible: {e}"),
                        json!({
                            "source": "recovery",
                            "attempts": attempt,
                            "maxAttempts": self.config.max_attempts,
                        }),
                    )
                    .await
                    .map_err(vocal_err)?;
                Ok(Requeue::Finalized)
            }
            Err(e) => {
                warn!(queue = %kind, entity_id = %record.id, attempt, error = %e, "re-enqueue failed");
                self.failures
                    .mark(record.org_id, record.id, step, e.to_string(), false)
                    .await
                    .map_err(vocal_err)?;
                Ok(Requeue::Deferred)
            }
        }
    }
}

fn stale_before(now: DateTime<Utc>, stale_after: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(stale_after)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Periodic driver of a `RecoverySweeper`.
pub struct RecoveryLoop {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl core::fmt::Debug for RecoveryLoop {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RecoveryLoop").finish_non_exhaustive()
    }
}

impl RecoveryLoop {
    /// Run one pass now, then one every `interval`.
    pub fn start(sweeper: Arc<RecoverySweeper>) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let period = sweeper.config().interval.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_ms = period.as_millis() as u64, "vocal recovery loop started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = sweeper.run_pass().await {
                            error!(error = %e, "vocal recovery pass failed");
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("vocal recovery loop stopped");
        });

        Self { shutdown, handle }
    }

    /// Signal the loop and wait for it, including a pass in progress.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            error!(error = %e, "vocal recovery loop ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use tokio::sync::Notify;

    use estatehub_ai::{
        AbandonedVocals, InMemoryReviewQueue, InMemoryVocalsService, ProcessingFailure,
        ServiceResult, VOCAL_PROCESSING_ERROR, VocalStatus,
    };
    use estatehub_core::{ManualClock, OrgId};

    use crate::jobs::connection::{ConnectionManager, InMemoryConnector};
    use crate::jobs::in_memory::InMemoryBroker;
    use crate::jobs::types::JobOptions;

    struct Fixture {
        clock: ManualClock,
        vocals: Arc<InMemoryVocalsService>,
        review: Arc<InMemoryReviewQueue>,
        broker: Arc<InMemoryBroker>,
        org: OrgId,
    }

    fn config() -> RecoveryConfig {
        RecoveryConfig {
            stale_after: Duration::from_secs(5 * 60),
            interval: Duration::from_secs(60),
            max_attempts: 3,
            batch_size: 100,
        }
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::default();
        Fixture {
            vocals: Arc::new(InMemoryVocalsService::with_clock(Arc::new(clock.clone()))),
            review: Arc::new(InMemoryReviewQueue::new()),
            broker: InMemoryBroker::arc(),
            clock,
            org: OrgId::new(),
        }
    }

    fn dispatcher(f: &Fixture, enabled: bool) -> Arc<Dispatcher> {
        let connector = InMemoryConnector::new(f.broker.clone());
        let connection = Arc::new(ConnectionManager::new("memory://test", Arc::new(connector)));
        Arc::new(Dispatcher::new(enabled, JobOptions::default(), connection))
    }

    fn sweeper_with(f: &Fixture, vocals: Arc<dyn VocalsService>, enabled: bool) -> RecoverySweeper {
        RecoverySweeper::new(
            vocals.clone(),
            FailureRecorder::new(vocals, f.review.clone()),
            dispatcher(f, enabled),
            Arc::new(f.clock.clone()),
            config(),
        )
    }

    fn sweeper(f: &Fixture) -> RecoverySweeper {
        sweeper_with(f, f.vocals.clone(), true)
    }

    /// Insert a memo last touched `minutes_ago` with `attempts` consumed.
    fn stuck(f: &Fixture, status: VocalStatus, attempts: u32, minutes_ago: i64) -> EntityId {
        let record = VocalRecord {
            id: EntityId::new(),
            org_id: f.org,
            status,
            vocal_type: None,
            processing_attempts: attempts,
            processing_error: None,
            updated_at: f.clock.now() - ChronoDuration::minutes(minutes_ago),
        };
        let id = record.id;
        f.vocals.insert(record);
        id
    }

    #[tokio::test]
    async fn requeues_stale_memos_under_recovery_ids() {
        let f = fixture();
        let uploaded = stuck(&f, VocalStatus::Uploaded, 0, 10);
        let transcribed = stuck(&f, VocalStatus::Transcribed, 1, 10);
        let fresh = stuck(&f, VocalStatus::Uploaded, 0, 1);

        let summary = sweeper(&f).run_pass().await.unwrap().unwrap();

        assert_eq!(
            summary,
            RecoverySummary {
                requeued_transcriptions: 1,
                requeued_type_detections: 1,
                finalized: 0,
                failed: 0,
            }
        );
        assert_eq!(f.vocals.get(uploaded).unwrap().processing_attempts, 1);
        assert_eq!(f.vocals.get(transcribed).unwrap().processing_attempts, 2);
        assert_eq!(f.vocals.get(fresh).unwrap().processing_attempts, 0);

        let queued = f.broker.waiting(JobKind::VocalTranscription);
        assert_eq!(queued.len(), 1);
        let payload = JobPayload::new(f.org, uploaded);
        assert_ne!(queued[0], JobId::deterministic(JobKind::VocalTranscription, &payload));
        assert!(queued[0].as_str().starts_with(&format!(
            "vocal-transcription:recovery:{}:{}:1:",
            f.org, uploaded
        )));
        assert!(f.broker.waiting(JobKind::VocalTypeDetection)[0]
            .as_str()
            .starts_with("vocal-type-detection:recovery:"));
    }

    #[tokio::test]
    async fn exhausted_memo_is_finalized_exactly_once() {
        let f = fixture();
        let id = stuck(&f, VocalStatus::Uploaded, 3, 10);
        let sweeper = sweeper(&f);

        let first = sweeper.run_pass().await.unwrap().unwrap();
        f.clock.advance(ChronoDuration::minutes(10));
        let second = sweeper.run_pass().await.unwrap().unwrap();

        assert_eq!(first.finalized, 1);
        assert_eq!(first.requeued_transcriptions, 0);
        assert!(second.is_empty());
        assert!(f.broker.waiting(JobKind::VocalTranscription).is_empty());

        let record = f.vocals.get(id).unwrap();
        assert_eq!(record.status, VocalStatus::ReviewRequired);
        assert_eq!(
            record.processing_error.as_deref(),
            Some("processing abandoned: no progress after 3 attempts")
        );
        let items = f.review.open_items_for(id);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].reason, VOCAL_PROCESSING_ERROR);
    }

    #[tokio::test]
    async fn stuck_memo_is_retried_then_abandoned() {
        let f = fixture();
        let id = stuck(&f, VocalStatus::Uploaded, 1, 10);
        let sweeper = sweeper(&f);

        let first = sweeper.run_pass().await.unwrap().unwrap();
        assert_eq!(first.requeued_transcriptions, 1);
        assert_eq!(first.finalized, 0);
        assert_eq!(f.vocals.get(id).unwrap().processing_attempts, 2);

        f.clock.advance(ChronoDuration::minutes(10));
        let second = sweeper.run_pass().await.unwrap().unwrap();
        assert_eq!(second.requeued_transcriptions, 1);
        assert_eq!(f.vocals.get(id).unwrap().processing_attempts, 3);

        f.clock.advance(ChronoDuration::minutes(10));
        let third = sweeper.run_pass().await.unwrap().unwrap();
        assert_eq!(third.requeued_transcriptions, 0);
        assert_eq!(third.finalized, 1);

        let record = f.vocals.get(id).unwrap();
        assert_eq!(record.status, VocalStatus::ReviewRequired);
        assert!(record.processing_error.unwrap().contains("abandoned"));
        assert_eq!(f.review.open_items_for(id).len(), 1);
        assert_eq!(f.broker.waiting(JobKind::VocalTranscription).len(), 2);
    }

    #[tokio::test]
    async fn enqueue_failure_on_last_attempt_finalizes() {
        let f = fixture();
        let last = stuck(&f, VocalStatus::Uploaded, 2, 10);
        let early = stuck(&f, VocalStatus::Uploaded, 0, 10);
        f.broker.set_unavailable(true);

        let summary = sweeper(&f).run_pass().await.unwrap().unwrap();

        assert_eq!(summary.finalized, 1);
        assert_eq!(summary.requeued_transcriptions, 0);

        let finalized = f.vocals.get(last).unwrap();
        assert_eq!(finalized.status, VocalStatus::ReviewRequired);
        assert!(finalized
            .processing_error
            .unwrap()
            .starts_with("reprise impossible: "));
        assert_eq!(f.review.open_items_for(last).len(), 1);

        let deferred = f.vocals.get(early).unwrap();
        assert_eq!(deferred.status, VocalStatus::Uploaded);
        assert_eq!(deferred.processing_attempts, 1);
        assert!(deferred.processing_error.is_some());
        assert!(f.review.open_items_for(early).is_empty());
    }

    #[tokio::test]
    async fn disabled_queue_counts_as_enqueue_failure() {
        let f = fixture();
        let id = stuck(&f, VocalStatus::Uploaded, 0, 10);

        let summary = sweeper_with(&f, f.vocals.clone(), false)
            .run_pass()
            .await
            .unwrap()
            .unwrap();

        assert!(summary.is_empty());
        let failure = f.vocals.failures().pop().unwrap();
        assert_eq!(failure.id, id);
        assert_eq!(failure.message, "queue is disabled");
        assert!(!failure.is_final);
    }

    #[tokio::test]
    async fn listing_errors_surface() {
        let f = fixture();
        f.vocals.fail_listing(Some("db down".to_string()));

        let err = sweeper(&f).run_pass().await.unwrap_err();
        assert!(matches!(err, RecoveryError::Listing(ServiceError::Storage(_))));

        // The in-flight flag was released.
        f.vocals.fail_listing(None);
        assert!(sweeper(&f).run_pass().await.unwrap().is_some());
    }

    /// Blocks the abandoned listing until released.
    struct GatedVocals {
        inner: Arc<InMemoryVocalsService>,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl VocalsService for GatedVocals {
        async fn transcribe(&self, org_id: OrgId, vocal_id: EntityId) -> ServiceResult<()> {
            self.inner.transcribe(org_id, vocal_id).await
        }

        async fn detect_type(&self, org_id: OrgId, vocal_id: EntityId) -> ServiceResult<()> {
            self.inner.detect_type(org_id, vocal_id).await
        }

        async fn extract_insights(&self, org_id: OrgId, vocal_id: EntityId) -> ServiceResult<()> {
            self.inner.extract_insights(org_id, vocal_id).await
        }

        async fn extract_initial_visit_property(
            &self,
            org_id: OrgId,
            vocal_id: EntityId,
        ) -> ServiceResult<()> {
            self.inner.extract_initial_visit_property(org_id, vocal_id).await
        }

        async fn mark_processing_failure(&self, failure: ProcessingFailure) -> ServiceResult<()> {
            self.inner.mark_processing_failure(failure).await
        }

        async fn register_recovery_attempt(
            &self,
            org_id: OrgId,
            vocal_id: EntityId,
        ) -> ServiceResult<u32> {
            self.inner.register_recovery_attempt(org_id, vocal_id).await
        }

        async fn list_abandoned_for_recovery(
            &self,
            query: RecoveryQuery,
        ) -> ServiceResult<AbandonedVocals> {
            self.entered.notify_one();
            self.release.notified().await;
            self.inner.list_abandoned_for_recovery(query).await
        }

        async fn list_recovery_exhausted(
            &self,
            query: ExhaustedQuery,
        ) -> ServiceResult<Vec<VocalRecord>> {
            self.inner.list_recovery_exhausted(query).await
        }
    }

    #[tokio::test]
    async fn overlapping_passes_run_one_sweep() {
        let f = fixture();
        let id = stuck(&f, VocalStatus::Uploaded, 0, 10);
        let gated = Arc::new(GatedVocals {
            inner: f.vocals.clone(),
            entered: Notify::new(),
            release: Notify::new(),
        });
        let sweeper = Arc::new(sweeper_with(&f, gated.clone(), true));

        let running = sweeper.clone();
        let first = tokio::spawn(async move { running.run_pass().await });
        gated.entered.notified().await;

        assert_eq!(sweeper.run_pass().await.unwrap(), None);

        gated.release.notify_one();
        let summary = first.await.unwrap().unwrap().unwrap();
        assert_eq!(summary.requeued_transcriptions, 1);
        assert_eq!(f.vocals.get(id).unwrap().processing_attempts, 1);
        assert_eq!(f.broker.waiting(JobKind::VocalTranscription).len(), 1);
    }

    /// Fails every write about one memo.
    struct BrokenRecordVocals {
        inner: Arc<InMemoryVocalsService>,
        broken: EntityId,
    }

    impl BrokenRecordVocals {
        fn check(&self, id: EntityId) -> ServiceResult<()> {
            if id == self.broken {
                return Err(ServiceError::Storage("row locked".to_string()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl VocalsService for BrokenRecordVocals {
        async fn transcribe(&self, org_id: OrgId, vocal_id: EntityId) -> ServiceResult<()> {
            self.inner.transcribe(org_id, vocal_id).await
        }

        async fn detect_type(&self, org_id: OrgId, vocal_id: EntityId) -> ServiceResult<()> {
            self.inner.detect_type(org_id, vocal_id).await
        }

        async fn extract_insights(&self, org_id: OrgId, vocal_id: EntityId) -> ServiceResult<()> {
            self.inner.extract_insights(org_id, vocal_id).await
        }

        async fn extract_initial_visit_property(
            &self,
            org_id: OrgId,
            vocal_id: EntityId,
        ) -> ServiceResult<()> {
            self.inner.extract_initial_visit_property(org_id, vocal_id).await
        }

        async fn mark_processing_failure(&self, failure: ProcessingFailure) -> ServiceResult<()> {
            self.check(failure.id)?;
            self.inner.mark_processing_failure(failure).await
        }

        async fn register_recovery_attempt(
            &self,
            org_id: OrgId,
            vocal_id: EntityId,
        ) -> ServiceResult<u32> {
            self.check(vocal_id)?;
            self.inner.register_recovery_attempt(org_id, vocal_id).await
        }

        async fn list_abandoned_for_recovery(
            &self,
            query: RecoveryQuery,
        ) -> ServiceResult<AbandonedVocals> {
            self.inner.list_abandoned_for_recovery(query).await
        }

        async fn list_recovery_exhausted(
            &self,
            query: ExhaustedQuery,
        ) -> ServiceResult<Vec<VocalRecord>> {
            self.inner.list_recovery_exhausted(query).await
        }
    }

    #[tokio::test]
    async fn failing_record_does_not_block_requeue_of_others() {
        let f = fixture();
        let broken = stuck(&f, VocalStatus::Uploaded, 0, 20);
        let healthy = stuck(&f, VocalStatus::Uploaded, 0, 10);
        let vocals = Arc::new(BrokenRecordVocals {
            inner: f.vocals.clone(),
            broken,
        });

        let summary = sweeper_with(&f, vocals, true).run_pass().await.unwrap().unwrap();

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.requeued_transcriptions, 1);
        assert_eq!(f.vocals.get(broken).unwrap().processing_attempts, 0);
        assert_eq!(f.vocals.get(healthy).unwrap().processing_attempts, 1);

        let queued = f.broker.waiting(JobKind::VocalTranscription);
        assert_eq!(queued.len(), 1);
        assert!(queued[0].as_str().contains(&healthy.to_string()));
    }

    #[tokio::test]
    async fn failing_record_does_not_block_finalization_of_others() {
        let f = fixture();
        let broken = stuck(&f, VocalStatus::Uploaded, 3, 20);
        let healthy = stuck(&f, VocalStatus::Transcribed, 3, 10);
        let vocals = Arc::new(BrokenRecordVocals {
            inner: f.vocals.clone(),
            broken,
        });
        let sweeper = sweeper_with(&f, vocals, true);

        let first = sweeper.run_pass().await.unwrap().unwrap();
        assert_eq!(first.failed, 1);
        assert_eq!(first.finalized, 1);
        assert_eq!(f.vocals.get(healthy).unwrap().status, VocalStatus::ReviewRequired);
        assert_eq!(f.review.open_items_for(healthy).len(), 1);

        // The broken memo is retried on later passes without effect on others.
        f.clock.advance(ChronoDuration::minutes(10));
        let second = sweeper.run_pass().await.unwrap().unwrap();
        assert_eq!(second.failed, 1);
        assert_eq!(second.finalized, 0);
        assert_eq!(f.vocals.get(broken).unwrap().status, VocalStatus::Uploaded);
        assert!(f.review.open_items_for(broken).is_empty());
        assert_eq!(f.review.open_items_for(healthy).len(), 1);
    }

    #[tokio::test]
    async fn loop_runs_immediately_and_stops() {
        let f = fixture();
        let id = stuck(&f, VocalStatus::Uploaded, 0, 10);
        let sweeper = Arc::new(sweeper(&f));

        let recovery = RecoveryLoop::start(sweeper);
        for _ in 0..200 {
            if f.vocals.get(id).unwrap().processing_attempts == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        recovery.stop().await;

        assert_eq!(f.vocals.get(id).unwrap().processing_attempts, 1);
    }

    #[test]
    fn stale_cutoff_saturates() {
        let now = Utc::now();
        assert_eq!(stale_before(now, Duration::from_secs(60)), now - ChronoDuration::seconds(60));
        assert_eq!(stale_before(now, Duration::MAX), DateTime::<Utc>::MIN_UTC);
    }
}
