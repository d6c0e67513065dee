//! In-memory service implementations for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use estatehub_core::{Clock, EntityId, OrgId, SystemClock};

use crate::error::{ServiceError, ServiceResult};
use crate::review::{NewReviewItem, ReviewItem, ReviewItemStatus};
use crate::service::{AiJobsService, ReviewQueueService, VocalsService};
use crate::vocal::{
    AbandonedVocals, ExhaustedQuery, ProcessingFailure, ProcessingStep, RecoveryQuery,
    VocalRecord, VocalStatus,
};

/// In-memory AI jobs service.
///
/// Records every processed `(org, entity)`; failures can be injected per
/// entity.
#[derive(Debug, Default)]
pub struct InMemoryAiJobsService {
    inner: Mutex<AiJobsState>,
}

#[derive(Debug, Default)]
struct AiJobsState {
    messages: Vec<(OrgId, EntityId)>,
    files: Vec<(OrgId, EntityId)>,
    failing: HashMap<EntityId, String>,
}

impl InMemoryAiJobsService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call for `entity_id` fail with `message`.
    pub fn fail_for(&self, entity_id: EntityId, message: impl Into<String>) {
        self.inner
            .lock()
            .unwrap()
            .failing
            .insert(entity_id, message.into());
    }

    pub fn processed_messages(&self) -> Vec<(OrgId, EntityId)> {
        self.inner.lock().unwrap().messages.clone()
    }

    pub fn processed_files(&self) -> Vec<(OrgId, EntityId)> {
        self.inner.lock().unwrap().files.clone()
    }
}

#[async_trait]
impl AiJobsService for InMemoryAiJobsService {
    async fn process_message(&self, org_id: OrgId, message_id: EntityId) -> ServiceResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(msg) = inner.failing.get(&message_id) {
            return Err(ServiceError::ProcessingFailed(msg.clone()));
        }
        inner.messages.push((org_id, message_id));
        Ok(())
    }

    async fn process_file(&self, org_id: OrgId, file_id: EntityId) -> ServiceResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(msg) = inner.failing.get(&file_id) {
            return Err(ServiceError::ProcessingFailed(msg.clone()));
        }
        inner.files.push((org_id, file_id));
        Ok(())
    }
}

/// In-memory voice-memo store.
///
/// Status transitions mirror the persisted service: transcription moves
/// `Uploaded -> Transcribed`, type detection fills `vocal_type`, insight
/// extraction moves to `InsightsReady`. Every write bumps `updated_at` from
/// the injected clock.
pub struct InMemoryVocalsService {
    clock: Arc<dyn Clock>,
    inner: Mutex<VocalsState>,
}

#[derive(Debug, Default)]
struct VocalsState {
    records: HashMap<EntityId, VocalRecord>,
    failing_steps: HashMap<ProcessingStep, String>,
    failures: Vec<ProcessingFailure>,
    fail_listing: Option<String>,
    fail_failure_writes: bool,
}

impl core::fmt::Debug for InMemoryVocalsService {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryVocalsService")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

impl Default for InMemoryVocalsService {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryVocalsService {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            inner: Mutex::new(VocalsState::default()),
        }
    }

    /// Insert a freshly uploaded memo and return its id.
    pub fn insert_uploaded(&self, org_id: OrgId) -> EntityId {
        let record = VocalRecord {
            id: EntityId::new(),
            org_id,
            status: VocalStatus::Uploaded,
            vocal_type: None,
            processing_attempts: 0,
            processing_error: None,
            updated_at: self.clock.now(),
        };
        let id = record.id;
        self.insert(record);
        id
    }

    /// Insert (or replace) a record as-is.
    pub fn insert(&self, record: VocalRecord) {
        self.inner.lock().unwrap().records.insert(record.id, record);
    }

    pub fn get(&self, vocal_id: EntityId) -> Option<VocalRecord> {
        self.inner.lock().unwrap().records.get(&vocal_id).cloned()
    }

    /// Make every call for `step` fail with `message`.
    pub fn fail_step(&self, step: ProcessingStep, message: impl Into<String>) {
        self.inner
            .lock()
            .unwrap()
            .failing_steps
            .insert(step, message.into());
    }

    /// Make the recovery listing queries fail (simulates a database outage).
    pub fn fail_listing(&self, message: Option<String>) {
        self.inner.lock().unwrap().fail_listing = message;
    }

    /// Make `mark_processing_failure` fail.
    pub fn fail_failure_writes(&self, fail: bool) {
        self.inner.lock().unwrap().fail_failure_writes = fail;
    }

    /// Every failure record written so far, in order.
    pub fn failures(&self) -> Vec<ProcessingFailure> {
        self.inner.lock().unwrap().failures.clone()
    }

    fn run_step<F>(&self, org_id: OrgId, vocal_id: EntityId, step: ProcessingStep, apply: F) -> ServiceResult<()>
    where
        F: FnOnce(&mut VocalRecord),
    {
        let now = self.clock.now();
        let mut inner = self.inner.lock().unwrap();
        if let Some(msg) = inner.failing_steps.get(&step) {
            return Err(ServiceError::ProcessingFailed(msg.clone()));
        }
        let record = inner
            .records
            .get_mut(&vocal_id)
            .filter(|r| r.org_id == org_id)
            .ok_or(ServiceError::NotFound(vocal_id))?;

        apply(record);
        record.processing_error = None;
        record.updated_at = now;
        debug!(vocal_id = %vocal_id, step = %step, "vocal step applied");
        Ok(())
    }
}

fn is_stale(record: &VocalRecord, stale_before: DateTime<Utc>) -> bool {
    record.updated_at < stale_before
}

fn awaits_recovery_step(record: &VocalRecord) -> Option<ProcessingStep> {
    match record.status.pending_step()? {
        ProcessingStep::DetectType if record.vocal_type.is_some() => None,
        step => Some(step),
    }
}

fn oldest_first(mut records: Vec<VocalRecord>, limit: usize) -> Vec<VocalRecord> {
    records.sort_by_key(|r| r.updated_at);
    records.truncate(limit);
    records
}

#[async_trait]
impl VocalsService for InMemoryVocalsService {
    async fn transcribe(&self, org_id: OrgId, vocal_id: EntityId) -> ServiceResult<()> {
        self.run_step(org_id, vocal_id, ProcessingStep::Transcribe, |r| {
            if r.status == VocalStatus::Uploaded {
                r.status = VocalStatus::Transcribed;
            }
        })
    }

    async fn detect_type(&self, org_id: OrgId, vocal_id: EntityId) -> ServiceResult<()> {
        self.run_step(org_id, vocal_id, ProcessingStep::DetectType, |r| {
            if r.vocal_type.is_none() {
                r.vocal_type = Some("VISIT_REPORT".to_string());
            }
        })
    }

    async fn extract_insights(&self, org_id: OrgId, vocal_id: EntityId) -> ServiceResult<()> {
        self.run_step(org_id, vocal_id, ProcessingStep::ExtractInsights, |r| {
            if r.status == VocalStatus::Transcribed {
                r.status = VocalStatus::InsightsReady;
            }
        })
    }

    async fn extract_initial_visit_property(
        &self,
        org_id: OrgId,
        vocal_id: EntityId,
    ) -> ServiceResult<()> {
        self.run_step(org_id, vocal_id, ProcessingStep::ExtractInitialVisitProperty, |_| {})
    }

    async fn mark_processing_failure(&self, failure: ProcessingFailure) -> ServiceResult<()> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_failure_writes {
            return Err(ServiceError::Storage("failure ledger unavailable".to_string()));
        }
        let record = inner
            .records
            .get_mut(&failure.id)
            .filter(|r| r.org_id == failure.org_id)
            .ok_or(ServiceError::NotFound(failure.id))?;

        record.processing_error = Some(failure.message.clone());
        if failure.is_final {
            record.status = VocalStatus::ReviewRequired;
        }
        record.updated_at = now;
        inner.failures.push(failure);
        Ok(())
    }

    async fn register_recovery_attempt(
        &self,
        org_id: OrgId,
        vocal_id: EntityId,
    ) -> ServiceResult<u32> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().unwrap();
        let record = inner
            .records
            .get_mut(&vocal_id)
            .filter(|r| r.org_id == org_id)
            .ok_or(ServiceError::NotFound(vocal_id))?;

        record.processing_attempts += 1;
        record.updated_at = now;
        Ok(record.processing_attempts)
    }

    async fn list_abandoned_for_recovery(
        &self,
        query: RecoveryQuery,
    ) -> ServiceResult<AbandonedVocals> {
        let inner = self.inner.lock().unwrap();
        if let Some(msg) = &inner.fail_listing {
            return Err(ServiceError::Storage(msg.clone()));
        }

        let mut transcribe = Vec::new();
        let mut detect_type = Vec::new();
        for record in inner.records.values() {
            if !is_stale(record, query.stale_before) || record.processing_attempts >= query.max_attempts {
                continue;
            }
            match awaits_recovery_step(record) {
                Some(ProcessingStep::Transcribe) => transcribe.push(record.clone()),
                Some(ProcessingStep::DetectType) => detect_type.push(record.clone()),
                _ => {}
            }
        }

        Ok(AbandonedVocals {
            transcribe: oldest_first(transcribe, query.limit),
            detect_type: oldest_first(detect_type, query.limit),
        })
    }

    async fn list_recovery_exhausted(
        &self,
        query: ExhaustedQuery,
    ) -> ServiceResult<Vec<VocalRecord>> {
        let inner = self.inner.lock().unwrap();
        if let Some(msg) = &inner.fail_listing {
            return Err(ServiceError::Storage(msg.clone()));
        }

        let exhausted = inner
            .records
            .values()
            .filter(|r| {
                is_stale(r, query.stale_before)
                    && r.processing_attempts >= query.min_attempts
                    && awaits_recovery_step(r).is_some()
            })
            .cloned()
            .collect();

        Ok(oldest_first(exhausted, query.limit))
    }
}

/// In-memory review queue.
#[derive(Debug, Default)]
pub struct InMemoryReviewQueue {
    items: Mutex<Vec<ReviewItem>>,
    fail_writes: Mutex<bool>,
}

impl InMemoryReviewQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> Vec<ReviewItem> {
        self.items.lock().unwrap().clone()
    }

    /// Open items for a given entity.
    pub fn open_items_for(&self, item_id: EntityId) -> Vec<ReviewItem> {
        self.items
            .lock()
            .unwrap()
            .iter()
            .filter(|i| i.item_id == item_id && i.status == ReviewItemStatus::Open)
            .cloned()
            .collect()
    }

    pub fn fail_writes(&self, fail: bool) {
        *self.fail_writes.lock().unwrap() = fail;
    }
}

#[async_trait]
impl ReviewQueueService for InMemoryReviewQueue {
    async fn create_open_item(&self, item: NewReviewItem) -> ServiceResult<ReviewItem> {
        if *self.fail_writes.lock().unwrap() {
            return Err(ServiceError::Storage("review queue unavailable".to_string()));
        }

        let created = ReviewItem {
            id: Uuid::now_v7(),
            org_id: item.org_id,
            item_type: item.item_type,
            item_id: item.item_id,
            reason: item.reason,
            payload: item.payload,
            status: ReviewItemStatus::Open,
            created_at: Utc::now(),
        };
        self.items.lock().unwrap().push(created.clone());
        Ok(created)
    }
}
