//! Service contracts consumed by the job core.

use async_trait::async_trait;

use estatehub_core::{EntityId, OrgId};

use crate::error::ServiceResult;
use crate::review::{NewReviewItem, ReviewItem};
use crate::vocal::{AbandonedVocals, ExhaustedQuery, ProcessingFailure, RecoveryQuery, VocalRecord};

/// AI processing of inbound messages and uploaded files.
///
/// Implementations must tolerate being called more than once for the same
/// record (at-least-once delivery).
#[async_trait]
pub trait AiJobsService: Send + Sync + 'static {
    async fn process_message(&self, org_id: OrgId, message_id: EntityId) -> ServiceResult<()>;

    async fn process_file(&self, org_id: OrgId, file_id: EntityId) -> ServiceResult<()>;
}

/// Voice-memo processing and its failure/attempt ledger.
#[async_trait]
pub trait VocalsService: Send + Sync + 'static {
    async fn transcribe(&self, org_id: OrgId, vocal_id: EntityId) -> ServiceResult<()>;

    async fn detect_type(&self, org_id: OrgId, vocal_id: EntityId) -> ServiceResult<()>;

    async fn extract_insights(&self, org_id: OrgId, vocal_id: EntityId) -> ServiceResult<()>;

    async fn extract_initial_visit_property(
        &self,
        org_id: OrgId,
        vocal_id: EntityId,
    ) -> ServiceResult<()>;

    /// Record a processing failure. Final failures move the memo to
    /// `ReviewRequired`.
    async fn mark_processing_failure(&self, failure: ProcessingFailure) -> ServiceResult<()>;

    /// Consume one recovery attempt; returns the updated attempt count.
    async fn register_recovery_attempt(&self, org_id: OrgId, vocal_id: EntityId)
    -> ServiceResult<u32>;

    async fn list_abandoned_for_recovery(&self, query: RecoveryQuery)
    -> ServiceResult<AbandonedVocals>;

    async fn list_recovery_exhausted(&self, query: ExhaustedQuery)
    -> ServiceResult<Vec<VocalRecord>>;
}

/// Operator review queue.
#[async_trait]
pub trait ReviewQueueService: Send + Sync + 'static {
    async fn create_open_item(&self, item: NewReviewItem) -> ServiceResult<ReviewItem>;
}
