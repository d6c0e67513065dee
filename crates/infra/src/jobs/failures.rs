//! Failure bookkeeping for voice-memo jobs.

use std::sync::Arc;

use serde_json::{Value as JsonValue, json};

use estatehub_ai::{
    NewReviewItem, ProcessingFailure, ProcessingStep, ReviewQueueService, ServiceResult,
    VocalsService,
};
use estatehub_core::{EntityId, OrgId};

/// Longest error text copied into a review item payload.
pub const MAX_REVIEW_ERROR_CHARS: usize = 1_000;

/// Writes failure records and opens review items.
#[derive(Clone)]
pub struct FailureRecorder {
    vocals: Arc<dyn VocalsService>,
    review: Arc<dyn ReviewQueueService>,
}

impl core::fmt::Debug for FailureRecorder {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FailureRecorder").finish_non_exhaustive()
    }
}

impl FailureRecorder {
    pub fn new(vocals: Arc<dyn VocalsService>, review: Arc<dyn ReviewQueueService>) -> Self {
        Self { vocals, review }
    }

    pub async fn mark(
        &self,
        org_id: OrgId,
        id: EntityId,
        step: ProcessingStep,
        message: impl Into<String>,
        is_final: bool,
    ) -> ServiceResult<()> {
        self.vocals
            .mark_processing_failure(ProcessingFailure {
                org_id,
                id,
                step,
                message: message.into(),
                is_final,
            })
            .await
    }

    pub async fn open_review_item(
        &self,
        org_id: OrgId,
        id: EntityId,
        payload: JsonValue,
    ) -> ServiceResult<()> {
        self.review
            .create_open_item(NewReviewItem::vocal_processing_error(org_id, id, payload))
            .await
            .map(|_| ())
    }

    /// Mark a permanent failure, then open its review item.
    pub async fn finalize(
        &self,
        org_id: OrgId,
        id: EntityId,
        step: ProcessingStep,
        message: &str,
        mut details: JsonValue,
    ) -> ServiceResult<()> {
        self.mark(org_id, id, step, message, true).await?;

        if let Some(obj) = details.as_object_mut() {
            obj.insert("step".to_string(), json!(step));
            obj.insert("error".to_string(), json!(truncate_chars(message, MAX_REVIEW_ERROR_CHARS)));
        }
        self.open_review_item(org_id, id, details).await
    }
}

/// At most `max` characters of `s`, cut on a char boundary.
pub fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
