//! Operator review queue items.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use estatehub_core::{EntityId, OrgId};

/// Item type used for voice-memo review entries.
pub const VOCAL_ITEM_TYPE: &str = "VOCAL";

/// Reason attached to review items opened for failed voice-memo processing.
pub const VOCAL_PROCESSING_ERROR: &str = "VOCAL_PROCESSING_ERROR";

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewItemStatus {
    Open,
    Resolved,
}

/// Request to open a review item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewReviewItem {
    pub org_id: OrgId,
    pub item_type: String,
    pub item_id: EntityId,
    pub reason: String,
    /// Structured diagnostics for the operator.
    pub payload: JsonValue,
}

impl NewReviewItem {
    /// Review item for a voice memo whose processing was finalized as failed.
    pub fn vocal_processing_error(org_id: OrgId, vocal_id: EntityId, payload: JsonValue) -> Self {
        Self {
            org_id,
            item_type: VOCAL_ITEM_TYPE.to_string(),
            item_id: vocal_id,
            reason: VOCAL_PROCESSING_ERROR.to_string(),
            payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewItem {
    pub id: Uuid,
    pub org_id: OrgId,
    pub item_type: String,
    pub item_id: EntityId,
    pub reason: String,
    pub payload: JsonValue,
    pub status: ReviewItemStatus,
    pub created_at: DateTime<Utc>,
}
