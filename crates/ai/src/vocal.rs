//! Voice-memo ("vocal") processing state as seen by the job core.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use estatehub_core::{EntityId, OrgId};

/// Processing status of a voice memo.
///
/// `Uploaded -> Transcribed -> InsightsReady`; `ReviewRequired` is absorbing.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VocalStatus {
    Uploaded,
    Transcribed,
    InsightsReady,
    ReviewRequired,
}

impl VocalStatus {
    /// The processing step a memo in this status is waiting on, if recovery
    /// is responsible for it.
    pub fn pending_step(self) -> Option<ProcessingStep> {
        match self {
            VocalStatus::Uploaded => Some(ProcessingStep::Transcribe),
            VocalStatus::Transcribed => Some(ProcessingStep::DetectType),
            VocalStatus::InsightsReady | VocalStatus::ReviewRequired => None,
        }
    }
}

/// A voice-memo processing step, used to tag failure records.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStep {
    Transcribe,
    DetectType,
    ExtractInsights,
    ExtractInitialVisitProperty,
}

impl ProcessingStep {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessingStep::Transcribe => "transcribe",
            ProcessingStep::DetectType => "detect_type",
            ProcessingStep::ExtractInsights => "extract_insights",
            ProcessingStep::ExtractInitialVisitProperty => "extract_initial_visit_property",
        }
    }
}

impl core::fmt::Display for ProcessingStep {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subset of a voice-memo row the job core reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VocalRecord {
    pub id: EntityId,
    pub org_id: OrgId,
    pub status: VocalStatus,
    /// Detected memo type; `None` until type detection succeeds.
    pub vocal_type: Option<String>,
    /// Recovery-cycle attempts (not broker delivery attempts).
    pub processing_attempts: u32,
    pub processing_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Failure record written against a voice memo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingFailure {
    pub org_id: OrgId,
    pub id: EntityId,
    pub step: ProcessingStep,
    pub message: String,
    /// Terminal failures move the memo to `ReviewRequired`.
    pub is_final: bool,
}

/// Memos stuck on a step and still below the attempt ceiling.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RecoveryQuery {
    pub stale_before: DateTime<Utc>,
    pub max_attempts: u32,
    pub limit: usize,
}

/// Memos stuck on a step that reached the attempt ceiling.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ExhaustedQuery {
    pub stale_before: DateTime<Utc>,
    pub min_attempts: u32,
    pub limit: usize,
}

/// Recoverable memos grouped by the step they wait on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AbandonedVocals {
    pub transcribe: Vec<VocalRecord>,
    pub detect_type: Vec<VocalRecord>,
}

impl AbandonedVocals {
    pub fn is_empty(&self) -> bool {
        self.transcribe.is_empty() && self.detect_type.is_empty()
    }
}
