//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use estatehub_ai::ProcessingStep;
use estatehub_core::{EntityId, OrgId};

/// Prefix of job IDs minted locally when the broker path is unavailable.
pub const FALLBACK_JOB_ID_PREFIX: &str = "local-";

/// The fixed set of background operations.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    /// AI classification of an inbound message.
    MessageAi,
    /// AI analysis of an uploaded file.
    FileAi,
    VocalTranscription,
    VocalInsights,
    VocalTypeDetection,
    /// Property parameters extracted from an initial-visit voice memo.
    InitialVisitPropertyExtraction,
}

impl JobKind {
    pub const ALL: [JobKind; 6] = [
        JobKind::MessageAi,
        JobKind::FileAi,
        JobKind::VocalTranscription,
        JobKind::VocalInsights,
        JobKind::VocalTypeDetection,
        JobKind::InitialVisitPropertyExtraction,
    ];

    /// Stable key: queue name, metrics key and job-ID prefix.
    pub fn key(self) -> &'static str {
        match self {
            JobKind::MessageAi => "message-ai",
            JobKind::FileAi => "file-ai",
            JobKind::VocalTranscription => "vocal-transcription",
            JobKind::VocalInsights => "vocal-insights",
            JobKind::VocalTypeDetection => "vocal-type-detection",
            JobKind::InitialVisitPropertyExtraction => "initial-visit-property-extraction",
        }
    }

    pub fn queue_name(self) -> &'static str {
        self.key()
    }

    /// Voice-memo processing step, for kinds whose failures are recorded
    /// against the memo.
    pub fn vocal_step(self) -> Option<ProcessingStep> {
        match self {
            JobKind::MessageAi | JobKind::FileAi => None,
            JobKind::VocalTranscription => Some(ProcessingStep::Transcribe),
            JobKind::VocalInsights => Some(ProcessingStep::ExtractInsights),
            JobKind::VocalTypeDetection => Some(ProcessingStep::DetectType),
            JobKind::InitialVisitPropertyExtraction => {
                Some(ProcessingStep::ExtractInitialVisitProperty)
            }
        }
    }

    /// Kind that re-runs a stuck voice-memo step during recovery.
    pub fn for_recovery_step(step: ProcessingStep) -> Option<Self> {
        match step {
            ProcessingStep::Transcribe => Some(JobKind::VocalTranscription),
            ProcessingStep::DetectType => Some(JobKind::VocalTypeDetection),
            ProcessingStep::ExtractInsights | ProcessingStep::ExtractInitialVisitProperty => None,
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.key() == key)
    }
}

impl core::fmt::Display for JobKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.key())
    }
}

/// One job = one entity to process.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    pub org_id: OrgId,
    pub entity_id: EntityId,
}

impl JobPayload {
    pub fn new(org_id: OrgId, entity_id: EntityId) -> Self {
        Self { org_id, entity_id }
    }
}

/// Broker-level job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// `kind:org:entity` — identical for every first dispatch of the same
    /// entity, so the broker collapses duplicates.
    pub fn deterministic(kind: JobKind, payload: &JobPayload) -> Self {
        Self(format!(
            "{}:{}:{}",
            kind.key(),
            payload.org_id,
            payload.entity_id
        ))
    }

    /// `kind:recovery:org:entity:attempt:timestamp` — never collides with the
    /// deterministic ID nor with an earlier recovery of the same entity.
    pub fn recovery(kind: JobKind, payload: &JobPayload, attempt: u32, at: DateTime<Utc>) -> Self {
        Self(format!(
            "{}:recovery:{}:{}:{}:{}",
            kind.key(),
            payload.org_id,
            payload.entity_id,
            attempt,
            at.timestamp_millis()
        ))
    }

    /// Random `local-` identifier returned when the broker is bypassed.
    pub fn fallback() -> Self {
        Self(format!("{}{}", FALLBACK_JOB_ID_PREFIX, Uuid::now_v7()))
    }

    pub fn from_raw(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_fallback(&self) -> bool {
        self.0.starts_with(FALLBACK_JOB_ID_PREFIX)
    }
}

impl core::fmt::Display for JobId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Backoff strategy for broker retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: delay * 2^(attempt-1)
    #[default]
    Exponential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backoff {
    pub strategy: BackoffStrategy,
    pub delay_ms: u64,
}

impl Backoff {
    pub fn exponential(delay_ms: u64) -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            delay_ms,
        }
    }

    /// Delay before retrying after the `attempt`-th failure (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let ms = match self.strategy {
            BackoffStrategy::Fixed => self.delay_ms,
            BackoffStrategy::Exponential => {
                let exp = 1u64 << (attempt - 1).min(32);
                self.delay_ms.saturating_mul(exp)
            }
        };
        Duration::from_millis(ms)
    }
}

/// Per-job broker options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOptions {
    /// Delivery attempts before the job is failed for good (>= 1).
    pub attempts: u32,
    pub backoff: Backoff,
    /// Completed jobs kept by the broker.
    pub remove_on_complete: u64,
    /// Failed jobs kept by the broker.
    pub remove_on_fail: u64,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            attempts: 5,
            backoff: Backoff::exponential(3_000),
            remove_on_complete: 1_000,
            remove_on_fail: 5_000,
        }
    }
}

/// A job as delivered to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEnvelope {
    pub kind: JobKind,
    pub payload: JobPayload,
    pub job_id: JobId,
    /// Failed deliveries so far.
    pub attempts_made: u32,
    pub attempts_allowed: u32,
}

impl JobEnvelope {
    pub fn new(kind: JobKind, payload: JobPayload, job_id: JobId, attempts_allowed: u32) -> Self {
        Self {
            kind,
            payload,
            job_id,
            attempts_made: 0,
            attempts_allowed,
        }
    }

    /// True when a failure at this point leaves no delivery attempt.
    pub fn is_final_attempt(&self) -> bool {
        self.attempts_made >= self.attempts_allowed
    }
}

/// Uniform result of a processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOutcome {
    pub queue: String,
    pub job_id: JobId,
    pub processed_at: DateTime<Utc>,
}
