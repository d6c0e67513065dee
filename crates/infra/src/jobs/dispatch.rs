//! Dispatch façade used by request handlers.
//!
//! Dispatching never fails from the caller's point of view: when the queue
//! is disabled or the broker is unreachable the caller still gets a
//! `Queued` receipt, carrying a locally minted `local-` job ID.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use estatehub_core::{EntityId, OrgId};

use super::broker::{AddOutcome, BrokerError};
use super::connection::ConnectionManager;
use super::types::{JobEnvelope, JobId, JobKind, JobOptions, JobPayload};

/// Fallible dispatch error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("queue is disabled")]
    Disabled,

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnqueueStatus {
    Queued,
}

/// What the caller of the façade sees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueReceipt {
    pub job_id: JobId,
    pub status: EnqueueStatus,
}

/// What actually happened to a dispatched job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Enqueued { job_id: JobId },
    /// The broker was bypassed; nothing will process the job.
    Fallback { job_id: JobId, reason: String },
}

impl DispatchOutcome {
    pub fn job_id(&self) -> &JobId {
        match self {
            DispatchOutcome::Enqueued { job_id } | DispatchOutcome::Fallback { job_id, .. } => {
                job_id
            }
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, DispatchOutcome::Fallback { .. })
    }

    pub fn into_receipt(self) -> EnqueueReceipt {
        let job_id = match self {
            DispatchOutcome::Enqueued { job_id } | DispatchOutcome::Fallback { job_id, .. } => {
                job_id
            }
        };
        EnqueueReceipt {
            job_id,
            status: EnqueueStatus::Queued,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    enabled: bool,
    options: JobOptions,
    connection: Arc<ConnectionManager>,
}

impl Dispatcher {
    pub fn new(enabled: bool, options: JobOptions, connection: Arc<ConnectionManager>) -> Self {
        Self {
            enabled,
            options,
            connection,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn options(&self) -> &JobOptions {
        &self.options
    }

    /// Dispatch under the deterministic ID for `(kind, payload)`.
    pub async fn dispatch(&self, kind: JobKind, payload: JobPayload) -> DispatchOutcome {
        if !self.enabled {
            let job_id = JobId::fallback();
            debug!(queue = %kind, job_id = %job_id, "queue disabled; job not dispatched");
            return DispatchOutcome::Fallback {
                job_id,
                reason: DispatchError::Disabled.to_string(),
            };
        }

        let job_id = JobId::deterministic(kind, &payload);
        match self.add(kind, payload, job_id.clone()).await {
            Ok(()) => DispatchOutcome::Enqueued { job_id },
            Err(e) => {
                let fallback = JobId::fallback();
                warn!(
                    queue = %kind,
                    job_id = %job_id,
                    fallback_job_id = %fallback,
                    org_id = %payload.org_id,
                    entity_id = %payload.entity_id,
                    error = %e,
                    "job dispatch failed; continuing without queue"
                );
                DispatchOutcome::Fallback {
                    job_id: fallback,
                    reason: e.to_string(),
                }
            }
        }
    }

    pub async fn enqueue(&self, kind: JobKind, payload: JobPayload) -> EnqueueReceipt {
        self.dispatch(kind, payload).await.into_receipt()
    }

    /// Enqueue under an explicit ID, surfacing every failure.
    pub async fn try_enqueue(
        &self,
        kind: JobKind,
        payload: JobPayload,
        job_id: JobId,
    ) -> Result<JobId, DispatchError> {
        if !self.enabled {
            return Err(DispatchError::Disabled);
        }
        self.add(kind, payload, job_id.clone()).await?;
        Ok(job_id)
    }

    async fn add(
        &self,
        kind: JobKind,
        payload: JobPayload,
        job_id: JobId,
    ) -> Result<(), BrokerError> {
        let broker = self.connection.get_connection().await?;
        let job = JobEnvelope::new(kind, payload, job_id, self.options.attempts);
        let job_id = job.job_id.clone();
        if broker.add(job, &self.options).await? == AddOutcome::Duplicate {
            debug!(queue = %kind, job_id = %job_id, "job already queued");
        }
        Ok(())
    }

    pub async fn enqueue_message_ai_job(&self, org_id: OrgId, message_id: EntityId) -> EnqueueReceipt {
        self.enqueue(JobKind::MessageAi, JobPayload::new(org_id, message_id))
            .await
    }

    pub async fn enqueue_file_ai_job(&self, org_id: OrgId, file_id: EntityId) -> EnqueueReceipt {
        self.enqueue(JobKind::FileAi, JobPayload::new(org_id, file_id))
            .await
    }

    pub async fn enqueue_vocal_transcription_job(
        &self,
        org_id: OrgId,
        vocal_id: EntityId,
    ) -> EnqueueReceipt {
        self.enqueue(JobKind::VocalTranscription, JobPayload::new(org_id, vocal_id))
            .await
    }

    pub async fn enqueue_vocal_insights_job(
        &self,
        org_id: OrgId,
        vocal_id: EntityId,
    ) -> EnqueueReceipt {
        self.enqueue(JobKind::VocalInsights, JobPayload::new(org_id, vocal_id))
            .await
    }

    pub async fn enqueue_vocal_type_detection_job(
        &self,
        org_id: OrgId,
        vocal_id: EntityId,
    ) -> EnqueueReceipt {
        self.enqueue(JobKind::VocalTypeDetection, JobPayload::new(org_id, vocal_id))
            .await
    }

    pub async fn enqueue_initial_visit_property_extraction_job(
        &self,
        org_id: OrgId,
        vocal_id: EntityId,
    ) -> EnqueueReceipt {
        self.enqueue(
            JobKind::InitialVisitPropertyExtraction,
            JobPayload::new(org_id, vocal_id),
        )
        .await
    }
}
