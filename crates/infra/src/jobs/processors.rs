//! Job kind -> domain service routing.

use std::sync::Arc;

use estatehub_ai::{AiJobsService, ServiceError, VocalsService};
use estatehub_core::Clock;

use super::types::{JobEnvelope, JobKind, JobOutcome};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessError {
    #[error("{kind} job failed: {source}")]
    Service {
        kind: JobKind,
        #[source]
        source: ServiceError,
    },
}

impl ProcessError {
    /// The underlying service error, rendered for failure records.
    pub fn service_message(&self) -> String {
        match self {
            ProcessError::Service { source, .. } => source.to_string(),
        }
    }
}

/// Routes each job to the domain operation of its kind.
///
/// Errors are returned untouched; retry decisions belong to the broker.
#[derive(Clone)]
pub struct JobProcessors {
    ai: Arc<dyn AiJobsService>,
    vocals: Arc<dyn VocalsService>,
    clock: Arc<dyn Clock>,
}

impl core::fmt::Debug for JobProcessors {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobProcessors").finish_non_exhaustive()
    }
}

impl JobProcessors {
    pub fn new(
        ai: Arc<dyn AiJobsService>,
        vocals: Arc<dyn VocalsService>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { ai, vocals, clock }
    }

    pub async fn process(&self, job: &JobEnvelope) -> Result<JobOutcome, ProcessError> {
        let org_id = job.payload.org_id;
        let id = job.payload.entity_id;

        let result = match job.kind {
            JobKind::MessageAi => self.ai.process_message(org_id, id).await,
            JobKind::FileAi => self.ai.process_file(org_id, id).await,
            JobKind::VocalTranscription => self.vocals.transcribe(org_id, id).await,
            JobKind::VocalInsights => self.vocals.extract_insights(org_id, id).await,
            JobKind::VocalTypeDetection => self.vocals.detect_type(org_id, id).await,
            JobKind::InitialVisitPropertyExtraction => {
                self.vocals.extract_initial_visit_property(org_id, id).await
            }
        };

        result.map_err(|source| ProcessError::Service {
            kind: job.kind,
            source,
        })?;

        Ok(JobOutcome {
            queue: job.kind.queue_name().to_string(),
            job_id: job.job_id.clone(),
            processed_at: self.clock.now(),
        })
    }
}
