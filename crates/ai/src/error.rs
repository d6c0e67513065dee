use thiserror::Error;

use estatehub_core::EntityId;

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Failure reported by a domain service.
///
/// The job core never inspects the variant; it records the rendered message
/// against the entity and lets the broker decide on retries.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("record not found: {0}")]
    NotFound(EntityId),

    #[error("processing failed: {0}")]
    ProcessingFailed(String),

    #[error("storage error: {0}")]
    Storage(String),
}
