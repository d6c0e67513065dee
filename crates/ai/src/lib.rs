//! `estatehub-ai`
//!
//! **Responsibility:** contracts of the domain services the job core drives.
//!
//! - AI jobs (message classification, file analysis)
//! - Voice memos ("vocals": transcription, type detection, insights,
//!   initial-visit property extraction, failure/attempt bookkeeping)
//! - Operator review queue
//!
//! The job core only talks to these through the traits in [`service`].
//! Real implementations live with the persistence layer; the in-memory ones
//! here back tests and local development.

pub mod error;
pub mod in_memory;
pub mod review;
pub mod service;
pub mod vocal;

pub use error::{ServiceError, ServiceResult};
pub use in_memory::{InMemoryAiJobsService, InMemoryReviewQueue, InMemoryVocalsService};
pub use review::{NewReviewItem, ReviewItem, ReviewItemStatus, VOCAL_ITEM_TYPE, VOCAL_PROCESSING_ERROR};
pub use service::{AiJobsService, ReviewQueueService, VocalsService};
pub use vocal::{
    AbandonedVocals, ExhaustedQuery, ProcessingFailure, ProcessingStep, RecoveryQuery,
    VocalRecord, VocalStatus,
};
