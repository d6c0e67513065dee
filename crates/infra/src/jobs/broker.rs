//! Broker abstraction.
//!
//! The broker owns job durability, delivery, retries with backoff and
//! retention. The job core only relies on:
//! - `add` ignoring a job whose ID is already known (dedup on first dispatch)
//! - at-least-once delivery through `reserve` / `complete` / `fail`: a job
//!   reserved but not settled within its lock is delivered again

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::types::{JobEnvelope, JobId, JobKind, JobOptions};

/// Broker error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("broker command error: {0}")]
    Command(String),

    #[error("job serialization error: {0}")]
    Serialization(String),

    #[error("broker connection closed")]
    Closed,
}

/// Result of `add`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    /// A job with the same ID already exists; nothing was queued.
    Duplicate,
}

/// A reserved job. Must be settled with `complete` or `fail`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub job: JobEnvelope,
    pub reserved_at: DateTime<Utc>,
}

/// What the broker did with a failed delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedDelivery {
    pub job_id: JobId,
    /// Failed deliveries including this one.
    pub attempts_made: u32,
    pub attempts_allowed: u32,
    /// True when the job was scheduled again with backoff.
    pub will_retry: bool,
}

impl FailedDelivery {
    pub fn is_final(&self) -> bool {
        self.attempts_made >= self.attempts_allowed
    }
}

/// Durable work queue shared by dispatchers and workers.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Queue a job under `job_id`, or do nothing if the ID is known.
    async fn add(&self, job: JobEnvelope, options: &JobOptions) -> Result<AddOutcome, BrokerError>;

    /// Take the next ready job of `kind`, if any, locking it for `lock`.
    /// Non-blocking. Jobs whose lock expired unsettled are queued again
    /// before picking.
    async fn reserve(&self, kind: JobKind, lock: Duration) -> Result<Option<Delivery>, BrokerError>;

    async fn complete(&self, delivery: &Delivery, options: &JobOptions) -> Result<(), BrokerError>;

    /// Record a failed delivery; the broker retries with backoff while
    /// attempts remain.
    async fn fail(
        &self,
        delivery: &Delivery,
        error: &str,
        options: &JobOptions,
    ) -> Result<FailedDelivery, BrokerError>;

    /// Graceful shutdown of the underlying connection.
    async fn quit(&self) -> Result<(), BrokerError>;

    /// Forceful teardown; never fails.
    fn disconnect(&self);
}
