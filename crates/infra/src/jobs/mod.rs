//! Background job core.
//!
//! ## Design
//!
//! - Dispatch never fails the caller: a disabled queue or unreachable broker
//!   yields a `local-` job ID instead of an error
//! - First dispatch of an entity uses a deterministic ID so the broker
//!   collapses duplicates; recovery re-dispatches use unique IDs
//! - Retries with exponential backoff and bounded retention are broker policy
//! - Voice-memo failures are recorded against the memo; terminal ones open a
//!   review item
//! - A periodic sweeper re-enqueues memos stuck on a step and finalizes the
//!   ones that exhausted their attempts
//!
//! ## Components
//!
//! - `RuntimeConfig`: environment-derived settings
//! - `Broker` / `ConnectionManager`: queue backend and its shared connection
//! - `Dispatcher`: enqueue façade
//! - `JobProcessors`: kind -> domain service routing
//! - `WorkerPool`: consumers per kind with metrics and failure bookkeeping
//! - `RecoverySweeper` / `RecoveryLoop`: stuck-memo recovery
//! - `JobRuntime`: owns all of the above for one process

pub mod broker;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod failures;
pub mod in_memory;
pub mod metrics;
pub mod processors;
pub mod recovery;
#[cfg(feature = "redis")]
pub mod redis_broker;
pub mod runtime;
pub mod types;
pub mod worker;

pub use broker::{AddOutcome, Broker, BrokerError, Delivery, FailedDelivery};
pub use config::{RecoveryConfig, RuntimeConfig};
pub use connection::{ConnectionManager, Connector, InMemoryConnector};
pub use dispatch::{DispatchError, DispatchOutcome, Dispatcher, EnqueueReceipt, EnqueueStatus};
pub use failures::FailureRecorder;
pub use in_memory::{InMemoryBroker, StoredJobState};
pub use metrics::{MetricsSnapshot, QueueCounters, QueueMetrics};
pub use processors::{JobProcessors, ProcessError};
pub use recovery::{RecoveryError, RecoveryLoop, RecoverySummary, RecoverySweeper};
#[cfg(feature = "redis")]
pub use redis_broker::{RedisBroker, RedisConnector};
pub use runtime::{JobRuntime, JobServices, RuntimeError};
pub use types::{
    Backoff, BackoffStrategy, JobEnvelope, JobId, JobKind, JobOptions, JobOutcome, JobPayload,
};
pub use worker::{WorkerPool, WorkerPoolConfig};
