//! Redis-backed broker (durable, at-least-once delivery).
//!
//! Layout per queue (`estatehub:jobs:{queue}`):
//! - `:job:{id}`  — JSON record; written with `SET NX` so a known ID is never
//!   queued twice
//! - `:wait`      — list of ready IDs (RPUSH / LPOP)
//! - `:delayed`   — sorted set of IDs backing off, scored by ready time (ms)
//! - `:active`    — sorted set of reserved IDs, scored by lock expiry (ms);
//!   expired entries go back to `:wait` on the next reserve
//! - `:completed` / `:failed` — retention lists; overflowing IDs are deleted
//!
//! The connection is a single multiplexed connection that does not
//! reconnect on its own; errors and timeouts surface as
//! `BrokerError::Connection`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::MultiplexedConnection;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use super::broker::{AddOutcome, Broker, BrokerError, Delivery, FailedDelivery};
use super::connection::Connector;
use super::types::{JobEnvelope, JobId, JobKind, JobOptions};

/// Default key prefix for all queues.
const DEFAULT_KEY_PREFIX: &str = "estatehub:jobs";

/// Upper bound on delayed or stalled jobs moved per reserve call.
const PROMOTE_BATCH: isize = 100;

/// Connect and per-command timeout unless configured otherwise.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredJob {
    job: JobEnvelope,
    last_error: Option<String>,
}

#[derive(Clone)]
pub struct RedisBroker {
    conn: MultiplexedConnection,
    key_prefix: String,
    closed: Arc<AtomicBool>,
}

impl core::fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisBroker")
            .field("key_prefix", &self.key_prefix)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl RedisBroker {
    /// Open a connection to `redis_url` (e.g. "redis://localhost:6379").
    ///
    /// `timeout` bounds both the connect and every later command.
    pub async fn connect(redis_url: &str, timeout: Duration) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        let conn = client
            .get_multiplexed_async_connection_with_timeouts(timeout, timeout)
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        Ok(Self {
            conn,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    fn queue_key(&self, kind: JobKind, suffix: &str) -> String {
        format!("{}:{}:{}", self.key_prefix, kind.queue_name(), suffix)
    }

    fn job_key(&self, kind: JobKind, id: &JobId) -> String {
        format!("{}:{}:job:{}", self.key_prefix, kind.queue_name(), id)
    }

    fn conn(&self) -> Result<MultiplexedConnection, BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        Ok(self.conn.clone())
    }

    async fn load(
        &self,
        conn: &mut MultiplexedConnection,
        kind: JobKind,
        id: &JobId,
    ) -> Result<Option<StoredJob>, BrokerError> {
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.job_key(kind, id))
            .query_async(conn)
            .await
            .map_err(command_error("GET"))?;

        raw.map(|r| serde_json::from_str(&r).map_err(|e| BrokerError::Serialization(e.to_string())))
            .transpose()
    }

    async fn store(
        &self,
        conn: &mut MultiplexedConnection,
        kind: JobKind,
        stored: &StoredJob,
    ) -> Result<(), BrokerError> {
        let json = serde_json::to_string(stored)
            .map_err(|e| BrokerError::Serialization(e.to_string()))?;
        let _: () = redis::cmd("SET")
            .arg(self.job_key(kind, &stored.job.job_id))
            .arg(json)
            .query_async(conn)
            .await
            .map_err(command_error("SET"))?;
        Ok(())
    }

    /// Move delayed jobs whose backoff elapsed back to the wait list.
    async fn promote_due(
        &self,
        conn: &mut MultiplexedConnection,
        kind: JobKind,
    ) -> Result<(), BrokerError> {
        let delayed_key = self.queue_key(kind, "delayed");
        let now_ms = Utc::now().timestamp_millis();
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&delayed_key)
            .arg("-inf")
            .arg(now_ms)
            .arg("LIMIT")
            .arg(0)
            .arg(PROMOTE_BATCH)
            .query_async(conn)
            .await
            .map_err(command_error("ZRANGEBYSCORE"))?;

        for id in due {
            // Only the caller that wins the ZREM re-queues the ID.
            let removed: i64 = redis::cmd("ZREM")
                .arg(&delayed_key)
                .arg(&id)
                .query_async(conn)
                .await
                .map_err(command_error("ZREM"))?;
            if removed == 1 {
                let _: i64 = redis::cmd("RPUSH")
                    .arg(self.queue_key(kind, "wait"))
                    .arg(&id)
                    .query_async(conn)
                    .await
                    .map_err(command_error("RPUSH"))?;
            }
        }
        Ok(())
    }

    /// Move reserved jobs whose lock expired back to the wait list.
    async fn requeue_stalled(
        &self,
        conn: &mut MultiplexedConnection,
        kind: JobKind,
    ) -> Result<(), BrokerError> {
        let active_key = self.queue_key(kind, "active");
        let now_ms = Utc::now().timestamp_millis();
        let stalled: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&active_key)
            .arg("-inf")
            .arg(now_ms)
            .arg("LIMIT")
            .arg(0)
            .arg(PROMOTE_BATCH)
            .query_async(conn)
            .await
            .map_err(command_error("ZRANGEBYSCORE"))?;

        for id in stalled {
            let removed: i64 = redis::cmd("ZREM")
                .arg(&active_key)
                .arg(&id)
                .query_async(conn)
                .await
                .map_err(command_error("ZREM"))?;
            if removed == 1 {
                warn!(queue = %kind, job_id = %id, "lock expired on unsettled job; queued again");
                let _: i64 = redis::cmd("RPUSH")
                    .arg(self.queue_key(kind, "wait"))
                    .arg(&id)
                    .query_async(conn)
                    .await
                    .map_err(command_error("RPUSH"))?;
            }
        }
        Ok(())
    }

    /// Append to a retention list and delete job records beyond `keep`.
    async fn retain(
        &self,
        conn: &mut MultiplexedConnection,
        kind: JobKind,
        list: &str,
        id: &JobId,
        keep: u64,
    ) -> Result<(), BrokerError> {
        let list_key = self.queue_key(kind, list);
        let len: u64 = redis::cmd("RPUSH")
            .arg(&list_key)
            .arg(id.as_str())
            .query_async(conn)
            .await
            .map_err(command_error("RPUSH"))?;

        for _ in keep..len {
            let evicted: Option<String> = redis::cmd("LPOP")
                .arg(&list_key)
                .query_async(conn)
                .await
                .map_err(command_error("LPOP"))?;
            let Some(evicted) = evicted else { break };
            let _: i64 = redis::cmd("DEL")
                .arg(self.job_key(kind, &JobId::from_raw(evicted)))
                .query_async(conn)
                .await
                .map_err(command_error("DEL"))?;
        }
        Ok(())
    }

    async fn release_active(
        &self,
        conn: &mut MultiplexedConnection,
        kind: JobKind,
        id: &JobId,
    ) -> Result<(), BrokerError> {
        let _: i64 = redis::cmd("ZREM")
            .arg(self.queue_key(kind, "active"))
            .arg(id.as_str())
            .query_async(conn)
            .await
            .map_err(command_error("ZREM"))?;
        Ok(())
    }
}

fn command_error(command: &'static str) -> impl Fn(redis::RedisError) -> BrokerError {
    move |e| {
        if e.is_io_error()
            || e.is_timeout()
            || e.is_connection_dropped()
            || e.is_connection_refusal()
        {
            BrokerError::Connection(format!("{command} failed: {e}"))
        } else {
            BrokerError::Command(format!("{command} failed: {e}"))
        }
    }
}

#[async_trait]
impl Broker for RedisBroker {
    #[instrument(skip(self, job, _options), fields(queue = %job.kind, job_id = %job.job_id), err)]
    async fn add(&self, job: JobEnvelope, _options: &JobOptions) -> Result<AddOutcome, BrokerError> {
        let mut conn = self.conn()?;
        let kind = job.kind;
        let id = job.job_id.clone();
        let json = serde_json::to_string(&StoredJob {
            job,
            last_error: None,
        })
        .map_err(|e| BrokerError::Serialization(e.to_string()))?;

        let created: Option<String> = redis::cmd("SET")
            .arg(self.job_key(kind, &id))
            .arg(json)
            .arg("NX")
            .query_async(&mut conn)
            .await
            .map_err(command_error("SET NX"))?;

        if created.is_none() {
            debug!("job already known to broker; not queued again");
            return Ok(AddOutcome::Duplicate);
        }

        let _: i64 = redis::cmd("RPUSH")
            .arg(self.queue_key(kind, "wait"))
            .arg(id.as_str())
            .query_async(&mut conn)
            .await
            .map_err(command_error("RPUSH"))?;
        Ok(AddOutcome::Added)
    }

    async fn reserve(&self, kind: JobKind, lock: Duration) -> Result<Option<Delivery>, BrokerError> {
        let mut conn = self.conn()?;
        self.requeue_stalled(&mut conn, kind).await?;
        self.promote_due(&mut conn, kind).await?;

        loop {
            let next: Option<String> = redis::cmd("LPOP")
                .arg(self.queue_key(kind, "wait"))
                .query_async(&mut conn)
                .await
                .map_err(command_error("LPOP"))?;
            let Some(raw_id) = next else {
                return Ok(None);
            };

            let id = JobId::from_raw(raw_id);
            let Some(stored) = self.load(&mut conn, kind, &id).await? else {
                warn!(queue = %kind, job_id = %id, "queued id without job record; skipping");
                continue;
            };

            let reserved_at = Utc::now();
            let lock_until = reserved_at
                .timestamp_millis()
                .saturating_add(i64::try_from(lock.as_millis()).unwrap_or(i64::MAX));
            let _: i64 = redis::cmd("ZADD")
                .arg(self.queue_key(kind, "active"))
                .arg(lock_until)
                .arg(id.as_str())
                .query_async(&mut conn)
                .await
                .map_err(command_error("ZADD"))?;

            return Ok(Some(Delivery {
                job: stored.job,
                reserved_at,
            }));
        }
    }

    async fn complete(&self, delivery: &Delivery, options: &JobOptions) -> Result<(), BrokerError> {
        let mut conn = self.conn()?;
        let kind = delivery.job.kind;
        let id = &delivery.job.job_id;
        self.release_active(&mut conn, kind, id).await?;
        self.retain(&mut conn, kind, "completed", id, options.remove_on_complete)
            .await
    }

    async fn fail(
        &self,
        delivery: &Delivery,
        error: &str,
        options: &JobOptions,
    ) -> Result<FailedDelivery, BrokerError> {
        let mut conn = self.conn()?;
        let kind = delivery.job.kind;
        let id = delivery.job.job_id.clone();

        let mut stored = self
            .load(&mut conn, kind, &id)
            .await?
            .unwrap_or_else(|| StoredJob {
                job: delivery.job.clone(),
                last_error: None,
            });
        stored.job.attempts_made += 1;
        stored.last_error = Some(error.to_string());
        self.store(&mut conn, kind, &stored).await?;
        self.release_active(&mut conn, kind, &id).await?;

        let outcome = FailedDelivery {
            job_id: id.clone(),
            attempts_made: stored.job.attempts_made,
            attempts_allowed: stored.job.attempts_allowed,
            will_retry: stored.job.attempts_made < stored.job.attempts_allowed,
        };

        if outcome.will_retry {
            let delay = options.backoff.delay_for_attempt(outcome.attempts_made);
            let ready_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;
            let _: i64 = redis::cmd("ZADD")
                .arg(self.queue_key(kind, "delayed"))
                .arg(ready_at)
                .arg(id.as_str())
                .query_async(&mut conn)
                .await
                .map_err(command_error("ZADD"))?;
        } else {
            self.retain(&mut conn, kind, "failed", &id, options.remove_on_fail)
                .await?;
        }
        Ok(outcome)
    }

    async fn quit(&self) -> Result<(), BrokerError> {
        let mut conn = self.conn()?;
        self.closed.store(true, Ordering::SeqCst);
        let _: () = redis::cmd("QUIT")
            .query_async(&mut conn)
            .await
            .map_err(command_error("QUIT"))?;
        Ok(())
    }

    fn disconnect(&self) {
        // The socket is dropped with the last clone of the connection.
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Connector producing `RedisBroker` connections.
#[derive(Debug, Clone)]
pub struct RedisConnector {
    key_prefix: Option<String>,
    timeout: Duration,
}

impl Default for RedisConnector {
    fn default() -> Self {
        Self {
            key_prefix: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl RedisConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    /// Bound on connecting and on each command.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Connector for RedisConnector {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Broker>, BrokerError> {
        let mut broker = RedisBroker::connect(url, self.timeout).await?;
        if let Some(prefix) = &self.key_prefix {
            broker = broker.with_key_prefix(prefix.clone());
        }
        Ok(Arc::new(broker))
    }
}
