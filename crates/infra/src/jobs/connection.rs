//! Broker connection lifecycle.
//!
//! One shared connection per runtime, opened lazily on first use and torn
//! down on `close_connection`. A later `get_connection` opens a new one.
//! Opening is bounded by a connect timeout so callers never queue behind a
//! broker that does not answer.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::broker::{Broker, BrokerError};
use super::in_memory::InMemoryBroker;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens broker connections.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Broker>, BrokerError>;
}

/// Hands out a shared `InMemoryBroker`; every connect reopens it so the
/// queued state survives a close/reconnect cycle.
#[derive(Debug, Clone)]
pub struct InMemoryConnector {
    broker: Arc<InMemoryBroker>,
    refuse: Arc<AtomicBool>,
}

impl InMemoryConnector {
    pub fn new(broker: Arc<InMemoryBroker>) -> Self {
        Self {
            broker,
            refuse: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn broker(&self) -> &Arc<InMemoryBroker> {
        &self.broker
    }

    /// Make subsequent connects fail.
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for InMemoryConnector {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Broker>, BrokerError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(BrokerError::Connection(format!("connection refused: {url}")));
        }
        self.broker.reopen();
        Ok(self.broker.clone())
    }
}

/// Lazily-opened, shared broker connection.
pub struct ConnectionManager {
    url: String,
    connector: Arc<dyn Connector>,
    connect_timeout: Duration,
    slot: Mutex<Option<Arc<dyn Broker>>>,
}

impl core::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("url", &self.url)
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    pub fn new(url: impl Into<String>, connector: Arc<dyn Connector>) -> Self {
        Self {
            url: url.into(),
            connector,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            slot: Mutex::new(None),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Return the shared connection, opening it on first use.
    ///
    /// Concurrent callers wait on the slot, so at most one connection is
    /// opened at a time; a connect that outlives the timeout fails with
    /// `BrokerError::Connection`.
    pub async fn get_connection(&self) -> Result<Arc<dyn Broker>, BrokerError> {
        let mut slot = self.slot.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }

        let conn = tokio::time::timeout(self.connect_timeout, self.connector.connect(&self.url))
            .await
            .map_err(|_| {
                warn!(url = %self.url, timeout_ms = self.connect_timeout.as_millis() as u64, "broker connect timed out");
                BrokerError::Connection(format!(
                    "connect to {} timed out after {}ms",
                    self.url,
                    self.connect_timeout.as_millis()
                ))
            })??;
        info!(url = %self.url, "broker connection opened");
        *slot = Some(conn.clone());
        Ok(conn)
    }

    pub async fn is_connected(&self) -> bool {
        self.slot.lock().await.is_some()
    }

    /// Close the shared connection, if any. Never fails; safe to call
    /// repeatedly.
    pub async fn close_connection(&self) {
        // Clear the slot first so no caller picks up a closing connection.
        let Some(conn) = self.slot.lock().await.take() else {
            return;
        };

        match conn.quit().await {
            Ok(()) => info!(url = %self.url, "broker connection closed"),
            Err(e) => {
                warn!(url = %self.url, error = %e, "graceful broker quit failed; disconnecting");
                conn.disconnect();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::{JobEnvelope, JobId, JobKind, JobOptions, JobPayload};
    use estatehub_core::{EntityId, OrgId};

    fn manager() -> (ConnectionManager, InMemoryConnector) {
        let connector = InMemoryConnector::new(InMemoryBroker::arc());
        let manager = ConnectionManager::new("memory://test", Arc::new(connector.clone()));
        (manager, connector)
    }

    #[tokio::test]
    async fn connection_is_opened_lazily_and_shared() {
        let (manager, _connector) = manager();
        assert!(!manager.is_connected().await);

        let a = manager.get_connection().await.unwrap();
        let b = manager.get_connection().await.unwrap();

        assert!(manager.is_connected().await);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_allows_reconnect() {
        let (manager, connector) = manager();
        manager.get_connection().await.unwrap();

        manager.close_connection().await;
        assert!(connector.broker().is_closed());
        assert!(!manager.is_connected().await);
        manager.close_connection().await;

        let conn = manager.get_connection().await.unwrap();
        assert!(!connector.broker().is_closed());

        let payload = JobPayload::new(OrgId::new(), EntityId::new());
        let job = JobEnvelope::new(
            JobKind::FileAi,
            payload,
            JobId::deterministic(JobKind::FileAi, &payload),
            1,
        );
        assert!(conn.add(job, &JobOptions::default()).await.is_ok());
    }

    #[tokio::test]
    async fn failed_quit_falls_back_to_disconnect() {
        let (manager, connector) = manager();
        manager.get_connection().await.unwrap();
        connector.broker().set_unavailable(true);

        manager.close_connection().await;

        assert!(connector.broker().is_closed());
        assert!(!manager.is_connected().await);
    }

    #[tokio::test]
    async fn refused_connect_is_an_error() {
        let (manager, connector) = manager();
        connector.set_refuse(true);

        let Err(err) = manager.get_connection().await else {
            panic!("connect should have been refused");
        };
        assert!(matches!(err, BrokerError::Connection(_)));
        assert!(!manager.is_connected().await);
    }

    /// Never completes a connect.
    struct HangingConnector;

    #[async_trait]
    impl Connector for HangingConnector {
        async fn connect(&self, _url: &str) -> Result<Arc<dyn Broker>, BrokerError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn hanging_connect_times_out() {
        let manager = ConnectionManager::new("redis://10.255.255.1:6379", Arc::new(HangingConnector))
            .with_connect_timeout(Duration::from_millis(50));

        let started = std::time::Instant::now();
        let Err(err) = manager.get_connection().await else {
            panic!("connect should have timed out");
        };

        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(matches!(err, BrokerError::Connection(msg) if msg.contains("timed out")));
        assert!(!manager.is_connected().await);
    }
}
