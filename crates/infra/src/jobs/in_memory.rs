//! In-memory broker for tests/dev.
//!
//! Mirrors the semantics the job core relies on from the Redis broker:
//! ID-based dedup, FIFO delivery per queue, redelivery of jobs whose lock
//! expired, exponential retry backoff and bounded retention of
//! completed/failed jobs.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

use estatehub_core::{Clock, SystemClock};

use super::broker::{AddOutcome, Broker, BrokerError, Delivery, FailedDelivery};
use super::types::{JobEnvelope, JobId, JobKind, JobOptions};

/// Lifecycle state of a job held by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredJobState {
    Waiting,
    Delayed { until: DateTime<Utc> },
    Active { lock_until: DateTime<Utc> },
    Completed,
    Failed { error: String },
}

#[derive(Debug, Clone)]
struct StoredJob {
    job: JobEnvelope,
    state: StoredJobState,
}

#[derive(Debug, Default)]
struct BrokerState {
    jobs: HashMap<JobId, StoredJob>,
    waiting: HashMap<JobKind, VecDeque<JobId>>,
    completed: HashMap<JobKind, VecDeque<JobId>>,
    failed: HashMap<JobKind, VecDeque<JobId>>,
    added: u64,
}

pub struct InMemoryBroker {
    clock: Arc<dyn Clock>,
    inner: Mutex<BrokerState>,
    unavailable: AtomicBool,
    closed: AtomicBool,
}

impl core::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryBroker")
            .field("unavailable", &self.unavailable)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            inner: Mutex::new(BrokerState::default()),
            unavailable: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Simulate losing (or regaining) the broker.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Accept commands again after `quit`/`disconnect`.
    pub fn reopen(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn state_of(&self, job_id: &JobId) -> Option<StoredJobState> {
        self.inner
            .lock()
            .unwrap()
            .jobs
            .get(job_id)
            .map(|j| j.state.clone())
    }

    pub fn job(&self, job_id: &JobId) -> Option<JobEnvelope> {
        self.inner
            .lock()
            .unwrap()
            .jobs
            .get(job_id)
            .map(|j| j.job.clone())
    }

    /// IDs queued for `kind`, oldest first.
    pub fn waiting(&self, kind: JobKind) -> Vec<JobId> {
        self.inner
            .lock()
            .unwrap()
            .waiting
            .get(&kind)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Jobs accepted by `add` (duplicates excluded).
    pub fn added_count(&self) -> u64 {
        self.inner.lock().unwrap().added
    }

    fn check(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BrokerError::Connection("broker unreachable".to_string()));
        }
        Ok(())
    }
}

impl BrokerState {
    fn promote_due(&mut self, kind: JobKind, now: DateTime<Utc>) {
        let mut due: Vec<(DateTime<Utc>, JobId)> = self
            .jobs
            .iter()
            .filter_map(|(id, j)| match j.state {
                StoredJobState::Delayed { until } if j.job.kind == kind && until <= now => {
                    Some((until, id.clone()))
                }
                _ => None,
            })
            .collect();
        due.sort();

        for (_, id) in due {
            if let Some(j) = self.jobs.get_mut(&id) {
                j.state = StoredJobState::Waiting;
            }
            self.waiting.entry(kind).or_default().push_back(id);
        }
    }

    /// Queue again the active jobs whose lock expired; returns how many.
    fn requeue_stalled(&mut self, kind: JobKind, now: DateTime<Utc>) -> usize {
        let mut stalled: Vec<(DateTime<Utc>, JobId)> = self
            .jobs
            .iter()
            .filter_map(|(id, j)| match j.state {
                StoredJobState::Active { lock_until } if j.job.kind == kind && lock_until <= now => {
                    Some((lock_until, id.clone()))
                }
                _ => None,
            })
            .collect();
        stalled.sort();

        let count = stalled.len();
        for (_, id) in stalled {
            if let Some(j) = self.jobs.get_mut(&id) {
                j.state = StoredJobState::Waiting;
            }
            self.waiting.entry(kind).or_default().push_back(id);
        }
        count
    }

    /// Keep the newest `keep` IDs of a retention list; forget the rest.
    fn retain(&mut self, kind: JobKind, completed: bool, id: JobId, keep: u64) {
        let list = if completed {
            self.completed.entry(kind).or_default()
        } else {
            self.failed.entry(kind).or_default()
        };
        list.push_back(id);

        let mut evicted = Vec::new();
        while list.len() as u64 > keep {
            if let Some(old) = list.pop_front() {
                evicted.push(old);
            }
        }
        for old in evicted {
            self.jobs.remove(&old);
        }
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn add(&self, job: JobEnvelope, _options: &JobOptions) -> Result<AddOutcome, BrokerError> {
        self.check()?;
        let mut inner = self.inner.lock().unwrap();
        if inner.jobs.contains_key(&job.job_id) {
            return Ok(AddOutcome::Duplicate);
        }

        let id = job.job_id.clone();
        let kind = job.kind;
        inner.jobs.insert(
            id.clone(),
            StoredJob {
                job,
                state: StoredJobState::Waiting,
            },
        );
        inner.waiting.entry(kind).or_default().push_back(id);
        inner.added += 1;
        Ok(AddOutcome::Added)
    }

    async fn reserve(&self, kind: JobKind, lock: Duration) -> Result<Option<Delivery>, BrokerError> {
        self.check()?;
        let now = self.clock.now();
        let lock_until = chrono::Duration::from_std(lock)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let mut inner = self.inner.lock().unwrap();

        let stalled = inner.requeue_stalled(kind, now);
        if stalled > 0 {
            warn!(queue = %kind, stalled, "lock expired on unsettled jobs; queued again");
        }
        inner.promote_due(kind, now);

        while let Some(id) = inner.waiting.get_mut(&kind).and_then(|q| q.pop_front()) {
            // Skip IDs evicted by retention, or settled late after a redelivery.
            if let Some(stored) = inner.jobs.get_mut(&id) {
                if stored.state != StoredJobState::Waiting {
                    continue;
                }
                stored.state = StoredJobState::Active { lock_until };
                return Ok(Some(Delivery {
                    job: stored.job.clone(),
                    reserved_at: now,
                }));
            }
        }
        Ok(None)
    }

    async fn complete(&self, delivery: &Delivery, options: &JobOptions) -> Result<(), BrokerError> {
        self.check()?;
        let mut inner = self.inner.lock().unwrap();
        let id = delivery.job.job_id.clone();
        match inner.jobs.get_mut(&id) {
            Some(stored) => stored.state = StoredJobState::Completed,
            None => return Err(BrokerError::Command(format!("unknown job: {id}"))),
        }
        inner.retain(delivery.job.kind, true, id, options.remove_on_complete);
        Ok(())
    }

    async fn fail(
        &self,
        delivery: &Delivery,
        error: &str,
        options: &JobOptions,
    ) -> Result<FailedDelivery, BrokerError> {
        self.check()?;
        let now = self.clock.now();
        let mut inner = self.inner.lock().unwrap();
        let id = delivery.job.job_id.clone();
        let stored = inner
            .jobs
            .get_mut(&id)
            .ok_or_else(|| BrokerError::Command(format!("unknown job: {id}")))?;

        stored.job.attempts_made += 1;
        let outcome = FailedDelivery {
            job_id: id.clone(),
            attempts_made: stored.job.attempts_made,
            attempts_allowed: stored.job.attempts_allowed,
            will_retry: stored.job.attempts_made < stored.job.attempts_allowed,
        };

        if outcome.will_retry {
            let delay = options.backoff.delay_for_attempt(outcome.attempts_made);
            let until = now + chrono::Duration::from_std(delay).unwrap_or_default();
            stored.state = StoredJobState::Delayed { until };
        } else {
            stored.state = StoredJobState::Failed {
                error: error.to_string(),
            };
            inner.retain(delivery.job.kind, false, id, options.remove_on_fail);
        }
        Ok(outcome)
    }

    async fn quit(&self) -> Result<(), BrokerError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BrokerError::Connection("broker unreachable".to_string()));
        }
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn disconnect(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
