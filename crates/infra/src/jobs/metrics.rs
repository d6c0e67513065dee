//! Per-queue processing counters.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use super::types::JobKind;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounters {
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Snapshot keyed by queue key (`"message-ai"`, ...).
pub type MetricsSnapshot = BTreeMap<String, QueueCounters>;

/// Counters for every job kind, all zero at construction.
#[derive(Debug)]
pub struct QueueMetrics {
    counters: Mutex<BTreeMap<JobKind, QueueCounters>>,
}

impl Default for QueueMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueMetrics {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(zeroed()),
        }
    }

    pub fn record_started(&self, kind: JobKind) {
        self.update(kind, |c| c.started += 1);
    }

    pub fn record_completed(&self, kind: JobKind) {
        self.update(kind, |c| c.completed += 1);
    }

    pub fn record_failed(&self, kind: JobKind) {
        self.update(kind, |c| c.failed += 1);
    }

    pub fn get(&self, kind: JobKind) -> QueueCounters {
        self.counters
            .lock()
            .unwrap()
            .get(&kind)
            .copied()
            .unwrap_or_default()
    }

    /// Independent copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.counters
            .lock()
            .unwrap()
            .iter()
            .map(|(kind, c)| (kind.key().to_string(), *c))
            .collect()
    }

    pub fn reset(&self) {
        *self.counters.lock().unwrap() = zeroed();
    }

    fn update(&self, kind: JobKind, f: impl FnOnce(&mut QueueCounters)) {
        let mut counters = self.counters.lock().unwrap();
        f(counters.entry(kind).or_default());
    }
}

fn zeroed() -> BTreeMap<JobKind, QueueCounters> {
    JobKind::ALL
        .into_iter()
        .map(|k| (k, QueueCounters::default()))
        .collect()
}
