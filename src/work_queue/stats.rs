//! Work queue statistics.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::action::BioQAction;

/// Counters kept by each work queue.
#[derive(Debug)]
pub struct WorkQueueStats {
    enqueued: AtomicU64,
    processed: [AtomicU64; BioQAction::ALL.len()],
    queue_time_us: AtomicU64,
    max_queue_time_us: AtomicU64,
    batches: AtomicU64,
    panics: AtomicU64,
    max_pending: AtomicU64,
}

impl Default for WorkQueueStats {
    fn default() -> Self {
        Self {
            enqueued: AtomicU64::new(0),
            processed: Default::default(),
            queue_time_us: AtomicU64::new(0),
            max_queue_time_us: AtomicU64::new(0),
            batches: AtomicU64::new(0),
            panics: AtomicU64::new(0),
            max_pending: AtomicU64::new(0),
        }
    }
}

impl WorkQueueStats {
    pub fn record_enqueued(&self, pending: usize) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        self.max_pending.fetch_max(pending as u64, Ordering::Relaxed);
    }

    pub fn record_processed(&self, action: BioQAction, waited: Duration) {
        let us = waited.as_micros() as u64;
        self.processed[action.index()].fetch_add(1, Ordering::Relaxed);
        self.queue_time_us.fetch_add(us, Ordering::Relaxed);
        self.max_queue_time_us.fetch_max(us, Ordering::Relaxed);
    }

    pub fn record_batch(&self) {
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_panic(&self) {
        self.panics.fetch_add(1, Ordering::Relaxed);
    }

    pub fn enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    pub fn processed(&self) -> u64 {
        self.processed
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .sum()
    }

    pub fn processed_for(&self, action: BioQAction) -> u64 {
        self.processed[action.index()].load(Ordering::Relaxed)
    }

    pub fn batches(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }

    /// Processed counts keyed by action name, omitting actions never seen.
    pub fn processed_by_action(&self) -> BTreeMap<String, u64> {
        BioQAction::ALL
            .iter()
            .filter_map(|action| {
                let count = self.processed_for(*action);
                (count > 0).then(|| (action.name().to_string(), count))
            })
            .collect()
    }

    /// Average time an item waited between enqueue and execution.
    pub fn avg_queue_time(&self) -> Duration {
        let count = self.processed();
        if count == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.queue_time_us.load(Ordering::Relaxed) / count)
    }

    pub fn max_queue_time(&self) -> Duration {
        Duration::from_micros(self.max_queue_time_us.load(Ordering::Relaxed))
    }

    /// Work items that panicked.
    pub fn panics(&self) -> u64 {
        self.panics.load(Ordering::Relaxed)
    }

    pub fn max_pending(&self) -> u64 {
        self.max_pending.load(Ordering::Relaxed)
    }
}

/// Diagnostic view of one work queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkQueueDump {
    pub name: String,
    pub pending: usize,
    pub max_pending: u64,
    pub enqueued: u64,
    pub processed: u64,
    pub processed_by_action: BTreeMap<String, u64>,
    pub batches: u64,
    pub panics: u64,
    pub avg_queue_time_us: u64,
    pub max_queue_time_us: u64,
    pub idle: bool,
    pub stopped: bool,
}
