//! Sequencing statistics.
//!
//! Node counters are independent atomics updated from worker threads. Event
//! counters change together per batch, so they live behind one `RwLock` and a
//! reader never sees half of a batch applied.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy)]
struct EventCounters {
    events_enqueued: u64,
    events_skipped: u64,
    events_ignored: u64,
    batches_enqueued: u64,
    batches_ignored: u64,
    nodes_enqueued: u64,
    start_time: DateTime<Utc>,
}

impl EventCounters {
    fn new() -> Self {
        Self {
            events_enqueued: 0,
            events_skipped: 0,
            events_ignored: 0,
            batches_enqueued: 0,
            batches_ignored: 0,
            nodes_enqueued: 0,
            start_time: Utc::now(),
        }
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    /// Nodes every selected sequencer ran on.
    pub nodes_sequenced: u64,
    /// Nodes no sequencer was selected for.
    pub nodes_skipped: u64,
    /// Nodes whose task failed or panicked.
    pub nodes_failed: u64,
    /// Node changes the worker queue refused.
    pub tasks_rejected: u64,
    /// Events that passed the filter.
    pub events_enqueued: u64,
    /// Events rejected by the filter.
    pub events_skipped: u64,
    /// Events received while not started.
    pub events_ignored: u64,
    /// Batches received while started.
    pub batches_enqueued: u64,
    /// Batches received while not started.
    pub batches_ignored: u64,
    /// Distinct node changes submitted after de-duplication.
    pub nodes_enqueued: u64,
    /// When counting started or was last reset.
    pub start_time: DateTime<Utc>,
}

/// Counters kept by a sequencing system.
#[derive(Debug)]
pub struct Statistics {
    nodes_sequenced: AtomicU64,
    nodes_skipped: AtomicU64,
    nodes_failed: AtomicU64,
    tasks_rejected: AtomicU64,
    events: RwLock<EventCounters>,
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

impl Statistics {
    /// Zeroed counters starting now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes_sequenced: AtomicU64::new(0),
            nodes_skipped: AtomicU64::new(0),
            nodes_failed: AtomicU64::new(0),
            tasks_rejected: AtomicU64::new(0),
            events: RwLock::new(EventCounters::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, EventCounters> {
        self.events.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, EventCounters> {
        self.events.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// A node ran through every selected sequencer.
    pub fn record_node_sequenced(&self) {
        self.nodes_sequenced.fetch_add(1, Ordering::Relaxed);
    }

    /// No sequencer was selected for a node.
    pub fn record_node_skipped(&self) {
        self.nodes_skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// A node could not be resolved or a sequencer failed on it.
    pub fn record_node_failed(&self) {
        self.nodes_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// The worker pool refused a node task.
    pub fn record_task_rejected(&self) {
        self.tasks_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one processed batch.
    pub fn record_events(&self, enqueued: u64, skipped: u64) {
        let mut events = self.write();
        events.events_enqueued += enqueued;
        events.events_skipped += skipped;
        events.batches_enqueued += 1;
    }

    /// Records one batch dropped because the system was not started.
    pub fn record_events_ignored(&self, count: u64) {
        let mut events = self.write();
        events.events_ignored += count;
        events.batches_ignored += 1;
    }

    /// Records node changes handed to the worker pool.
    pub fn record_nodes_enqueued(&self, count: u64) {
        self.write().nodes_enqueued += count;
    }

    /// Zeroes every counter and restarts the clock.
    pub fn reset(&self) {
        let mut events = self.write();
        self.nodes_sequenced.store(0, Ordering::Relaxed);
        self.nodes_skipped.store(0, Ordering::Relaxed);
        self.nodes_failed.store(0, Ordering::Relaxed);
        self.tasks_rejected.store(0, Ordering::Relaxed);
        *events = EventCounters::new();
    }

    /// Copies the current counters.
    #[must_use]
    pub fn snapshot(&self) -> StatisticsSnapshot {
        let events = *self.read();
        StatisticsSnapshot {
            nodes_sequenced: self.nodes_sequenced.load(Ordering::Relaxed),
            nodes_skipped: self.nodes_skipped.load(Ordering::Relaxed),
            nodes_failed: self.nodes_failed.load(Ordering::Relaxed),
            tasks_rejected: self.tasks_rejected.load(Ordering::Relaxed),
            events_enqueued: events.events_enqueued,
            events_skipped: events.events_skipped,
            events_ignored: events.events_ignored,
            batches_enqueued: events.batches_enqueued,
            batches_ignored: events.batches_ignored,
            nodes_enqueued: events.nodes_enqueued,
            start_time: events.start_time,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = Statistics::new();
        stats.record_node_sequenced();
        stats.record_node_sequenced();
        stats.record_node_skipped();
        stats.record_node_failed();
        stats.record_task_rejected();
        stats.record_events(3, 1);
        stats.record_events(2, 0);
        stats.record_events_ignored(7);
        stats.record_nodes_enqueued(4);

        let snap = stats.snapshot();
        assert_eq!(snap.nodes_sequenced, 2);
        assert_eq!(snap.nodes_skipped, 1);
        assert_eq!(snap.nodes_failed, 1);
        assert_eq!(snap.tasks_rejected, 1);
        assert_eq!(snap.events_enqueued, 5);
        assert_eq!(snap.events_skipped, 1);
        assert_eq!(snap.batches_enqueued, 2);
        assert_eq!(snap.events_ignored, 7);
        assert_eq!(snap.batches_ignored, 1);
        assert_eq!(snap.nodes_enqueued, 4);
    }

    #[test]
    fn test_reset_zeroes_and_restarts_clock() {
        let stats = Statistics::new();
        let started = stats.snapshot().start_time;
        stats.record_node_sequenced();
        stats.record_events(1, 1);
        stats.reset();

        let snap = stats.snapshot();
        assert_eq!(snap.nodes_sequenced, 0);
        assert_eq!(snap.events_enqueued, 0);
        assert_eq!(snap.batches_enqueued, 0);
        assert!(snap.start_time >= started);
    }

    #[test]
    fn test_batches_are_never_torn() {
        let stats = Arc::new(Statistics::new());
        let writer = {
            let stats = Arc::clone(&stats);
            thread::spawn(move || {
                for _ in 0..1000 {
                    stats.record_events(2, 1);
                }
            })
        };
        for _ in 0..1000 {
            let snap = stats.snapshot();
            assert_eq!(snap.events_enqueued, snap.batches_enqueued * 2);
            assert_eq!(snap.events_skipped, snap.batches_enqueued);
        }
        writer.join().unwrap();
        assert_eq!(stats.snapshot().batches_enqueued, 1000);
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = Statistics::new();
        stats.record_node_sequenced();
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["nodes_sequenced"], 1);
        assert!(json["start_time"].is_string());
    }
}
