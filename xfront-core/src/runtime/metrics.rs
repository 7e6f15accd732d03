//! Scheduler counters.
//!
//! Each counter is an independent atomic; a [`SchedulerStats`] snapshot is not
//! a consistent cut across counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Cumulative counters maintained by a [`crate::runtime::Scheduler`].
#[derive(Debug, Default)]
pub struct SchedulerCounters {
    tasks_posted: AtomicU64,
    tasks_refused: AtomicU64,
    tasks_completed: AtomicU64,
    tasks_panicked: AtomicU64,
    tasks_discarded: AtomicU64,
    workers_spawned: AtomicU64,
    workers_retired: AtomicU64,
}

impl SchedulerCounters {
    pub(crate) fn record_posted(&self) {
        self.tasks_posted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_refused(&self) {
        self.tasks_refused.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_completed(&self, panicked: bool) {
        self.tasks_completed.fetch_add(1, Ordering::Relaxed);
        if panicked {
            self.tasks_panicked.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_discarded(&self, n: u64) {
        self.tasks_discarded.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn record_spawned(&self) {
        self.workers_spawned.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retired(&self) {
        self.workers_retired.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time view of a scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Live worker threads
    pub workers: u32,
    /// Workers waiting for a task
    pub idle_workers: u32,
    /// Tasks currently executing
    pub active_tasks: u32,
    /// Tasks waiting in the queue
    pub queued_tasks: usize,
    /// Floor currently applied to the pool
    pub min_workers: u32,
    /// Ceiling of the pool
    pub max_workers: u32,
    pub tasks_posted: u64,
    /// Posts refused because the scheduler was stopped or the queue was full
    pub tasks_refused: u64,
    pub tasks_completed: u64,
    pub tasks_panicked: u64,
    /// Queued tasks dropped at stop
    pub tasks_discarded: u64,
    pub workers_spawned: u64,
    pub workers_retired: u64,
}

impl SchedulerCounters {
    pub(crate) fn fill(&self, stats: &mut SchedulerStats) {
        stats.tasks_posted = self.tasks_posted.load(Ordering::Relaxed);
        stats.tasks_refused = self.tasks_refused.load(Ordering::Relaxed);
        stats.tasks_completed = self.tasks_completed.load(Ordering::Relaxed);
        stats.tasks_panicked = self.tasks_panicked.load(Ordering::Relaxed);
        stats.tasks_discarded = self.tasks_discarded.load(Ordering::Relaxed);
        stats.workers_spawned = self.workers_spawned.load(Ordering::Relaxed);
        stats.workers_retired = self.workers_retired.load(Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_fill_snapshot() {
        let counters = SchedulerCounters::default();
        counters.record_posted();
        counters.record_posted();
        counters.record_refused();
        counters.record_completed(false);
        counters.record_completed(true);
        counters.record_discarded(3);
        counters.record_spawned();

        let mut stats = SchedulerStats::default();
        counters.fill(&mut stats);

        assert_eq!(stats.tasks_posted, 2);
        assert_eq!(stats.tasks_refused, 1);
        assert_eq!(stats.tasks_completed, 2);
        assert_eq!(stats.tasks_panicked, 1);
        assert_eq!(stats.tasks_discarded, 3);
        assert_eq!(stats.workers_spawned, 1);
        assert_eq!(stats.workers_retired, 0);
    }
}
