//! Global status counters.
//!
//! Every counter is an independent atomic. A [`StatusSnapshot`] reads them
//! one after another, so two counters in the same snapshot need not agree
//! with each other (e.g. `closed` may briefly exceed `accepted` after a reset).

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use xfront_core::runtime::SchedulerMonitor;

/// Counters for connections and session workers.
#[derive(Debug, Default)]
pub struct GlobalStatus {
    accepted_connections: AtomicU64,
    closed_connections: AtomicU64,
    rejected_connections: AtomicU64,
    connection_errors: AtomicU64,
    connection_accept_errors: AtomicU64,
    worker_threads: AtomicI64,
    active_worker_threads: AtomicI64,
}

/// Values read from [`GlobalStatus`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub accepted_connections: u64,
    pub closed_connections: u64,
    pub rejected_connections: u64,
    pub connection_errors: u64,
    pub connection_accept_errors: u64,
    pub worker_threads: i64,
    pub active_worker_threads: i64,
}

impl GlobalStatus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_accepted(&self) {
        self.accepted_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_closed(&self) {
        self.closed_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// A failed `accept` counts as both a connection error and an accept error.
    pub fn record_accept_error(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
        self.connection_accept_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            accepted_connections: self.accepted_connections.load(Ordering::Relaxed),
            closed_connections: self.closed_connections.load(Ordering::Relaxed),
            rejected_connections: self.rejected_connections.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            connection_accept_errors: self.connection_accept_errors.load(Ordering::Relaxed),
            worker_threads: self.worker_threads.load(Ordering::Relaxed),
            active_worker_threads: self.active_worker_threads.load(Ordering::Relaxed),
        }
    }

    /// Zero the counters. The worker gauges describe threads and tasks that
    /// still exist, so they are kept.
    pub fn reset(&self) {
        self.accepted_connections.store(0, Ordering::Relaxed);
        self.closed_connections.store(0, Ordering::Relaxed);
        self.rejected_connections.store(0, Ordering::Relaxed);
        self.connection_errors.store(0, Ordering::Relaxed);
        self.connection_accept_errors.store(0, Ordering::Relaxed);
    }
}

impl SchedulerMonitor for GlobalStatus {
    fn on_worker_thread_create(&self) {
        self.worker_threads.fetch_add(1, Ordering::Relaxed);
    }

    fn on_worker_thread_destroy(&self) {
        self.worker_threads.fetch_sub(1, Ordering::Relaxed);
    }

    fn on_task_start(&self) {
        self.active_worker_threads.fetch_add(1, Ordering::Relaxed);
    }

    fn on_task_end(&self) {
        self.active_worker_threads.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_error_counts_twice() {
        let status = GlobalStatus::new();
        status.record_accept_error();
        let snapshot = status.snapshot();
        assert_eq!(snapshot.connection_errors, 1);
        assert_eq!(snapshot.connection_accept_errors, 1);
        assert_eq!(snapshot.rejected_connections, 0);
    }

    #[test]
    fn test_monitor_tracks_workers() {
        let status = GlobalStatus::new();
        status.on_worker_thread_create();
        status.on_worker_thread_create();
        status.on_task_start();
        status.on_worker_thread_destroy();

        let snapshot = status.snapshot();
        assert_eq!(snapshot.worker_threads, 1);
        assert_eq!(snapshot.active_worker_threads, 1);
    }

    #[test]
    fn test_reset_keeps_worker_threads() {
        let status = GlobalStatus::new();
        status.on_worker_thread_create();
        status.record_accepted();
        status.record_rejected();
        status.record_closed();

        status.reset();
        let snapshot = status.snapshot();
        assert_eq!(snapshot.worker_threads, 1);
        assert_eq!(snapshot.accepted_connections, 0);
        assert_eq!(snapshot.rejected_connections, 0);
        assert_eq!(snapshot.closed_connections, 0);
    }

    #[test]
    fn test_reset_during_running_task_keeps_gauge_non_negative() {
        let status = GlobalStatus::new();
        status.on_worker_thread_create();
        status.on_task_start();

        status.reset();
        assert_eq!(status.snapshot().active_worker_threads, 1);

        status.on_task_end();
        assert_eq!(status.snapshot().active_worker_threads, 0);
    }
}
