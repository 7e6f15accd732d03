//! Worker identity and the hooks a scheduler calls around its threads.

use std::fmt;

/// Worker thread identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId {
    id: usize,
}

impl WorkerId {
    /// Create a new worker ID
    #[must_use]
    pub const fn new(id: usize) -> Self {
        Self { id }
    }

    /// Get the numeric ID
    #[must_use]
    pub const fn id(&self) -> usize {
        self.id
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// Per-thread setup and teardown.
///
/// `thread_init` runs on the new thread before it takes any task; returning
/// `false` makes the worker exit immediately and `thread_end` is not called.
pub trait WorkerLifecycle: Send + Sync {
    fn thread_init(&self) -> bool {
        true
    }

    fn thread_end(&self) {}
}

/// Observer of worker and task activity.
pub trait SchedulerMonitor: Send + Sync {
    fn on_worker_thread_create(&self) {}
    fn on_worker_thread_destroy(&self) {}
    fn on_task_start(&self) {}
    fn on_task_end(&self) {}
}

/// Lifecycle and monitor that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl WorkerLifecycle for NoopHooks {}
impl SchedulerMonitor for NoopHooks {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_id_creation() {
        let worker_id = WorkerId::new(42);
        assert_eq!(worker_id.id(), 42);
        assert_eq!(worker_id.to_string(), "42");
    }

    #[test]
    fn test_noop_lifecycle_accepts() {
        assert!(WorkerLifecycle::thread_init(&NoopHooks));
    }
}
