//! Thread-pool runtime for the front-end.
//!
//! Two pools are built from [`Scheduler`]: a fixed one-thread pool that runs
//! the accept loop and a dynamic pool that runs one task per client
//! connection for the lifetime of that connection.
//!
//! ```text
//!   post(task) ──► bounded queue ──► worker 1 ┐
//!                                 ├─► worker 2 ├── idle > timeout and above floor → exit
//!                                 └─► worker N ┘
//! ```

pub mod metrics;
pub mod scheduler;
pub mod worker;

pub use metrics::SchedulerStats;
pub use scheduler::{Scheduler, SchedulerOptions, Task, HARD_MIN_WORKERS, INIT_RETRY_BACKOFF};
pub use worker::{NoopHooks, SchedulerMonitor, WorkerId, WorkerLifecycle};
