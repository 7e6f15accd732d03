//! Dynamic thread-pool scheduler.
//!
//! A [`Scheduler`] runs opaque tasks on a pool of OS threads whose size floats
//! between a floor and a ceiling:
//!
//! - [`Scheduler::launch`] starts the floor.
//! - [`Scheduler::post`] queues a task and adds a thread when queued work
//!   outnumbers idle workers and the pool is below its ceiling.
//! - A worker above the floor that stays idle for the idle timeout exits.
//! - [`Scheduler::stop`] wakes every worker; each finishes its current task
//!   and exits. Tasks still queued are dropped.
//! - A worker whose thread init fails gives up its slot and, after
//!   [`INIT_RETRY_BACKOFF`], starts a replacement while the pool is below its
//!   floor.
//!
//! The task queue is a bounded crossbeam channel. Stop is broadcast by
//! dropping the only sender of a second channel, which disconnects it for
//! every waiting worker at once.

use crate::runtime::{
    metrics::{SchedulerCounters, SchedulerStats},
    worker::{NoopHooks, SchedulerMonitor, WorkerId, WorkerLifecycle},
};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};
use tracing::{debug, error, info, trace, warn};

/// The pool never runs fewer workers than this once launched.
pub const HARD_MIN_WORKERS: u32 = 1;

/// Wait before replacing a worker whose thread init failed.
pub const INIT_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Unit of work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Construction parameters.
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Thread name; multi-thread pools append the worker number
    pub name: String,
    pub min_workers: u32,
    pub max_workers: u32,
    pub idle_timeout: Duration,
    pub queue_capacity: usize,
}

impl SchedulerOptions {
    /// Fixed single-thread pool.
    #[must_use]
    pub fn single(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            min_workers: 1,
            max_workers: 1,
            idle_timeout: Duration::from_secs(60),
            queue_capacity: 64,
        }
    }
}

struct Inner {
    name: String,
    max_workers: u32,
    min_workers: AtomicU32,
    idle_timeout_ms: AtomicU64,

    task_tx: Sender<Task>,
    task_rx: Receiver<Task>,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,

    running: AtomicBool,
    stopped: AtomicBool,

    workers: AtomicU32,
    idle: AtomicU32,
    active: AtomicU32,
    next_worker_id: AtomicUsize,
    handles: Mutex<Vec<JoinHandle<()>>>,

    lifecycle: Arc<dyn WorkerLifecycle>,
    monitor: Arc<dyn SchedulerMonitor>,
    counters: SchedulerCounters,
}

enum Wake {
    Task(Task),
    Shutdown,
    IdleTimeout,
}

/// Dynamic pool of named worker threads.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Pool without lifecycle hooks or monitoring.
    #[must_use]
    pub fn new(options: SchedulerOptions) -> Self {
        Self::with_hooks(options, Arc::new(NoopHooks), Arc::new(NoopHooks))
    }

    /// Pool calling `lifecycle` on each thread and reporting to `monitor`.
    #[must_use]
    pub fn with_hooks(
        options: SchedulerOptions,
        lifecycle: Arc<dyn WorkerLifecycle>,
        monitor: Arc<dyn SchedulerMonitor>,
    ) -> Self {
        let max_workers = options.max_workers.max(HARD_MIN_WORKERS);
        let min_workers = options.min_workers.clamp(HARD_MIN_WORKERS, max_workers);
        let (task_tx, task_rx) = channel::bounded(options.queue_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = channel::bounded(0);

        Self {
            inner: Arc::new(Inner {
                name: options.name,
                max_workers,
                min_workers: AtomicU32::new(min_workers),
                idle_timeout_ms: AtomicU64::new(duration_to_millis(options.idle_timeout)),
                task_tx,
                task_rx,
                shutdown_tx: Mutex::new(Some(shutdown_tx)),
                shutdown_rx,
                running: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                workers: AtomicU32::new(0),
                idle: AtomicU32::new(0),
                active: AtomicU32::new(0),
                next_worker_id: AtomicUsize::new(1),
                handles: Mutex::new(Vec::new()),
                lifecycle,
                monitor,
                counters: SchedulerCounters::default(),
            }),
        }
    }

    /// Start the floor of workers. Has no effect once stopped.
    pub fn launch(&self) {
        if self.inner.stopped.load(Ordering::SeqCst) {
            warn!(scheduler = %self.inner.name, "Launch after stop ignored");
            return;
        }
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let floor = self.inner.min_workers.load(Ordering::SeqCst);
        for _ in 0..floor {
            Inner::spawn_below(&self.inner, floor);
        }
        info!(scheduler = %self.inner.name, workers = floor, "Scheduler launched");
    }

    /// Queue a task.
    ///
    /// Returns `false` and drops the task when the scheduler is not running
    /// or the queue is full.
    pub fn post<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.is_running() {
            self.inner.counters.record_refused();
            debug!(scheduler = %self.inner.name, "Post refused, scheduler not running");
            return false;
        }

        match self.inner.task_tx.try_send(Box::new(task)) {
            Ok(()) => {
                self.inner.counters.record_posted();
                if self.inner.task_rx.len() > self.inner.idle.load(Ordering::SeqCst) as usize {
                    Inner::spawn_below(&self.inner, self.inner.max_workers);
                }
                true
            },
            Err(TrySendError::Full(_)) => {
                self.inner.counters.record_refused();
                warn!(scheduler = %self.inner.name, "Task queue full, post refused");
                false
            },
            Err(TrySendError::Disconnected(_)) => {
                self.inner.counters.record_refused();
                false
            },
        }
    }

    /// Stop every worker.
    ///
    /// Idempotent. Joins all workers except the calling thread, so it is safe
    /// to call from inside a task of this same scheduler.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.running.store(false, Ordering::SeqCst);
        drop(self.inner.shutdown_tx.lock().take());

        let current = thread::current().id();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.handles.lock());
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!(scheduler = %self.inner.name, "Worker thread terminated abnormally");
            }
        }

        let mut discarded = 0u64;
        while self.inner.task_rx.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            self.inner.counters.record_discarded(discarded);
            warn!(scheduler = %self.inner.name, discarded, "Dropped queued tasks at stop");
        }

        info!(scheduler = %self.inner.name, "Scheduler stopped");
    }

    /// Set the worker floor. The value is clamped to
    /// `[HARD_MIN_WORKERS, max_workers]`; the applied value is returned and,
    /// when running, missing workers are started.
    pub fn set_num_workers(&self, min_workers: u32) -> u32 {
        let applied = min_workers.clamp(HARD_MIN_WORKERS, self.inner.max_workers);
        let previous = self.inner.min_workers.swap(applied, Ordering::SeqCst);
        if applied != min_workers {
            warn!(
                scheduler = %self.inner.name,
                requested = min_workers,
                applied,
                "Worker floor clamped"
            );
        }

        if self.is_running() && applied > previous {
            while self.inner.workers.load(Ordering::SeqCst) < applied {
                if !Inner::spawn_below(&self.inner, applied) {
                    break;
                }
            }
        }
        applied
    }

    /// Change how long an idle worker above the floor waits before exiting.
    pub fn set_idle_worker_timeout(&self, timeout: Duration) {
        self.inner.idle_timeout_ms.store(duration_to_millis(timeout), Ordering::SeqCst);
        debug!(scheduler = %self.inner.name, ?timeout, "Idle worker timeout updated");
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[must_use]
    pub fn min_workers(&self) -> u32 {
        self.inner.min_workers.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn max_workers(&self) -> u32 {
        self.inner.max_workers
    }

    /// Current snapshot of pool size and counters.
    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        let mut stats = SchedulerStats {
            workers: self.inner.workers.load(Ordering::SeqCst),
            idle_workers: self.inner.idle.load(Ordering::SeqCst),
            active_tasks: self.inner.active.load(Ordering::SeqCst),
            queued_tasks: self.inner.task_rx.len(),
            min_workers: self.min_workers(),
            max_workers: self.inner.max_workers,
            ..SchedulerStats::default()
        };
        self.inner.counters.fill(&mut stats);
        stats
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.inner.name)
            .field("running", &self.is_running())
            .field("stats", &self.stats())
            .finish()
    }
}

impl Inner {
    /// Reserve a slot below `limit` and start a thread in it.
    fn spawn_below(this: &Arc<Self>, limit: u32) -> bool {
        if this.stopped.load(Ordering::SeqCst) {
            return false;
        }
        let reserved = this
            .workers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < limit).then_some(n + 1))
            .is_ok();
        if !reserved {
            return false;
        }

        let id = WorkerId::new(this.next_worker_id.fetch_add(1, Ordering::SeqCst));
        let thread_name =
            if this.max_workers == 1 { this.name.clone() } else { format!("{}{}", this.name, id) };
        let worker = Arc::clone(this);

        match thread::Builder::new().name(thread_name).spawn(move || worker.run(id)) {
            Ok(handle) => {
                this.counters.record_spawned();
                let mut handles = this.handles.lock();
                handles.retain(|h| !h.is_finished());
                handles.push(handle);
                true
            },
            Err(e) => {
                this.workers.fetch_sub(1, Ordering::SeqCst);
                error!(scheduler = %this.name, "Failed to spawn worker thread: {}", e);
                false
            },
        }
    }

    fn run(self: Arc<Self>, id: WorkerId) {
        if !self.lifecycle.thread_init() {
            warn!(scheduler = %self.name, worker = %id, "Worker initialization failed");
            self.replace_failed_worker();
            return;
        }
        self.monitor.on_worker_thread_create();
        trace!(scheduler = %self.name, worker = %id, "Worker started");

        let retired_by_idle = loop {
            if self.stopped.load(Ordering::SeqCst) {
                break false;
            }

            match self.wait_for_work() {
                Wake::Task(task) => self.execute(id, task),
                Wake::Shutdown => break false,
                Wake::IdleTimeout => {
                    if self.try_retire() {
                        break true;
                    }
                },
            }
        };

        if !retired_by_idle {
            self.workers.fetch_sub(1, Ordering::SeqCst);
        }
        self.counters.record_retired();
        self.monitor.on_worker_thread_destroy();
        self.lifecycle.thread_end();
        trace!(scheduler = %self.name, worker = %id, idle = retired_by_idle, "Worker exited");
    }

    fn wait_for_work(&self) -> Wake {
        let timeout = Duration::from_millis(self.idle_timeout_ms.load(Ordering::SeqCst));
        self.idle.fetch_add(1, Ordering::SeqCst);
        let wake = channel::select! {
            recv(self.task_rx) -> msg => msg.map_or(Wake::Shutdown, Wake::Task),
            recv(self.shutdown_rx) -> _ => Wake::Shutdown,
            default(timeout) => Wake::IdleTimeout,
        };
        self.idle.fetch_sub(1, Ordering::SeqCst);
        wake
    }

    fn execute(&self, id: WorkerId, task: Task) {
        self.active.fetch_add(1, Ordering::SeqCst);
        self.monitor.on_task_start();

        let panicked = panic::catch_unwind(AssertUnwindSafe(task)).is_err();
        if panicked {
            error!(scheduler = %self.name, worker = %id, "Task panicked");
        }

        self.monitor.on_task_end();
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.counters.record_completed(panicked);
    }

    /// Give up the slot of a worker that never started, then refill the
    /// floor once the backoff passes. Stop cuts the backoff short.
    fn replace_failed_worker(self: Arc<Self>) {
        self.workers.fetch_sub(1, Ordering::SeqCst);
        self.counters.record_retired();

        // The shutdown channel only ever disconnects
        let timed_out = matches!(
            self.shutdown_rx.recv_timeout(INIT_RETRY_BACKOFF),
            Err(RecvTimeoutError::Timeout)
        );
        if !timed_out || self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let floor = self.min_workers.load(Ordering::SeqCst);
        if self.workers.load(Ordering::SeqCst) < floor && Self::spawn_below(&self, floor) {
            debug!(scheduler = %self.name, "Replacement worker started");
        }
    }

    /// Leave the pool only while it stays at or above the floor.
    fn try_retire(&self) -> bool {
        let floor = self.min_workers.load(Ordering::SeqCst);
        self.workers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n > floor).then(|| n - 1))
            .is_ok()
    }
}

fn duration_to_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn options(min: u32, max: u32) -> SchedulerOptions {
        SchedulerOptions {
            name: "test_worker".to_string(),
            min_workers: min,
            max_workers: max,
            idle_timeout: Duration::from_millis(50),
            queue_capacity: 16,
        }
    }

    fn wait_until(deadline: Duration, mut f: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if f() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        f()
    }

    #[test]
    fn test_post_runs_task() {
        let scheduler = Scheduler::new(options(1, 4));
        scheduler.launch();

        let (tx, rx) = channel::bounded(1);
        assert!(scheduler.post(move || tx.send(7).unwrap()));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);

        scheduler.stop();
    }

    #[test]
    fn test_post_before_launch_and_after_stop_refused() {
        let scheduler = Scheduler::new(options(1, 2));
        assert!(!scheduler.post(|| {}));

        scheduler.launch();
        scheduler.stop();
        assert!(!scheduler.post(|| {}));
        assert_eq!(scheduler.stats().tasks_refused, 2);
    }

    #[test]
    fn test_full_queue_refuses() {
        let scheduler = Scheduler::new(SchedulerOptions { queue_capacity: 1, ..options(1, 1) });
        scheduler.launch();

        let (block_tx, block_rx) = channel::bounded::<()>(0);
        let (started_tx, started_rx) = channel::bounded(1);
        assert!(scheduler.post(move || {
            started_tx.send(()).unwrap();
            let _ = block_rx.recv();
        }));
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        assert!(scheduler.post(|| {}));
        assert!(!scheduler.post(|| {}));

        drop(block_tx);
        scheduler.stop();
    }

    #[test]
    fn test_floor_is_clamped() {
        let scheduler = Scheduler::new(options(2, 8));
        assert_eq!(scheduler.set_num_workers(0), HARD_MIN_WORKERS);
        assert_eq!(scheduler.set_num_workers(100), 8);
        assert_eq!(scheduler.set_num_workers(3), 3);
        assert_eq!(scheduler.min_workers(), 3);
    }

    #[test]
    fn test_pool_grows_and_shrinks_to_floor() {
        let scheduler = Scheduler::new(options(1, 4));
        scheduler.launch();

        let (release_tx, release_rx) = channel::bounded::<()>(0);
        let started = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let release_rx = release_rx.clone();
            let started = Arc::clone(&started);
            assert!(scheduler.post(move || {
                started.fetch_add(1, Ordering::SeqCst);
                let _ = release_rx.recv();
            }));
        }

        assert!(wait_until(Duration::from_secs(5), || started.load(Ordering::SeqCst) == 3));
        assert!(scheduler.stats().workers >= 3);

        drop(release_tx);
        assert!(wait_until(Duration::from_secs(5), || scheduler.stats().workers == 1));
        thread::sleep(Duration::from_millis(150));
        assert_eq!(scheduler.stats().workers, 1);

        scheduler.stop();
    }

    #[test]
    fn test_raising_floor_spawns_workers() {
        let scheduler = Scheduler::new(options(1, 4));
        scheduler.launch();
        assert_eq!(scheduler.set_num_workers(3), 3);
        assert!(wait_until(Duration::from_secs(5), || scheduler.stats().workers == 3));
        scheduler.stop();
    }

    #[test]
    fn test_stop_is_idempotent_and_joins() {
        let scheduler = Scheduler::new(options(2, 2));
        scheduler.launch();
        scheduler.stop();
        scheduler.stop();
        assert_eq!(scheduler.stats().workers, 0);
    }

    #[test]
    fn test_stop_from_own_task() {
        let scheduler = Scheduler::new(SchedulerOptions::single("self_stop"));
        scheduler.launch();

        let (tx, rx) = channel::bounded(1);
        let handle = scheduler.clone();
        assert!(scheduler.post(move || {
            handle.stop();
            tx.send(()).unwrap();
        }));

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(!scheduler.is_running());
    }

    #[test]
    fn test_panicking_task_keeps_worker() {
        let scheduler = Scheduler::new(options(1, 1));
        scheduler.launch();
        assert!(scheduler.post(|| panic!("boom")));

        let (tx, rx) = channel::bounded(1);
        assert!(scheduler.post(move || tx.send(()).unwrap()));
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        assert_eq!(scheduler.stats().tasks_panicked, 1);
        scheduler.stop();
    }

    #[derive(Default)]
    struct Recorder {
        created: AtomicUsize,
        destroyed: AtomicUsize,
        tasks: AtomicUsize,
        /// Thread inits still to fail
        refusals: AtomicUsize,
        ended: AtomicUsize,
    }

    impl WorkerLifecycle for Recorder {
        fn thread_init(&self) -> bool {
            self.refusals
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_err()
        }

        fn thread_end(&self) {
            self.ended.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl SchedulerMonitor for Recorder {
        fn on_worker_thread_create(&self) {
            self.created.fetch_add(1, Ordering::SeqCst);
        }

        fn on_worker_thread_destroy(&self) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }

        fn on_task_end(&self) {
            self.tasks.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_hooks_are_called() {
        let recorder = Arc::new(Recorder::default());
        let scheduler = Scheduler::with_hooks(options(2, 2), recorder.clone(), recorder.clone());
        scheduler.launch();

        let (tx, rx) = channel::bounded(1);
        assert!(scheduler.post(move || tx.send(()).unwrap()));
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        scheduler.stop();

        assert_eq!(recorder.created.load(Ordering::SeqCst), 2);
        assert_eq!(recorder.destroyed.load(Ordering::SeqCst), 2);
        assert_eq!(recorder.ended.load(Ordering::SeqCst), 2);
        assert_eq!(recorder.tasks.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_thread_init_is_replaced_up_to_floor() {
        let recorder =
            Arc::new(Recorder { refusals: AtomicUsize::new(3), ..Recorder::default() });
        let scheduler = Scheduler::with_hooks(options(2, 2), recorder.clone(), recorder.clone());
        scheduler.launch();

        assert!(wait_until(Duration::from_secs(5), || {
            recorder.created.load(Ordering::SeqCst) == 2
        }));
        assert_eq!(scheduler.stats().workers, 2);
        assert_eq!(recorder.refusals.load(Ordering::SeqCst), 0);

        let (tx, rx) = channel::bounded(1);
        assert!(scheduler.post(move || tx.send(()).unwrap()));
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        scheduler.stop();

        // Workers that failed init never ran the end hook
        assert_eq!(recorder.ended.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_failing_thread_init_stops_cleanly() {
        let recorder =
            Arc::new(Recorder { refusals: AtomicUsize::new(usize::MAX), ..Recorder::default() });
        let scheduler = Scheduler::with_hooks(options(1, 1), recorder.clone(), recorder.clone());
        scheduler.launch();

        thread::sleep(INIT_RETRY_BACKOFF * 3);
        scheduler.stop();

        assert_eq!(recorder.created.load(Ordering::SeqCst), 0);
        assert_eq!(recorder.ended.load(Ordering::SeqCst), 0);
        assert!(wait_until(Duration::from_secs(5), || scheduler.stats().workers == 0));
    }
}
