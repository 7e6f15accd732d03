//! Shutdown coordination.
//!
//! Shutdown is requested by raising the [`ExitFlag`] or by the engine
//! reporting termination. The acceptor's one-second timer polls both and
//! drives the [`ShutdownCoordinator`] through
//!
//! ```text
//! Running ──► VerifyRequested ──► Stopping ──► Stopped
//!    └────────────────────────────────┘
//!        (direct stop from any thread)
//! ```
//!
//! Every transition moves forward only, so concurrent stop requests agree on
//! a single winner.

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::{
    atomic::{AtomicBool, AtomicU8, Ordering},
    Arc,
};
use std::time::Duration;
use tracing::debug;

/// Process-wide request to leave. Clones share the flag.
#[derive(Debug, Clone, Default)]
pub struct ExitFlag(Arc<AtomicBool>);

impl ExitFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Coordinator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ShutdownState {
    Running = 0,
    VerifyRequested = 1,
    Stopping = 2,
    Stopped = 3,
}

impl ShutdownState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Running,
            1 => Self::VerifyRequested,
            2 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

impl fmt::Display for ShutdownState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::VerifyRequested => write!(f, "verify_requested"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Forward-only shutdown state machine.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    state: AtomicU8,
    stopped_lock: Mutex<()>,
    stopped_cv: Condvar,
}

impl ShutdownCoordinator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ShutdownState::Running as u8),
            stopped_lock: Mutex::new(()),
            stopped_cv: Condvar::new(),
        }
    }

    #[must_use]
    pub fn state(&self) -> ShutdownState {
        ShutdownState::from_u8(self.state.load(Ordering::SeqCst))
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == ShutdownState::Running
    }

    /// One timer step. Returns `true` exactly once: on the first tick that
    /// observes a shutdown request while still running.
    pub fn poll(&self, exit_requested: bool, terminating: bool) -> bool {
        if !(exit_requested || terminating) {
            return false;
        }
        let won = self.advance(ShutdownState::Running, ShutdownState::VerifyRequested);
        if won {
            debug!(exit_requested, terminating, "Shutdown verification requested");
        }
        won
    }

    /// Claim the stop. Only the first caller gets `true`.
    pub fn begin_stop(&self) -> bool {
        self.advance(ShutdownState::Running, ShutdownState::Stopping)
            || self.advance(ShutdownState::VerifyRequested, ShutdownState::Stopping)
    }

    /// Enter the terminal state and wake waiters.
    pub fn mark_stopped(&self) {
        let _guard = self.stopped_lock.lock();
        self.state.store(ShutdownState::Stopped as u8, Ordering::SeqCst);
        self.stopped_cv.notify_all();
    }

    /// Block until stopped or `timeout` elapses. Returns whether stopped.
    pub fn wait_stopped(&self, timeout: Duration) -> bool {
        let mut guard = self.stopped_lock.lock();
        if self.state() == ShutdownState::Stopped {
            return true;
        }
        let _ = self
            .stopped_cv
            .wait_while_for(&mut guard, |_| self.state() != ShutdownState::Stopped, timeout);
        self.state() == ShutdownState::Stopped
    }

    fn advance(&self, from: ShutdownState, to: ShutdownState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_poll_without_request_keeps_running() {
        let coordinator = ShutdownCoordinator::new();
        assert!(!coordinator.poll(false, false));
        assert_eq!(coordinator.state(), ShutdownState::Running);
    }

    #[test]
    fn test_poll_fires_once() {
        let coordinator = ShutdownCoordinator::new();
        assert!(coordinator.poll(true, false));
        assert!(!coordinator.poll(true, false));
        assert!(!coordinator.poll(false, true));
        assert_eq!(coordinator.state(), ShutdownState::VerifyRequested);
    }

    #[test]
    fn test_full_sequence() {
        let coordinator = ShutdownCoordinator::new();
        assert!(coordinator.poll(false, true));
        assert!(coordinator.begin_stop());
        assert_eq!(coordinator.state(), ShutdownState::Stopping);
        coordinator.mark_stopped();
        assert_eq!(coordinator.state(), ShutdownState::Stopped);
        assert!(!coordinator.begin_stop());
        assert!(!coordinator.poll(true, true));
    }

    #[test]
    fn test_concurrent_stop_has_one_winner() {
        let coordinator = Arc::new(ShutdownCoordinator::new());
        let winners = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let coordinator = Arc::clone(&coordinator);
                let winners = Arc::clone(&winners);
                thread::spawn(move || {
                    if coordinator.begin_stop() {
                        winners.fetch_add(1, Ordering::SeqCst);
                        coordinator.mark_stopped();
                    } else {
                        assert!(coordinator.wait_stopped(Duration::from_secs(5)));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(winners.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.state(), ShutdownState::Stopped);
    }

    #[test]
    fn test_exit_flag_shared() {
        let flag = ExitFlag::new();
        let clone = flag.clone();
        clone.set();
        assert!(flag.is_set());
        flag.clear();
        assert!(!clone.is_set());
    }
}
