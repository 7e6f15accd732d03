//! Capabilities the front-end consumes from the database engine.
//!
//! The front-end never executes statements itself. It asks an [`Engine`]
//! for readiness, startup settings and new sessions, and reaches an open
//! session only through its [`DataContext`] (owned by the worker serving the
//! connection) or its [`SessionProbe`] (shared with other threads).

pub mod local;

pub use local::{LocalEngine, LocalUser};

use crate::shutdown::ExitFlag;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};
use xfront_core::config::TlsSettings;

/// Interval between readiness checks during startup.
pub const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Errors reported by the engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Engine is not ready")]
    NotReady,

    #[error("Access denied for user '{0}'")]
    AccessDenied(String),

    #[error("Unknown session {0}")]
    UnknownSession(u64),

    #[error("You are not owner of session {0}")]
    KillDenied(u64),

    #[error("Engine error: {0}")]
    Other(String),
}

/// Settings read from the engine once, before listeners are opened.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkSettings {
    /// Only the local socket may be opened
    pub skip_networking: bool,
    /// Peers are identified by address only
    pub skip_name_resolve: bool,
    /// The engine itself has TLS enabled
    pub have_tls: bool,
    /// Engine-wide TLS material
    pub tls: TlsSettings,
    /// Permitted protocol versions, e.g. `TLSv1.2,TLSv1.3`
    pub tls_version: Option<String>,
}

/// Read-only view of a session, safe to share across threads.
pub trait SessionProbe: Send + Sync {
    /// Engine-side session id
    fn session_id(&self) -> u64;

    /// Whether the engine has marked the session killed
    fn is_killed(&self) -> bool;
}

/// Execution handle of one authenticated session.
pub trait DataContext: Send {
    fn session_id(&self) -> u64;

    fn user(&self) -> &str;

    fn probe(&self) -> Arc<dyn SessionProbe>;

    /// Ask the engine to kill another session on behalf of this one.
    ///
    /// # Errors
    /// Returns the engine's refusal, e.g. [`EngineError::KillDenied`].
    fn execute_kill_session(&mut self, session_id: u64) -> Result<(), EngineError>;
}

/// Database engine as seen from the network front-end.
pub trait Engine: Send + Sync {
    /// Whether the engine accepts sessions yet
    fn is_ready(&self) -> bool;

    /// Host-initiated shutdown in progress
    fn is_terminating(&self) -> bool {
        false
    }

    /// Per-thread engine setup, run on every worker thread. `false` aborts the thread.
    fn init_thread(&self) -> bool {
        true
    }

    fn deinit_thread(&self) {}

    /// # Errors
    /// Returns an error when the settings cannot be read.
    fn network_settings(&self) -> Result<NetworkSettings, EngineError>;

    /// Grant statements of `account`, one per entry.
    ///
    /// # Errors
    /// Returns an error when the account cannot be inspected.
    fn show_grants(&self, account: &str) -> Result<Vec<String>, EngineError>;

    /// Give `account` the grants the front-end needs.
    ///
    /// # Errors
    /// Returns an error when the grants cannot be applied.
    fn apply_default_grants(&self, account: &str) -> Result<(), EngineError>;

    /// Authenticate and open a session.
    ///
    /// # Errors
    /// Returns [`EngineError::AccessDenied`] for bad credentials.
    fn open_session(&self, user: &str, credential: &str)
        -> Result<Box<dyn DataContext>, EngineError>;
}

/// Poll `engine` until it is ready.
///
/// Gives up once `timeout` elapses or as soon as `exit` is raised.
///
/// # Errors
/// Returns [`xfront_core::Error::ServiceNotReady`] in both cases.
pub fn wait_until_ready(
    engine: &dyn Engine,
    timeout: Duration,
    exit: &ExitFlag,
) -> xfront_core::Result<()> {
    let deadline = Instant::now() + timeout;
    let mut attempts = 0u32;

    loop {
        if engine.is_ready() {
            debug!(attempts, "Engine ready");
            return Ok(());
        }
        if exit.is_set() {
            return Err(xfront_core::Error::ServiceNotReady {
                message: "exit requested while waiting for the engine".into(),
            });
        }
        if Instant::now() >= deadline {
            return Err(xfront_core::Error::ServiceNotReady {
                message: format!("engine not ready after {attempts} checks"),
            });
        }

        attempts += 1;
        if attempts == 1 {
            info!("Waiting for the engine to become ready");
        }
        std::thread::sleep(READY_POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_wait_until_ready_immediate() {
        let engine = LocalEngine::new();
        assert!(wait_until_ready(&engine, Duration::from_millis(100), &ExitFlag::new()).is_ok());
    }

    #[test]
    fn test_wait_until_ready_times_out() {
        let engine = LocalEngine::new();
        engine.set_ready(false);

        let start = Instant::now();
        let result = wait_until_ready(&engine, Duration::from_millis(250), &ExitFlag::new());
        assert!(matches!(result, Err(xfront_core::Error::ServiceNotReady { .. })));
        assert!(start.elapsed() >= Duration::from_millis(250));
    }

    #[test]
    fn test_wait_until_ready_late_readiness() {
        let engine = LocalEngine::new();
        engine.set_ready(false);

        let flip = engine.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(150));
            flip.set_ready(true);
        });

        assert!(wait_until_ready(&engine, Duration::from_secs(5), &ExitFlag::new()).is_ok());
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_until_ready_aborts_on_exit() {
        let engine = LocalEngine::new();
        engine.set_ready(false);
        let exit = ExitFlag::new();
        exit.set();

        let start = Instant::now();
        assert!(wait_until_ready(&engine, Duration::from_secs(10), &exit).is_err());
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
