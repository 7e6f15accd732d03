//! Connection admission control.
//!
//! The limit check and the live-count increment happen inside one critical
//! section, so the number of admitted connections never exceeds the maximum,
//! not even transiently.

use crate::status::GlobalStatus;
use parking_lot::Mutex;
use std::fmt;
use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};
use tracing::{debug, warn};

/// Why an incoming connection was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// `accept` itself failed
    AcceptError,
    /// The live count is at the maximum, or the server is terminating
    TooManyConnections,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AcceptError => write!(f, "accept error"),
            Self::TooManyConnections => write!(f, "too many connections"),
        }
    }
}

/// Tracks admitted connections against the configured maximum.
#[derive(Debug)]
pub struct AdmissionController {
    live: Mutex<u32>,
    max_connections: AtomicU32,
    status: Arc<GlobalStatus>,
}

impl AdmissionController {
    #[must_use]
    pub fn new(max_connections: u32, status: Arc<GlobalStatus>) -> Self {
        Self { live: Mutex::new(0), max_connections: AtomicU32::new(max_connections), status }
    }

    /// Admit one connection if the limit allows and the server is not terminating.
    pub fn will_accept(&self, terminating: bool) -> bool {
        let mut live = self.live.lock();
        if terminating || *live >= self.max_connections.load(Ordering::SeqCst) {
            return false;
        }
        *live += 1;
        true
    }

    pub fn did_accept(&self) {
        self.status.record_accepted();
    }

    pub fn did_reject(&self, reason: RejectReason) {
        match reason {
            RejectReason::AcceptError => self.status.record_accept_error(),
            RejectReason::TooManyConnections => self.status.record_rejected(),
        }
        debug!(%reason, "Connection rejected");
    }

    /// Release the slot of an admitted connection.
    pub fn on_closed(&self) {
        let mut live = self.live.lock();
        if *live == 0 {
            warn!("Connection closed with no admitted connections");
            return;
        }
        *live -= 1;
        drop(live);
        self.status.record_closed();
    }

    /// Give back a slot that never became a connection. Not counted as closed.
    pub fn revoke(&self) {
        let mut live = self.live.lock();
        *live = live.saturating_sub(1);
    }

    /// New maximum. Connections already admitted above it stay open.
    pub fn set_max_connections(&self, max_connections: u32) {
        self.max_connections.store(max_connections, Ordering::SeqCst);
    }

    #[must_use]
    pub fn max_connections(&self) -> u32 {
        self.max_connections.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn live_count(&self) -> u32 {
        *self.live.lock()
    }
}
