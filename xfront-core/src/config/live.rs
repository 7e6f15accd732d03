//! Runtime-adjustable settings with change notification.
//!
//! [`LiveConfig`] holds the current [`LiveSettings`] behind a read-write lock.
//! Updates are validated first; a rejected update leaves the previous
//! settings in place. Registered callbacks run after the new settings are
//! stored and without any lock held, so a callback may write a corrected
//! value back (the session pool does this with its clamped floor).

use crate::config::{schema::LiveSettings, validator::ConfigValidator};
use crate::Result;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Callback invoked with the settings that were just applied.
pub type ChangeCallback = Arc<dyn Fn(&LiveSettings) + Send + Sync>;

/// Update statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateStats {
    /// Updates that were applied
    pub applied: u64,
    /// Updates rejected by validation
    pub rejected: u64,
}

/// Shared live settings plus their subscribers.
pub struct LiveConfig {
    current: RwLock<LiveSettings>,
    callbacks: Mutex<Vec<(&'static str, ChangeCallback)>>,
    stats: Mutex<UpdateStats>,
}

impl LiveConfig {
    /// Wrap initial settings.
    #[must_use]
    pub fn new(initial: LiveSettings) -> Self {
        Self {
            current: RwLock::new(initial),
            callbacks: Mutex::new(Vec::new()),
            stats: Mutex::new(UpdateStats::default()),
        }
    }

    /// Copy of the current settings.
    #[must_use]
    pub fn snapshot(&self) -> LiveSettings {
        self.current.read().clone()
    }

    /// Validate, store and broadcast new settings.
    ///
    /// # Errors
    /// Returns a configuration error when validation fails; nothing is stored
    /// and no callback runs in that case.
    pub fn update(&self, settings: LiveSettings) -> Result<()> {
        if let Err(e) = ConfigValidator::validate_live(&settings) {
            self.stats.lock().rejected += 1;
            warn!("Rejected live configuration update: {}", e);
            return Err(e);
        }

        *self.current.write() = settings.clone();
        self.stats.lock().applied += 1;
        info!(
            max_connections = settings.max_connections,
            min_worker_threads = settings.min_worker_threads,
            "Live configuration updated"
        );

        self.notify(&settings);
        Ok(())
    }

    /// Overwrite the worker floor without notifying subscribers.
    pub fn write_back_min_worker_threads(&self, value: u32) {
        let mut current = self.current.write();
        if current.min_worker_threads != value {
            debug!(from = current.min_worker_threads, to = value, "Writing back clamped worker floor");
            current.min_worker_threads = value;
        }
    }

    /// Register a named callback.
    pub fn subscribe(&self, name: &'static str, callback: ChangeCallback) {
        self.callbacks.lock().push((name, callback));
    }

    /// Drop every registered callback.
    pub fn clear_callbacks(&self) {
        let removed = {
            let mut callbacks = self.callbacks.lock();
            let n = callbacks.len();
            callbacks.clear();
            n
        };
        debug!("Cleared {} configuration callbacks", removed);
    }

    /// Number of registered callbacks.
    #[must_use]
    pub fn callback_count(&self) -> usize {
        self.callbacks.lock().len()
    }

    #[must_use]
    pub fn stats(&self) -> UpdateStats {
        *self.stats.lock()
    }

    fn notify(&self, settings: &LiveSettings) {
        let callbacks: Vec<(&'static str, ChangeCallback)> = self.callbacks.lock().clone();
        for (name, callback) in callbacks {
            debug!(callback = name, "Dispatching configuration change");
            callback(settings);
        }
    }
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self::new(LiveSettings::default())
    }
}

impl std::fmt::Debug for LiveConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveConfig")
            .field("current", &*self.current.read())
            .field("callbacks", &self.callback_count())
            .finish()
    }
}
