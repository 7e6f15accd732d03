//! Document id generation.
//!
//! An id is 28 lowercase hex digits:
//!
//! ```text
//! pppp tttttttt ssssssssssssssss
//! ^    ^        ^
//! |    |        serial, next value congruent to `offset` modulo `increment`
//! |    generator start time, seconds since the epoch (low 32 bits)
//! unique prefix
//! ```
//!
//! The serial is shared by every caller of one generator, so two ids from the
//! same generator never repeat, and generators with distinct prefixes never
//! produce the same id.

use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;

/// Length of a generated document id.
pub const DOCUMENT_ID_LEN: usize = 28;

/// Per-call generation parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdVariables {
    /// Cluster-unique prefix
    pub prefix: u16,
    /// Residue the serial must have modulo `increment`
    pub offset: u16,
    /// Serial step; `0` behaves like `1`
    pub increment: u16,
}

impl IdVariables {
    #[must_use]
    pub const fn new(prefix: u16, offset: u16, increment: u16) -> Self {
        Self { prefix, offset, increment }
    }
}

/// Server-wide generator.
#[derive(Debug)]
pub struct DocumentIdGenerator {
    start_timestamp: u32,
    serial: Mutex<u64>,
}

impl DocumentIdGenerator {
    /// Generator stamped with the current time.
    #[must_use]
    pub fn new() -> Self {
        let now = Utc::now().timestamp();
        Self::with_timestamp((now & i64::from(u32::MAX)) as u32)
    }

    #[must_use]
    pub fn with_timestamp(start_timestamp: u32) -> Self {
        Self { start_timestamp, serial: Mutex::new(0) }
    }

    #[must_use]
    pub const fn start_timestamp(&self) -> u32 {
        self.start_timestamp
    }

    /// Produce the next id.
    pub fn generate(&self, vars: IdVariables) -> String {
        let serial = {
            let mut last = self.serial.lock();
            *last = next_serial(*last, vars.offset, vars.increment);
            *last
        };
        format!("{:04x}{:08x}{:016x}", vars.prefix, self.start_timestamp, serial)
    }
}

impl Default for DocumentIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Smallest value above `last` that is congruent to `offset` modulo `increment`.
fn next_serial(last: u64, offset: u16, increment: u16) -> u64 {
    let step = u64::from(increment.max(1));
    let residue = u64::from(offset) % step;
    let candidate = last.wrapping_add(1);
    let r = (candidate % step + step - residue) % step;
    if r == 0 {
        candidate
    } else {
        candidate.wrapping_add(step - r)
    }
}

/// Session-scoped wrapper that can retain the ids it hands out.
#[derive(Debug)]
pub struct DocumentIdAggregator {
    generator: Arc<DocumentIdGenerator>,
    retained: Mutex<Option<Vec<String>>>,
}

impl DocumentIdAggregator {
    #[must_use]
    pub fn new(generator: Arc<DocumentIdGenerator>) -> Self {
        Self { generator, retained: Mutex::new(None) }
    }

    /// Generate through the shared generator, recording the id when retention is on.
    pub fn generate_id(&self, vars: IdVariables) -> String {
        let id = self.generator.generate(vars);
        if let Some(ids) = self.retained.lock().as_mut() {
            ids.push(id.clone());
        }
        id
    }

    /// Start or stop recording generated ids. Turning retention off discards
    /// anything recorded.
    pub fn set_id_retention(&self, enabled: bool) {
        let mut retained = self.retained.lock();
        match (enabled, retained.is_some()) {
            (true, false) => *retained = Some(Vec::new()),
            (false, true) => *retained = None,
            _ => {},
        }
    }

    /// Drain the ids recorded since the last call.
    pub fn take_ids(&self) -> Vec<String> {
        self.retained.lock().as_mut().map(std::mem::take).unwrap_or_default()
    }
}
