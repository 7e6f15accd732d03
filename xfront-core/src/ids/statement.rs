//! Prepared statement id allocation.
//!
//! Clients name statements with their own ids; each session maps those to
//! ids it allocates from a counter that only moves forward.

use parking_lot::Mutex;
use std::collections::HashMap;

/// Per-session mapping from client statement ids to allocated ids.
#[derive(Debug, Default)]
pub struct PreparedStatementRegistry {
    inner: Mutex<Registry>,
}

#[derive(Debug, Default)]
struct Registry {
    last_id: u32,
    by_client_id: HashMap<u32, u32>,
}

impl PreparedStatementRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an id for `client_stmt_id`, replacing any earlier mapping.
    pub fn prepare(&self, client_stmt_id: u32) -> u32 {
        let mut inner = self.inner.lock();
        inner.last_id = inner.last_id.wrapping_add(1).max(1);
        let id = inner.last_id;
        inner.by_client_id.insert(client_stmt_id, id);
        id
    }

    #[must_use]
    pub fn lookup(&self, client_stmt_id: u32) -> Option<u32> {
        self.inner.lock().by_client_id.get(&client_stmt_id).copied()
    }

    /// Forget a statement; the allocated id is never reused.
    pub fn deallocate(&self, client_stmt_id: u32) -> Option<u32> {
        self.inner.lock().by_client_id.remove(&client_stmt_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().by_client_id.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_monotonic() {
        let registry = PreparedStatementRegistry::new();
        assert_eq!(registry.prepare(10), 1);
        assert_eq!(registry.prepare(20), 2);
        assert_eq!(registry.prepare(10), 3);

        assert_eq!(registry.lookup(10), Some(3));
        assert_eq!(registry.lookup(20), Some(2));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_deallocate_does_not_reuse() {
        let registry = PreparedStatementRegistry::new();
        registry.prepare(1);
        assert_eq!(registry.deallocate(1), Some(1));
        assert_eq!(registry.lookup(1), None);
        assert_eq!(registry.prepare(1), 2);
    }

    #[test]
    fn test_unknown_lookup() {
        let registry = PreparedStatementRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.lookup(5), None);
    }
}
