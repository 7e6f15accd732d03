//! Authenticated sessions.
//!
//! A [`Session`] is owned by the worker serving its connection. The parts
//! other threads may read (engine probe, id generators) live in
//! [`SessionShared`], which the connection's session slot also holds.

use super::connection::ConnectionId;
use crate::engine::{DataContext, SessionProbe};
use std::fmt;
use std::sync::Arc;
use xfront_core::ids::{DocumentIdAggregator, DocumentIdGenerator, PreparedStatementRegistry};

/// Thread-shareable part of a session.
pub struct SessionShared {
    connection_id: ConnectionId,
    user: String,
    probe: Arc<dyn SessionProbe>,
    documents: DocumentIdAggregator,
    statements: PreparedStatementRegistry,
}

impl SessionShared {
    #[must_use]
    pub const fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    #[must_use]
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Engine-side session id.
    #[must_use]
    pub fn session_id(&self) -> u64 {
        self.probe.session_id()
    }

    #[must_use]
    pub fn is_killed(&self) -> bool {
        self.probe.is_killed()
    }

    #[must_use]
    pub const fn documents(&self) -> &DocumentIdAggregator {
        &self.documents
    }

    #[must_use]
    pub const fn statements(&self) -> &PreparedStatementRegistry {
        &self.statements
    }
}

impl fmt::Debug for SessionShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionShared")
            .field("connection_id", &self.connection_id)
            .field("user", &self.user)
            .field("session_id", &self.session_id())
            .finish_non_exhaustive()
    }
}

/// Session owned by the serving worker.
pub struct Session {
    shared: Arc<SessionShared>,
    context: Box<dyn DataContext>,
}

impl Session {
    #[must_use]
    pub fn new(
        connection_id: ConnectionId,
        context: Box<dyn DataContext>,
        generator: Arc<DocumentIdGenerator>,
    ) -> Self {
        let shared = Arc::new(SessionShared {
            connection_id,
            user: context.user().to_string(),
            probe: context.probe(),
            documents: DocumentIdAggregator::new(generator),
            statements: PreparedStatementRegistry::new(),
        });
        Self { shared, context }
    }

    #[must_use]
    pub const fn shared(&self) -> &Arc<SessionShared> {
        &self.shared
    }

    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.shared.connection_id
    }

    pub fn data_context(&mut self) -> &mut dyn DataContext {
        self.context.as_mut()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Session").field(&self.shared).finish()
    }
}
