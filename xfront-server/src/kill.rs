//! Cross-thread connection termination.
//!
//! The registry entry and the target's session slot are each read and
//! released before the next step, so a kill never holds two
//! connection-scoped locks. The target is only signalled; its own worker
//! closes it.

use crate::network::{ConnectionId, ConnectionRegistry, Session};
use thiserror::Error;
use tracing::{debug, info};

/// Why a kill request did not succeed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KillError {
    #[error("Unknown connection id: {0}")]
    NoSuchConnection(ConnectionId),

    #[error("Cannot kill connection {id}: {reason}")]
    Denied { id: ConnectionId, reason: String },
}

/// Kill connection `target` on behalf of `requester`.
///
/// # Errors
/// [`KillError::NoSuchConnection`] when the target is absent or already
/// closed, [`KillError::Denied`] when the engine refuses or the target's
/// session does not end up killed.
pub fn kill_client(
    registry: &ConnectionRegistry,
    target: ConnectionId,
    requester: &mut Session,
) -> Result<(), KillError> {
    let connection = registry.get(target).ok_or(KillError::NoSuchConnection(target))?;
    if connection.is_closed() {
        return Err(KillError::NoSuchConnection(target));
    }

    if target == requester.connection_id() {
        debug!(connection_id = %target, "Connection killed by itself");
        connection.terminate();
        return Ok(());
    }

    let shared = connection.session().ok_or_else(|| KillError::Denied {
        id: target,
        reason: "connection has no session".into(),
    })?;
    let session_id = shared.session_id();

    requester
        .data_context()
        .execute_kill_session(session_id)
        .map_err(|e| KillError::Denied { id: target, reason: e.to_string() })?;

    // A session detached meanwhile no longer belongs to the target
    if connection.session().is_some_and(|current| current.is_killed()) {
        info!(
            connection_id = %target,
            session_id,
            by = %requester.connection_id(),
            "Connection killed"
        );
        connection.terminate();
        return Ok(());
    }

    Err(KillError::Denied { id: target, reason: "Cannot kill client".into() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{DataContext, Engine, EngineError, LocalEngine, LocalUser, SessionProbe};
    use crate::network::{ClientStream, Connection, ConnectionState, PeerAddress};
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use xfront_core::ids::DocumentIdGenerator;

    struct Fixture {
        engine: LocalEngine,
        registry: ConnectionRegistry,
        generator: Arc<DocumentIdGenerator>,
        peers: Vec<UnixStream>,
    }

    impl Fixture {
        fn new() -> Self {
            let engine = LocalEngine::new()
                .with_user(LocalUser::new("alice", "a"))
                .with_user(LocalUser::new("bob", "b"))
                .with_user(LocalUser::new("root", "r").privileged());
            Self {
                engine,
                registry: ConnectionRegistry::new(),
                generator: Arc::new(DocumentIdGenerator::new()),
                peers: Vec::new(),
            }
        }

        fn connect(
            &mut self,
            id: u64,
            user: Option<(&str, &str)>,
        ) -> (Arc<Connection>, Option<Session>) {
            let (server, client) = UnixStream::pair().unwrap();
            self.peers.push(client);
            let id = ConnectionId::new(id);
            let stream = ClientStream::Unix(server);
            let connection = Arc::new(Connection::new(id, stream, PeerAddress::Unix).unwrap());
            connection.advance(ConnectionState::Running);
            self.registry.insert(Arc::clone(&connection));

            let session = user.map(|(name, password)| {
                let context = self.engine.open_session(name, password).unwrap();
                let session = Session::new(id, context, Arc::clone(&self.generator));
                connection.attach_session(Arc::clone(session.shared()));
                session
            });
            (connection, session)
        }
    }

    #[test]
    fn test_kill_self_succeeds() {
        let mut fixture = Fixture::new();
        let (connection, session) = fixture.connect(1, Some(("alice", "a")));
        let mut session = session.unwrap();

        assert_eq!(kill_client(&fixture.registry, connection.id(), &mut session), Ok(()));
        assert!(connection.pending_terminate());
    }

    #[test]
    fn test_kill_unknown_connection() {
        let mut fixture = Fixture::new();
        let (_connection, session) = fixture.connect(1, Some(("alice", "a")));
        let mut session = session.unwrap();

        let missing = ConnectionId::new(99);
        assert_eq!(
            kill_client(&fixture.registry, missing, &mut session),
            Err(KillError::NoSuchConnection(missing))
        );
    }

    #[test]
    fn test_kill_closed_connection() {
        let mut fixture = Fixture::new();
        let (_a, session) = fixture.connect(1, Some(("alice", "a")));
        let (b, _) = fixture.connect(2, Some(("bob", "b")));
        let mut session = session.unwrap();
        b.advance(ConnectionState::Closed);

        assert_eq!(
            kill_client(&fixture.registry, b.id(), &mut session),
            Err(KillError::NoSuchConnection(b.id()))
        );
    }

    #[test]
    fn test_unprivileged_kill_is_denied() {
        let mut fixture = Fixture::new();
        let (_a, session) = fixture.connect(1, Some(("alice", "a")));
        let (b, b_session) = fixture.connect(2, Some(("bob", "b")));
        let mut session = session.unwrap();

        let result = kill_client(&fixture.registry, b.id(), &mut session);
        assert!(matches!(result, Err(KillError::Denied { .. })));
        assert!(!b.pending_terminate());
        assert!(!b_session.unwrap().shared().is_killed());
    }

    #[test]
    fn test_privileged_kill_terminates_target() {
        let mut fixture = Fixture::new();
        let (_root, session) = fixture.connect(1, Some(("root", "r")));
        let (b, b_session) = fixture.connect(2, Some(("bob", "b")));
        let mut session = session.unwrap();

        assert_eq!(kill_client(&fixture.registry, b.id(), &mut session), Ok(()));
        assert!(b.pending_terminate());
        assert!(b_session.unwrap().shared().is_killed());
    }

    struct FlagProbe {
        id: u64,
        killed: AtomicBool,
    }

    impl SessionProbe for FlagProbe {
        fn session_id(&self) -> u64 {
            self.id
        }

        fn is_killed(&self) -> bool {
            self.killed.load(Ordering::SeqCst)
        }
    }

    /// Context whose kill flags the target and then detaches the target's
    /// session, as the target's own worker would when closing.
    struct DetachingContext {
        probe: Arc<FlagProbe>,
        target: Option<(Arc<Connection>, Arc<FlagProbe>)>,
    }

    impl DataContext for DetachingContext {
        fn session_id(&self) -> u64 {
            self.probe.id
        }

        fn user(&self) -> &str {
            "root"
        }

        fn probe(&self) -> Arc<dyn SessionProbe> {
            Arc::clone(&self.probe) as Arc<dyn SessionProbe>
        }

        fn execute_kill_session(&mut self, _session_id: u64) -> Result<(), EngineError> {
            if let Some((connection, probe)) = &self.target {
                probe.killed.store(true, Ordering::SeqCst);
                connection.detach_session();
            }
            Ok(())
        }
    }

    #[test]
    fn test_session_detached_during_kill_is_not_reported_killed() {
        let mut fixture = Fixture::new();
        let (target, _) = fixture.connect(2, None);
        let generator = Arc::clone(&fixture.generator);

        let target_probe = Arc::new(FlagProbe { id: 20, killed: AtomicBool::new(false) });
        let target_context =
            DetachingContext { probe: Arc::clone(&target_probe), target: None };
        let target_session =
            Session::new(target.id(), Box::new(target_context), Arc::clone(&generator));
        target.attach_session(Arc::clone(target_session.shared()));

        let requester_context = DetachingContext {
            probe: Arc::new(FlagProbe { id: 10, killed: AtomicBool::new(false) }),
            target: Some((Arc::clone(&target), target_probe)),
        };
        let mut requester =
            Session::new(ConnectionId::new(1), Box::new(requester_context), generator);

        assert!(matches!(
            kill_client(&fixture.registry, target.id(), &mut requester),
            Err(KillError::Denied { .. })
        ));
        assert!(!target.pending_terminate());
    }

    #[test]
    fn test_target_without_session_is_denied() {
        let mut fixture = Fixture::new();
        let (_root, session) = fixture.connect(1, Some(("root", "r")));
        let (b, _) = fixture.connect(2, None);
        let mut session = session.unwrap();

        assert!(matches!(
            kill_client(&fixture.registry, b.id(), &mut session),
            Err(KillError::Denied { .. })
        ));
    }
}
