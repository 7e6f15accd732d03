//! Connection records and the connection registry.
//!
//! A [`Connection`] is shared by the registry, the worker serving it and any
//! thread trying to kill it. Only the worker tears it down; every other
//! thread talks to it through [`Connection::terminate`], which queues a
//! [`ControlMessage`] and shuts down the read side of the socket so a blocked
//! read returns while a final reply can still be written.

use super::session::SessionShared;
use super::stream::{ClientStream, PeerAddress, TransportKind};
use crossbeam::channel::{self, Receiver, Sender};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::net::Shutdown;
use std::sync::{
    atomic::{AtomicU8, Ordering},
    Arc,
};
use tracing::{debug, trace};

/// Numeric connection id, strictly increasing in admission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a connection. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnectionState {
    Accepted = 0,
    Running = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnectionState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Accepted,
            1 => Self::Running,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accepted => write!(f, "accepted"),
            Self::Running => write!(f, "running"),
            Self::Closing => write!(f, "closing"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Requests delivered to the worker owning a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    Terminate,
}

/// One accepted client socket.
pub struct Connection {
    id: ConnectionId,
    peer: PeerAddress,
    kind: TransportKind,
    state: AtomicU8,
    control_tx: Sender<ControlMessage>,
    control_rx: Receiver<ControlMessage>,
    /// Duplicate handle used only to interrupt blocking I/O
    waker: ClientStream,
    /// Taken by the worker when it starts serving
    stream: Mutex<Option<ClientStream>>,
    /// Session slot; never held while taking another lock
    session: Mutex<Option<Arc<SessionShared>>>,
}

impl Connection {
    /// # Errors
    /// Fails when the socket cannot be duplicated.
    pub fn new(id: ConnectionId, stream: ClientStream, peer: PeerAddress) -> io::Result<Self> {
        let waker = stream.try_clone()?;
        let (control_tx, control_rx) = channel::unbounded();
        Ok(Self {
            id,
            peer,
            kind: stream.kind(),
            state: AtomicU8::new(ConnectionState::Accepted as u8),
            control_tx,
            control_rx,
            waker,
            stream: Mutex::new(Some(stream)),
            session: Mutex::new(None),
        })
    }

    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    #[must_use]
    pub const fn peer(&self) -> &PeerAddress {
        &self.peer
    }

    #[must_use]
    pub const fn transport(&self) -> TransportKind {
        self.kind
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Move to `to` if it is ahead of the current state.
    pub fn advance(&self, to: ConnectionState) -> bool {
        self.state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (to as u8 > current).then_some(to as u8)
            })
            .is_ok()
    }

    /// Ask the owning worker to close the connection.
    ///
    /// Safe from any thread; never tears the connection down itself.
    pub fn terminate(&self) {
        if self.is_closed() {
            return;
        }
        let _ = self.control_tx.send(ControlMessage::Terminate);
        if let Err(e) = self.waker.shutdown(Shutdown::Read) {
            trace!(connection_id = %self.id, error = %e, "Socket already shut down");
        }
        debug!(connection_id = %self.id, "Terminate requested");
    }

    /// Whether a terminate request is waiting. Consumes queued messages.
    #[must_use]
    pub fn pending_terminate(&self) -> bool {
        self.control_rx.try_iter().any(|msg| msg == ControlMessage::Terminate)
    }

    /// Hand the socket to the serving worker. Only the first call gets it.
    #[must_use]
    pub fn take_stream(&self) -> Option<ClientStream> {
        self.stream.lock().take()
    }

    pub fn attach_session(&self, session: Arc<SessionShared>) {
        *self.session.lock() = Some(session);
    }

    pub fn detach_session(&self) -> Option<Arc<SessionShared>> {
        self.session.lock().take()
    }

    /// Clone of the session slot; the slot lock is released on return.
    #[must_use]
    pub fn session(&self) -> Option<Arc<SessionShared>> {
        self.session.lock().clone()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Live connections by id.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, connection: Arc<Connection>) {
        self.connections.insert(connection.id(), connection);
    }

    /// Shared handle to a connection. No registry lock is held on return.
    #[must_use]
    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn remove(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.remove(&id).map(|(_, connection)| connection)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Handles to every registered connection.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    /// Send terminate to every connection. Returns how many were signalled.
    pub fn close_all(&self) -> usize {
        let connections = self.snapshot();
        for connection in &connections {
            connection.terminate();
        }
        if !connections.is_empty() {
            debug!(count = connections.len(), "Closing all connections");
        }
        connections.len()
    }

    /// Remove and return everything still registered.
    pub fn drain(&self) -> Vec<Arc<Connection>> {
        let ids: Vec<_> = self.connections.iter().map(|entry| *entry.key()).collect();
        ids.into_iter().filter_map(|id| self.remove(id)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::os::unix::net::UnixStream;
    use std::thread;

    fn connection(id: u64) -> (Arc<Connection>, UnixStream) {
        let (server, client) = UnixStream::pair().unwrap();
        let connection =
            Connection::new(ConnectionId::new(id), ClientStream::Unix(server), PeerAddress::Unix)
                .unwrap();
        (Arc::new(connection), client)
    }

    #[test]
    fn test_state_moves_forward_only() {
        let (connection, _peer) = connection(1);
        assert!(connection.advance(ConnectionState::Running));
        assert!(connection.advance(ConnectionState::Closed));
        assert!(!connection.advance(ConnectionState::Closing));
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_stream_taken_once() {
        let (connection, _peer) = connection(1);
        assert!(connection.take_stream().is_some());
        assert!(connection.take_stream().is_none());
    }

    #[test]
    fn test_terminate_wakes_blocked_read() {
        let (connection, _peer) = connection(7);
        let mut stream = connection.take_stream().unwrap();

        let reader = thread::spawn(move || {
            let mut buf = [0u8; 16];
            stream.read(&mut buf).unwrap_or(0)
        });

        thread::sleep(std::time::Duration::from_millis(50));
        connection.terminate();
        assert_eq!(reader.join().unwrap(), 0);
        assert!(connection.pending_terminate());
        assert!(!connection.pending_terminate());
    }

    #[test]
    fn test_terminate_on_closed_is_noop() {
        let (connection, _peer) = connection(3);
        connection.advance(ConnectionState::Closed);
        connection.terminate();
        assert!(!connection.pending_terminate());
    }

    #[test]
    fn test_registry_operations() {
        let registry = ConnectionRegistry::new();
        let (a, _pa) = connection(1);
        let (b, _pb) = connection(2);
        registry.insert(Arc::clone(&a));
        registry.insert(Arc::clone(&b));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(ConnectionId::new(2)).map(|c| c.id()), Some(b.id()));
        assert!(registry.get(ConnectionId::new(3)).is_none());

        assert_eq!(registry.close_all(), 2);
        assert!(a.pending_terminate());
        assert!(b.pending_terminate());

        assert!(registry.remove(ConnectionId::new(1)).is_some());
        assert_eq!(registry.drain().len(), 1);
        assert!(registry.is_empty());
    }
}
