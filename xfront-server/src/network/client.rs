//! Worker-side view of a connection.

use super::connection::{Connection, ConnectionId, ConnectionState};
use super::session::Session;
use super::stream::Channel;
use crate::engine::EngineError;
use crate::kill::{kill_client, KillError};
use crate::server::ServerCore;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

const READ_CHUNK: usize = 4096;

/// Errors from client-level operations.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("already authenticated")]
    AlreadyAuthenticated,

    #[error("not authenticated")]
    NotAuthenticated,

    #[error("authentication mechanism '{0}' is not available on this channel")]
    MechanismNotAllowed(String),

    #[error("TLS is not available")]
    TlsUnavailable,

    #[error("TLS is already active")]
    TlsActive,

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Kill(#[from] KillError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A connection as seen by the worker serving it.
///
/// Dropping the client tears the connection down: the session is released,
/// the socket is shut down and the connection leaves the registry.
pub struct Client {
    core: Arc<ServerCore>,
    connection: Arc<Connection>,
    channel: Option<Channel>,
    pending: Vec<u8>,
    session: Option<Session>,
    terminate_seen: bool,
}

impl Client {
    pub(crate) fn new(core: Arc<ServerCore>, connection: Arc<Connection>, channel: Channel) -> Self {
        Self {
            core,
            connection,
            channel: Some(channel),
            pending: Vec::new(),
            session: None,
            terminate_seen: false,
        }
    }

    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.connection.id()
    }

    #[must_use]
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    #[must_use]
    pub const fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.session.is_some()
    }

    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.channel.as_ref().is_some_and(Channel::is_secure)
    }

    /// Authentication mechanisms offered on this channel.
    #[must_use]
    pub fn mechanisms(&self) -> Vec<&'static str> {
        self.core.auth().list(self.is_secure())
    }

    /// Whether the connection must close: a terminate request arrived, the
    /// engine killed the session, or the server is shutting down.
    pub fn should_terminate(&mut self) -> bool {
        if !self.terminate_seen && self.connection.pending_terminate() {
            self.terminate_seen = true;
        }
        self.terminate_seen
            || self.session.as_ref().is_some_and(|s| s.shared().is_killed())
            || !self.core.is_running()
    }

    /// Next `\n`-terminated line without its terminator.
    ///
    /// Returns `None` when the peer closed the connection or it must
    /// terminate. The read deadline is the connect timeout until the client
    /// authenticates and the interactive timeout afterwards.
    ///
    /// # Errors
    /// Socket errors, timeouts, invalid UTF-8 and lines longer than the
    /// maximum message size.
    pub fn read_line(&mut self) -> io::Result<Option<String>> {
        loop {
            if self.should_terminate() {
                return Ok(None);
            }

            if let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
                let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return String::from_utf8(line)
                    .map(Some)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e));
            }

            let limits = self.core.protocol_limits();
            if self.pending.len() > limits.max_allowed_packet as usize {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "message exceeds max_allowed_packet",
                ));
            }

            let timeout = if self.session.is_some() {
                limits.interactive_timeout
            } else {
                limits.connect_timeout
            };
            let channel = self.channel_mut()?;
            channel.socket().set_read_timeout(Some(timeout))?;

            let mut chunk = [0u8; READ_CHUNK];
            match channel.read(&mut chunk) {
                Ok(0) => return Ok(None),
                Ok(n) => self.pending.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
                Err(e) => return Err(e),
            }
        }
    }

    /// Write `line` followed by `\n`.
    ///
    /// # Errors
    /// Propagates socket errors.
    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        let channel = self.channel_mut()?;
        channel.write_all(line.as_bytes())?;
        channel.write_all(b"\n")?;
        channel.flush()
    }

    /// Open a session with the engine.
    ///
    /// # Errors
    /// Fails when already authenticated, when the mechanism is not offered on
    /// this channel, or when the engine rejects the credentials.
    pub fn authenticate(
        &mut self,
        mechanism: &str,
        user: &str,
        credential: &str,
    ) -> Result<ConnectionId, ClientError> {
        if self.session.is_some() {
            return Err(ClientError::AlreadyAuthenticated);
        }
        if !self.core.auth().is_allowed(mechanism, self.is_secure()) {
            return Err(ClientError::MechanismNotAllowed(mechanism.to_string()));
        }

        let context = match self.core.engine().open_session(user, credential) {
            Ok(context) => context,
            Err(e) => {
                warn!(connection_id = %self.id(), user, error = %e, "Authentication failed");
                return Err(e.into());
            },
        };

        let session = Session::new(self.id(), context, self.core.document_generator());
        self.connection.attach_session(Arc::clone(session.shared()));
        info!(
            connection_id = %self.id(),
            user,
            mechanism,
            session_id = session.shared().session_id(),
            "Client authenticated"
        );
        self.session = Some(session);
        Ok(self.id())
    }

    /// Kill another connection, or this one.
    ///
    /// # Errors
    /// [`ClientError::NotAuthenticated`] without a session, else see [`kill_client`].
    pub fn kill(&mut self, target: ConnectionId) -> Result<(), ClientError> {
        let session = self.session.as_mut().ok_or(ClientError::NotAuthenticated)?;
        kill_client(self.core.registry(), target, session)?;
        Ok(())
    }

    /// Document id through this connection's session, if any.
    #[must_use]
    pub fn document_id(&self, offset: u16, increment: u16) -> String {
        self.core.document_id(Some(self.id()), offset, increment)
    }

    /// Allocate a prepared statement id for `client_stmt_id`.
    ///
    /// # Errors
    /// [`ClientError::NotAuthenticated`] without a session.
    pub fn prepare(&self, client_stmt_id: u32) -> Result<u32, ClientError> {
        let session = self.session.as_ref().ok_or(ClientError::NotAuthenticated)?;
        Ok(session.shared().statements().prepare(client_stmt_id))
    }

    /// Forget a prepared statement. Returns the id it was allocated, if any.
    ///
    /// # Errors
    /// [`ClientError::NotAuthenticated`] without a session.
    pub fn deallocate(&self, client_stmt_id: u32) -> Result<Option<u32>, ClientError> {
        let session = self.session.as_ref().ok_or(ClientError::NotAuthenticated)?;
        Ok(session.shared().statements().deallocate(client_stmt_id))
    }

    /// Start or stop recording the document ids this session generates.
    ///
    /// # Errors
    /// [`ClientError::NotAuthenticated`] without a session.
    pub fn set_id_retention(&self, enabled: bool) -> Result<(), ClientError> {
        let session = self.session.as_ref().ok_or(ClientError::NotAuthenticated)?;
        session.shared().documents().set_id_retention(enabled);
        Ok(())
    }

    /// Document ids recorded since the last call.
    ///
    /// # Errors
    /// [`ClientError::NotAuthenticated`] without a session.
    pub fn take_document_ids(&self) -> Result<Vec<String>, ClientError> {
        let session = self.session.as_ref().ok_or(ClientError::NotAuthenticated)?;
        Ok(session.shared().documents().take_ids())
    }

    /// Look up a prepared statement id by this connection's client-local id.
    #[must_use]
    pub fn statement_id(&self, client_stmt_id: u32) -> Option<u32> {
        self.core.prepared_statement_id(self.id(), client_stmt_id)
    }

    /// Whether [`Client::start_tls`] can succeed.
    #[must_use]
    pub fn tls_available(&self) -> bool {
        self.core.tls().is_active() && !self.channel.as_ref().is_some_and(Channel::is_tls)
    }

    /// Run a TLS handshake on this connection.
    ///
    /// Buffered unread input is discarded, since it predates the handshake.
    ///
    /// # Errors
    /// Fails when TLS is not configured, already active, or the handshake fails.
    pub fn start_tls(&mut self) -> Result<(), ClientError> {
        if self.channel.as_ref().is_some_and(Channel::is_tls) {
            return Err(ClientError::TlsActive);
        }
        let config = self.core.tls().server_config().ok_or(ClientError::TlsUnavailable)?;
        let channel = self.channel.take().ok_or_else(channel_gone)?;
        self.pending.clear();

        channel.socket().set_read_timeout(Some(self.core.protocol_limits().connect_timeout))?;
        self.channel = Some(channel.upgrade(config)?);
        debug!(connection_id = %self.id(), "TLS established");
        Ok(())
    }

    fn channel_mut(&mut self) -> io::Result<&mut Channel> {
        self.channel.as_mut().ok_or_else(channel_gone)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.connection.advance(ConnectionState::Closing);
        self.connection.detach_session();
        self.session = None;
        if let Some(channel) = self.channel.take() {
            let _ = channel.socket().shutdown(Shutdown::Both);
        }
        self.connection.advance(ConnectionState::Closed);
        self.core.release_connection(&self.connection);
        debug!(connection_id = %self.connection.id(), "Connection closed");
    }
}

fn channel_gone() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "client channel is closed")
}

/// Serve `connection` on the current worker until it closes.
pub(crate) fn run_connection(core: Arc<ServerCore>, connection: Arc<Connection>) {
    let Some(stream) = connection.take_stream() else {
        warn!(connection_id = %connection.id(), "Connection already served");
        return;
    };
    connection.advance(ConnectionState::Running);
    debug!(connection_id = %connection.id(), peer = %connection.peer(), "Serving connection");

    let handler = Arc::clone(core.protocol());
    let mut client = Client::new(core, connection, Channel::Plain(stream));
    if let Err(e) = handler.serve(&mut client) {
        match e.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                info!(connection_id = %client.id(), "Client timed out");
            },
            _ => debug!(connection_id = %client.id(), error = %e, "Connection ended with error"),
        }
    }
}
