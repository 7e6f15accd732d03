//! Blocking client transports.

use rustls::{ServerConfig, ServerConnection, StreamOwned};
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;

/// Kind of listener a client arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    Unix,
}

/// Remote end of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAddress {
    Tcp(SocketAddr),
    Unix,
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "{addr}"),
            Self::Unix => write!(f, "localhost"),
        }
    }
}

/// Accepted socket, in blocking mode.
#[derive(Debug)]
pub enum ClientStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl ClientStream {
    #[must_use]
    pub const fn kind(&self) -> TransportKind {
        match self {
            Self::Tcp(_) => TransportKind::Tcp,
            Self::Unix(_) => TransportKind::Unix,
        }
    }

    /// Second handle to the same socket.
    ///
    /// # Errors
    /// Propagates the duplication failure.
    pub fn try_clone(&self) -> io::Result<Self> {
        match self {
            Self::Tcp(s) => s.try_clone().map(Self::Tcp),
            Self::Unix(s) => s.try_clone().map(Self::Unix),
        }
    }

    /// # Errors
    /// Propagates the socket error.
    pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.shutdown(how),
            Self::Unix(s) => s.shutdown(how),
        }
    }

    /// # Errors
    /// Propagates the socket error.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.set_read_timeout(timeout),
            Self::Unix(s) => s.set_read_timeout(timeout),
        }
    }
}

impl Read for ClientStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.read(buf),
            Self::Unix(s) => s.read(buf),
        }
    }
}

impl Write for ClientStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.write(buf),
            Self::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.flush(),
            Self::Unix(s) => s.flush(),
        }
    }
}

/// Byte channel to a client, plain or wrapped in TLS.
pub enum Channel {
    Plain(ClientStream),
    Tls(Box<StreamOwned<ServerConnection, ClientStream>>),
}

impl Channel {
    /// Local sockets and TLS sessions count as secure.
    #[must_use]
    pub fn is_secure(&self) -> bool {
        match self {
            Self::Plain(stream) => stream.kind() == TransportKind::Unix,
            Self::Tls(_) => true,
        }
    }

    #[must_use]
    pub const fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }

    /// Underlying socket.
    #[must_use]
    pub fn socket(&self) -> &ClientStream {
        match self {
            Self::Plain(stream) => stream,
            Self::Tls(tls) => tls.get_ref(),
        }
    }

    /// Run the server side of a TLS handshake over a plain channel.
    ///
    /// # Errors
    /// Fails when the channel already uses TLS or the handshake fails.
    pub fn upgrade(self, config: Arc<ServerConfig>) -> io::Result<Self> {
        let Self::Plain(mut stream) = self else {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "TLS already active"));
        };
        let mut conn = ServerConnection::new(config)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        while conn.is_handshaking() {
            conn.complete_io(&mut stream)?;
        }
        Ok(Self::Tls(Box::new(StreamOwned::new(conn, stream))))
    }
}

impl Read for Channel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(s) => s.read(buf),
            Self::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Channel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(s) => s.write(buf),
            Self::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(s) => s.flush(),
            Self::Tls(s) => s.flush(),
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain(s) => f.debug_tuple("Plain").field(&s.kind()).finish(),
            Self::Tls(s) => f.debug_tuple("Tls").field(&s.get_ref().kind()).finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unix_channel_is_secure() {
        let (a, _b) = UnixStream::pair().unwrap();
        let channel = Channel::Plain(ClientStream::Unix(a));
        assert!(channel.is_secure());
        assert!(!channel.is_tls());
    }

    #[test]
    fn test_tcp_channel_is_not_secure() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let channel = Channel::Plain(ClientStream::Tcp(client));
        assert!(!channel.is_secure());
    }

    #[test]
    fn test_cloned_stream_shares_socket() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let stream = ClientStream::Unix(a);
        let mut clone = stream.try_clone().unwrap();
        clone.write_all(b"hi").unwrap();

        let mut buf = [0u8; 2];
        b.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hi");

        stream.shutdown(Shutdown::Both).unwrap();
        assert_eq!(b.read(&mut buf).unwrap(), 0);
    }
}
