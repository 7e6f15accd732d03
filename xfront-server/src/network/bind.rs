//! Bind-address parsing and listening socket creation.

use crate::shutdown::ExitFlag;
use socket2::{Domain, SockAddr, Socket, Type};
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, ToSocketAddrs};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};
use xfront_core::{Error, Result};

/// Hosts meaning "every interface".
pub const WILDCARD_HOSTS: [&str; 3] = ["*", "0.0.0.0", "::"];

/// Delay between attempts to bind a port that is still in use.
const BIND_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Errors from [`BindAddress::parse`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BindAddressError {
    #[error("bind address is empty")]
    Empty,

    #[error("'{0}': host part is empty")]
    EmptyHost(String),

    #[error("'{0}': namespace part is empty")]
    EmptyNamespace(String),

    #[error("'{0}': more than one namespace separator")]
    NestedNamespace(String),
}

impl From<BindAddressError> for Error {
    fn from(err: BindAddressError) -> Self {
        Self::BindAddress { message: err.to_string() }
    }
}

/// A `host[/namespace]` bind expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindAddress {
    pub host: String,
    /// Empty when no namespace was given
    pub namespace: String,
}

impl BindAddress {
    /// Split a bind expression into host and namespace.
    ///
    /// # Errors
    /// Fails when either side of the `/` is empty.
    pub fn parse(input: &str) -> std::result::Result<Self, BindAddressError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(BindAddressError::Empty);
        }

        let Some((host, namespace)) = input.split_once('/') else {
            return Ok(Self { host: input.to_string(), namespace: String::new() });
        };

        if host.is_empty() {
            return Err(BindAddressError::EmptyHost(input.to_string()));
        }
        if namespace.is_empty() {
            return Err(BindAddressError::EmptyNamespace(input.to_string()));
        }
        if namespace.contains('/') {
            return Err(BindAddressError::NestedNamespace(input.to_string()));
        }
        Ok(Self { host: host.to_string(), namespace: namespace.to_string() })
    }

    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        WILDCARD_HOSTS.contains(&self.host.as_str())
    }

    #[must_use]
    pub fn has_namespace(&self) -> bool {
        !self.namespace.is_empty()
    }

    /// Reject combinations that cannot be bound.
    ///
    /// # Errors
    /// A namespace with a wildcard host is a configuration error. Network
    /// namespaces are not supported on this platform build, so any namespace
    /// is rejected as well.
    pub fn check_bindable(&self) -> Result<()> {
        if !self.has_namespace() {
            return Ok(());
        }
        if self.is_wildcard() {
            return Err(Error::configuration(format!(
                "wildcard address '{}' cannot be combined with network namespace '{}'",
                self.host, self.namespace
            )));
        }
        Err(Error::configuration(format!(
            "network namespace '{}' is not supported",
            self.namespace
        )))
    }
}

impl fmt::Display for BindAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.has_namespace() {
            write!(f, "{}/{}", self.host, self.namespace)
        } else {
            write!(f, "{}", self.host)
        }
    }
}

/// Accept backlog for a connection limit: `50 + max / 5`, capped at `bound`.
#[must_use]
pub fn listen_backlog(max_connections: u32, bound: u32) -> u32 {
    (50 + max_connections / 5).min(bound)
}

/// Bind a TCP listener, retrying while the port is in use.
///
/// The wildcard host binds a dual-stack IPv6 socket and falls back to IPv4.
///
/// # Errors
/// Returns [`Error::Network`] when the host does not resolve or no address
/// can be bound before `retry_for` elapses or exit is requested.
pub fn bind_tcp(
    address: &BindAddress,
    port: u16,
    backlog: u32,
    retry_for: Duration,
    exit: &ExitFlag,
) -> Result<TcpListener> {
    let candidates = resolve(&address.host, port)?;
    let deadline = Instant::now() + retry_for;

    loop {
        let mut in_use = None;
        let mut last_error = None;

        for candidate in &candidates {
            match open_tcp(*candidate, backlog) {
                Ok(listener) => {
                    info!(address = %candidate, backlog, "TCP listener bound");
                    return Ok(listener);
                },
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                    in_use = Some(e);
                },
                Err(e) => {
                    debug!(address = %candidate, error = %e, "Bind attempt failed");
                    last_error = Some(e);
                },
            }
        }

        let Some(e) = in_use else {
            let detail = last_error.map_or_else(|| "no address".to_string(), |e| e.to_string());
            return Err(Error::network(format!("cannot bind {}:{port}: {detail}", address.host)));
        };
        if exit.is_set() || Instant::now() >= deadline {
            return Err(Error::network(format!("cannot bind {}:{port}: {e}", address.host)));
        }
        warn!(host = %address.host, port, "Port in use, retrying");
        std::thread::sleep(BIND_RETRY_INTERVAL);
    }
}

fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>> {
    if WILDCARD_HOSTS.contains(&host) {
        return Ok(vec![
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)),
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
        ]);
    }
    let addrs: Vec<_> = (host, port)
        .to_socket_addrs()
        .map_err(|e| Error::network(format!("cannot resolve '{host}': {e}")))?
        .collect();
    if addrs.is_empty() {
        return Err(Error::network(format!("'{host}' resolved to no address")));
    }
    Ok(addrs)
}

fn open_tcp(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    if addr.is_ipv6() && addr.ip().is_unspecified() {
        socket.set_only_v6(false)?;
    }
    socket.bind(&addr.into())?;
    socket.listen(backlog_arg(backlog))?;
    Ok(socket.into())
}

/// Bind the local socket at `path`, replacing a stale socket file.
///
/// # Errors
/// Returns [`Error::Network`] when another process is listening on `path`
/// or the socket cannot be created.
pub fn bind_unix(path: &Path, backlog: u32) -> Result<UnixListener> {
    if path.exists() {
        if UnixStream::connect(path).is_ok() {
            return Err(Error::network(format!(
                "local socket {} is in use by another process",
                path.display()
            )));
        }
        debug!(path = %path.display(), "Removing stale socket file");
        std::fs::remove_file(path)
            .map_err(|e| Error::network(format!("cannot remove {}: {e}", path.display())))?;
    }

    let open = || -> io::Result<UnixListener> {
        let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
        socket.bind(&SockAddr::unix(path)?)?;
        socket.listen(backlog_arg(backlog))?;
        Ok(socket.into())
    };
    let listener =
        open().map_err(|e| Error::network(format!("cannot bind {}: {e}", path.display())))?;
    info!(path = %path.display(), backlog, "Local socket bound");
    Ok(listener)
}

fn backlog_arg(backlog: u32) -> i32 {
    i32::try_from(backlog).unwrap_or(i32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_plain_host() {
        let address = BindAddress::parse("127.0.0.1").unwrap();
        assert_eq!(address.host, "127.0.0.1");
        assert_eq!(address.namespace, "");
    }

    #[test]
    fn test_parse_namespace() {
        let address = BindAddress::parse("eth0/ns1").unwrap();
        assert_eq!(address.host, "eth0");
        assert_eq!(address.namespace, "ns1");
        assert_eq!(address.to_string(), "eth0/ns1");
    }

    #[test]
    fn test_parse_rejects_empty_parts() {
        assert!(matches!(BindAddress::parse("/ns1"), Err(BindAddressError::EmptyHost(_))));
        assert!(matches!(BindAddress::parse("eth0/"), Err(BindAddressError::EmptyNamespace(_))));
        assert_eq!(BindAddress::parse(""), Err(BindAddressError::Empty));
    }

    #[test]
    fn test_wildcard_with_namespace_is_configuration_error() {
        for host in WILDCARD_HOSTS {
            let address = BindAddress::parse(&format!("{host}/blue")).unwrap();
            assert!(matches!(address.check_bindable(), Err(Error::Configuration { .. })));
        }
        assert!(BindAddress::parse("*").unwrap().check_bindable().is_ok());
    }

    #[test]
    fn test_backlog() {
        assert_eq!(listen_backlog(100, 900), 70);
        assert_eq!(listen_backlog(5000, 900), 900);
        assert_eq!(listen_backlog(0, 900), 50);
    }

    #[test]
    fn test_bind_tcp_ephemeral_port() {
        let address = BindAddress::parse("127.0.0.1").unwrap();
        let listener = bind_tcp(&address, 0, 10, Duration::ZERO, &ExitFlag::new()).unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[test]
    fn test_bind_tcp_in_use_gives_up_after_timeout() {
        let address = BindAddress::parse("127.0.0.1").unwrap();
        let first = bind_tcp(&address, 0, 10, Duration::ZERO, &ExitFlag::new()).unwrap();
        let port = first.local_addr().unwrap().port();

        let result = bind_tcp(&address, port, 10, Duration::ZERO, &ExitFlag::new());
        assert!(matches!(result, Err(Error::Network { .. })));
    }

    #[test]
    fn test_bind_unix_replaces_stale_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("xfront.sock");
        std::fs::write(&path, b"").unwrap();

        let listener = bind_unix(&path, 10).unwrap();
        assert!(UnixStream::connect(&path).is_ok());
        assert!(bind_unix(&path, 10).is_err());
        drop(listener);
    }

    proptest! {
        #[test]
        fn prop_host_and_namespace_split(
            host in "[a-z0-9.:]{1,16}",
            namespace in "[a-z0-9_]{1,16}",
        ) {
            let address = BindAddress::parse(&format!("{host}/{namespace}")).unwrap();
            prop_assert_eq!(address.host, host);
            prop_assert_eq!(address.namespace, namespace);
        }

        #[test]
        fn prop_plain_host_has_no_namespace(host in "[a-z0-9.:*]{1,16}") {
            let address = BindAddress::parse(&host).unwrap();
            prop_assert!(!address.has_namespace());
            prop_assert!(address.check_bindable().is_ok());
        }
    }
}
