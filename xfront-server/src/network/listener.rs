//! Accept loop.
//!
//! Runs on the network scheduler's single thread inside a current-thread
//! tokio runtime. Besides accepting, the loop drives a one-second timer that
//! polls the shutdown state, and it leaves as soon as the server's
//! cancellation token fires.

use super::stream::{ClientStream, PeerAddress};
use crate::admission::RejectReason;
use crate::server::ServerCore;
use std::future::pending;
use std::io;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::os::unix::net::UnixListener as StdUnixListener;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use xfront_core::{Error, Result};

/// Period of the shutdown poll.
pub const TIMER_PERIOD: Duration = Duration::from_secs(1);

/// Pause after a failed `accept`, so a persistent error does not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Bound listening sockets, in blocking std form.
#[derive(Debug, Default)]
pub struct Listeners {
    pub tcp: Option<StdTcpListener>,
    pub secondary: Option<StdTcpListener>,
    pub unix: Option<(StdUnixListener, PathBuf)>,
}

impl Listeners {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tcp.is_none() && self.secondary.is_none() && self.unix.is_none()
    }

    /// Port of the primary TCP listener.
    #[must_use]
    pub fn tcp_port(&self) -> Option<u16> {
        local_port(self.tcp.as_ref())
    }

    #[must_use]
    pub fn secondary_port(&self) -> Option<u16> {
        local_port(self.secondary.as_ref())
    }
}

fn local_port(listener: Option<&StdTcpListener>) -> Option<u16> {
    listener.and_then(|l| l.local_addr().ok()).map(|addr| addr.port())
}

/// Owns the listeners while the accept loop runs.
pub(crate) struct Acceptor {
    core: Arc<ServerCore>,
    listeners: Listeners,
}

impl Acceptor {
    pub(crate) fn new(core: Arc<ServerCore>, listeners: Listeners) -> Self {
        Self { core, listeners }
    }

    /// Block the current thread until the server stops.
    pub(crate) fn run(self) -> Result<()> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::internal(format!("acceptor runtime: {e}")))?;
        runtime.block_on(self.accept_loop())
    }

    async fn accept_loop(self) -> Result<()> {
        let Self { core, listeners } = self;
        let tcp = listeners.tcp.map(into_tokio_tcp).transpose()?;
        let secondary = listeners.secondary.map(into_tokio_tcp).transpose()?;
        let (unix, socket_path) = match listeners.unix {
            Some((listener, path)) => (Some(into_tokio_unix(listener)?), Some(path)),
            None => (None, None),
        };

        let cancel = core.cancel_token();
        let mut timer = interval(TIMER_PERIOD);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        timer.tick().await;

        info!("Accepting connections");
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("Acceptor cancelled");
                    break;
                }
                _ = timer.tick() => {
                    if !core.on_timer_tick() {
                        break;
                    }
                }
                accepted = accept_tcp(tcp.as_ref()) => {
                    if handle_tcp(&core, accepted).is_err() {
                        sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                }
                accepted = accept_tcp(secondary.as_ref()) => {
                    if handle_tcp(&core, accepted).is_err() {
                        sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                }
                accepted = accept_unix(unix.as_ref()) => {
                    if handle_unix(&core, accepted).is_err() {
                        sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                }
            }
        }

        drop(unix);
        if let Some(path) = socket_path {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "Could not remove socket file");
                }
            }
        }
        info!("Acceptor stopped");
        Ok(())
    }
}

async fn accept_tcp(listener: Option<&TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => pending().await,
    }
}

async fn accept_unix(listener: Option<&UnixListener>) -> io::Result<UnixStream> {
    match listener {
        Some(listener) => listener.accept().await.map(|(stream, _)| stream),
        None => pending().await,
    }
}

fn handle_tcp(
    core: &Arc<ServerCore>,
    accepted: io::Result<(TcpStream, SocketAddr)>,
) -> io::Result<()> {
    let blocking = accepted.and_then(|(stream, peer)| {
        let stream = stream.into_std()?;
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        Ok((stream, peer))
    });

    match blocking {
        Ok((stream, peer)) => {
            core.accept_client(ClientStream::Tcp(stream), PeerAddress::Tcp(peer));
            Ok(())
        },
        Err(e) => {
            reject_failed_accept(core, &e);
            Err(e)
        },
    }
}

fn handle_unix(core: &Arc<ServerCore>, accepted: io::Result<UnixStream>) -> io::Result<()> {
    let blocking = accepted.and_then(|stream| {
        let stream = stream.into_std()?;
        stream.set_nonblocking(false)?;
        Ok(stream)
    });

    match blocking {
        Ok(stream) => {
            core.accept_client(ClientStream::Unix(stream), PeerAddress::Unix);
            Ok(())
        },
        Err(e) => {
            reject_failed_accept(core, &e);
            Err(e)
        },
    }
}

fn reject_failed_accept(core: &ServerCore, e: &io::Error) {
    error!(error = %e, "Accept failed");
    core.admission().did_reject(RejectReason::AcceptError);
}

fn into_tokio_tcp(listener: StdTcpListener) -> Result<TcpListener> {
    listener
        .set_nonblocking(true)
        .and_then(|()| TcpListener::from_std(listener))
        .map_err(|e| Error::network(format!("TCP listener registration failed: {e}")))
}

fn into_tokio_unix(listener: StdUnixListener) -> Result<UnixListener> {
    listener
        .set_nonblocking(true)
        .and_then(|()| UnixListener::from_std(listener))
        .map_err(|e| Error::network(format!("local listener registration failed: {e}")))
}
