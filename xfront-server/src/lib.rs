//! # xfront server
//!
//! Connection acceptance and session lifecycle for a database server's
//! network front-end.
//!
//! This crate provides:
//! - a listener/acceptor on TCP and local sockets with a shutdown timer
//! - admission control against a live connection limit
//! - a connection registry and per-connection sessions
//! - cross-thread connection kill
//! - TLS negotiation between front-end and engine settings
//! - a shutdown coordinator driven by an exit flag or engine termination
//!
//! The database itself is reached through the [`engine::Engine`] trait and
//! the wire format through [`protocol::ProtocolHandler`]. [`LocalEngine`]
//! and [`TextProtocol`] are in-process stand-ins for both.
//!
//! ## Examples
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use xfront_server::{LocalEngine, ServerHandle};
//! use xfront_core::FrontendConfig;
//!
//! let handle = ServerHandle::new();
//! handle.start(FrontendConfig::default(), Arc::new(LocalEngine::new()))?;
//! handle.get()?.wait_for_startup(Duration::from_secs(10))?;
//! handle.exit();
//! # Ok::<(), xfront_core::Error>(())
//! ```

#![deny(unsafe_code)]
#![warn(clippy::all)]

pub mod admission;
pub mod auth;
pub mod engine;
pub mod grants;
pub mod kill;
pub mod network;
pub mod properties;
pub mod protocol;
pub mod server;
pub mod shutdown;
pub mod status;
pub mod text_protocol;
pub mod tls;

pub use engine::{Engine, LocalEngine, LocalUser};
pub use kill::{kill_client, KillError};
pub use server::{ServerCore, ServerHandle};
pub use shutdown::ExitFlag;
pub use text_protocol::TextProtocol;
pub use xfront_core::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::admission::{AdmissionController, RejectReason};
    pub use crate::engine::{DataContext, Engine, EngineError, SessionProbe};
    pub use crate::network::{Client, ConnectionId, ConnectionState};
    pub use crate::protocol::ProtocolHandler;
    pub use crate::{KillError, ServerCore, ServerHandle};
    pub use xfront_core::prelude::*;
}
