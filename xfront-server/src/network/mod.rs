//! Network side of the front-end.
//!
//! ## Key Components
//! - [`bind`]: bind-address parsing and socket creation
//! - [`listener`]: the accept loop and shutdown timer
//! - [`Connection`] and [`ConnectionRegistry`]: shared connection records
//! - [`Session`]: the authenticated context of a connection
//! - [`Client`]: the worker-owned end handed to the protocol handler
//!
//! ## Ownership
//!
//! ```text
//! registry ──Arc──► Connection ◄──Arc── worker (Client)
//!                       │    ▲
//!                       │    └──Arc── killer thread (terminate only)
//!                       ▼
//!               session slot ──Arc──► SessionShared ◄── Session (worker)
//! ```

pub mod bind;
pub mod client;
pub mod connection;
pub mod listener;
pub mod session;
pub mod stream;

pub use bind::{listen_backlog, BindAddress, BindAddressError};
pub use client::{Client, ClientError};
pub use connection::{
    Connection, ConnectionId, ConnectionRegistry, ConnectionState, ControlMessage,
};
pub use listener::{Listeners, TIMER_PERIOD};
pub use session::{Session, SessionShared};
pub use stream::{Channel, ClientStream, PeerAddress, TransportKind};
