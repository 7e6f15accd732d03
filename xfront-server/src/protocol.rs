//! Seam between the connection core and a wire protocol.

use crate::network::Client;
use std::io;

/// Serves one client until it leaves or must be closed.
///
/// Implementations run on a session worker and may block on the client's
/// socket. They should return as soon as [`Client::read_line`] yields
/// `None`; teardown is done by the caller.
pub trait ProtocolHandler: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// # Errors
    /// I/O errors end the connection and are logged by the caller.
    fn serve(&self, client: &mut Client) -> io::Result<()>;
}
