// ABOUTME: Convenience constructors for wrapping an already-established transport as a
// ABOUTME: Connection

use crate::connection::Connection;
use crate::transport::{ConnectionListener, Transport};
use std::sync::Arc;

/// Factory for turning an already-connected [`Transport`] into a running
/// [`Connection`].
///
/// A `Connection` is created from a URI or accepted socket; resolving the URI
/// or accepting the socket is the caller's concern (it sits in the
/// out-of-scope transport/listening layer), so both constructors here take a
/// `Transport` the caller has already established. A deprecated
/// "simple single-frame" connection variant is not offered — only the full
/// multiplexer is built.
pub struct ConnectionBuilder;

impl ConnectionBuilder {
    /// Wrap a transport as the initiating (client) side of a BLIP session.
    pub fn client<T: Transport>(transport: T, listener: Arc<dyn ConnectionListener>) -> Connection {
        Connection::open(transport, listener)
    }

    /// Wrap an accepted transport as the responding (server) side of a BLIP
    /// session. Identical to [`client`](ConnectionBuilder::client): BLIP is
    /// symmetric once the transport exists, so only the listener each side
    /// installs differs.
    pub fn accept<T: Transport>(transport: T, listener: Arc<dyn ConnectionListener>) -> Connection {
        Connection::open(transport, listener)
    }
}
