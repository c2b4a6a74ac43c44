//! Client connection metadata.

use super::ConnectionId;
use std::net::SocketAddr;
use std::time::{Duration, SystemTime};

/// Bookkeeping for one accepted client connection.
///
/// The player identity is not known here; it only appears once the client
/// sends a `Register` frame and lives in the multiplexer's session.
#[derive(Debug, Clone)]
pub struct ClientConnection {
    /// Identifier used to correlate log lines for this connection
    pub id: ConnectionId,

    /// The remote network address of the client
    pub remote_addr: SocketAddr,

    /// When this connection was established
    pub connected_at: SystemTime,
}

impl ClientConnection {
    pub fn new(remote_addr: SocketAddr) -> Self {
        Self {
            id: ConnectionId::new_v4(),
            remote_addr,
            connected_at: SystemTime::now(),
        }
    }

    /// How long the connection has been open.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed().unwrap_or_default()
    }
}
