//! Specially treated single connection used to fetch topology and receive
//! events from the cluster.

use std::net::SocketAddr;

use crate::errors::MetadataError;
use crate::network::connection::{Connection, ErrorReceiver};

use super::topology::{self, Host};

/// The supervisor's view of its one control connection.
///
/// The underlying connection was opened with an event sender configured, so
/// it has already REGISTERed for STATUS_CHANGE and TOPOLOGY_CHANGE during
/// its setup.
pub(super) struct ControlConnection {
    connection: Connection,
}

impl ControlConnection {
    pub(super) fn new(connection: Connection) -> Self {
        Self { connection }
    }

    pub(super) fn get_connect_address(&self) -> SocketAddr {
        self.connection.get_connect_address()
    }

    /// Re-reads `system.local` and `system.peers`. The node this connection
    /// goes to is always the first returned host.
    pub(super) async fn query_topology(&self) -> Result<Vec<Host>, MetadataError> {
        topology::query_topology(&self.connection, self.connection.get_connect_address().port())
            .await
    }
}

/// The connection paired with the channel its routing worker reports fatal
/// errors on.
pub(super) struct ControlConnectionHandle {
    pub(super) connection: ControlConnection,
    pub(super) error_receiver: ErrorReceiver,
}
