//! Per-node networking: the multiplexed connection and its lifecycle keeper.

pub mod connection;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use futures::future::RemoteHandle;
use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::errors::RequestError;
use connection::{open_connection, Connection, ConnectionConfig};

/// How long a broken connection stays down before the next connect attempt.
const RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// Lifecycle observations emitted by a [`ConnectionKeeper`].
#[derive(Debug)]
pub enum ConnectionEvent {
    Connected {
        address: SocketAddr,
    },
    Disconnected {
        address: SocketAddr,
        reason: String,
    },
    FailedToConnect {
        address: SocketAddr,
        reason: String,
    },
}

/// The two lifecycle states of a kept node connection.
///
/// A keeper starts disconnected, connects on its internal tick, and falls
/// back to disconnected whenever the connection's routing worker reports a
/// fatal error. Every transition into the disconnected state has already
/// drained the in-flight waiters (the router does that before reporting).
pub struct ConnectionKeeper {
    connection: Arc<ArcSwapOption<Connection>>,
    _worker_handle: RemoteHandle<()>,
}

impl ConnectionKeeper {
    /// Starts keeping a connection to `address` alive. The returned handle
    /// stops the background worker when dropped.
    pub fn start(
        address: SocketAddr,
        config: ConnectionConfig,
        event_listener: Option<mpsc::UnboundedSender<ConnectionEvent>>,
    ) -> Self {
        let connection = Arc::new(ArcSwapOption::empty());

        let (worker, _worker_handle) =
            Self::work(address, config, connection.clone(), event_listener).remote_handle();
        tokio::spawn(worker);

        ConnectionKeeper {
            connection,
            _worker_handle,
        }
    }

    /// The live connection, if currently in the connected state.
    pub fn connection(&self) -> Result<Arc<Connection>, RequestError> {
        self.connection.load_full().ok_or(RequestError::NotConnected)
    }

    async fn work(
        address: SocketAddr,
        original_config: ConnectionConfig,
        connection_slot: Arc<ArcSwapOption<Connection>>,
        event_listener: Option<mpsc::UnboundedSender<ConnectionEvent>>,
    ) {
        let notify = |event: ConnectionEvent| {
            if let Some(listener) = &event_listener {
                let _ = listener.send(event);
            }
        };

        loop {
            // The reconfigure hook sees the original options on every
            // attempt, not the output of its previous run.
            let config = original_config.resolve();

            match open_connection(address, &config).await {
                Ok((connection, error_receiver)) => {
                    debug!(node = %address, "Node connection established");
                    connection_slot.store(Some(Arc::new(connection)));
                    notify(ConnectionEvent::Connected { address });

                    let reason = match error_receiver.await {
                        Ok(error) => error.to_string(),
                        // The router finished cleanly, which only happens
                        // when the connection object is dropped.
                        Err(_) => "connection closed".to_string(),
                    };

                    connection_slot.store(None);
                    warn!(node = %address, reason = reason.as_str(), "Node connection lost");
                    notify(ConnectionEvent::Disconnected {
                        address,
                        reason,
                    });
                }
                Err(error) => {
                    warn!(
                        node = %address,
                        error = %error,
                        "Failed to open a connection to the node"
                    );
                    notify(ConnectionEvent::FailedToConnect {
                        address,
                        reason: error.to_string(),
                    });
                }
            }

            tokio::time::sleep(RECONNECT_INTERVAL).await;
        }
    }
}
