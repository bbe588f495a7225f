//! The long-lived topology supervisor.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use futures::future::RemoteHandle;
use futures::FutureExt;
use rand::seq::SliceRandom;
use rill_cql::frame::response::event::{Event, StatusChangeEvent, TopologyChangeEvent};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::control_connection::{ControlConnection, ControlConnectionHandle};
use super::topology::{diff_hosts, Host};
use super::{ClusterEvent, HostId};
use crate::errors::MetadataError;
use crate::network::connection::{open_connection, ConnectionConfig};

/// Wait before re-reading topology after a TOPOLOGY_CHANGE event, giving the
/// cluster time to settle (a joining node announces itself before its peer
/// row is complete everywhere).
const EVENT_REFRESH_DELAY: Duration = Duration::from_secs(5);

/// Wait between control connection attempts after a full pass over the
/// candidate nodes failed.
const RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// Size of the channel the control connection pushes server events into.
const EVENT_CHANNEL_SIZE: usize = 32;

/// Keeps cluster topology fresh and streams host deltas to its consumer.
///
/// One control connection is maintained at a time. When it breaks, the
/// supervisor connects to another known host; the initial contact points
/// remain the fallback when no peer is reachable.
pub struct ClusterSupervisor {
    _worker_handle: RemoteHandle<()>,
}

impl ClusterSupervisor {
    /// Starts the supervisor. Host deltas and up/down observations arrive on
    /// the returned receiver; dropping the [`ClusterSupervisor`] stops the
    /// background worker.
    pub fn start(
        contact_points: Vec<SocketAddr>,
        connection_config: ConnectionConfig,
        refresh_interval: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<ClusterEvent>) {
        let (delta_sender, delta_receiver) = mpsc::unbounded_channel();
        let (event_sender, event_receiver) = mpsc::channel(EVENT_CHANNEL_SIZE);

        let mut config = connection_config;
        config.event_sender = Some(event_sender);

        let worker = SupervisorWorker {
            contact_points,
            candidates: Vec::new(),
            config,
            refresh_interval,
            delta_sender,
            known_hosts: HashMap::new(),
        };

        let (fut, _worker_handle) = worker.work(event_receiver).remote_handle();
        tokio::spawn(fut);

        (ClusterSupervisor { _worker_handle }, delta_receiver)
    }
}

struct SupervisorWorker {
    /// The endpoints given at construction; never forgotten.
    contact_points: Vec<SocketAddr>,
    /// Endpoints learned from topology, preferred for failover.
    candidates: Vec<SocketAddr>,
    config: ConnectionConfig,
    refresh_interval: Duration,
    delta_sender: mpsc::UnboundedSender<ClusterEvent>,
    known_hosts: HashMap<HostId, Host>,
}

impl SupervisorWorker {
    async fn work(mut self, mut server_events: mpsc::Receiver<Event>) {
        loop {
            let Some(handle) = self.establish_control_connection().await else {
                // Consumer is gone; nothing left to supervise for.
                return;
            };
            let ControlConnectionHandle {
                connection,
                mut error_receiver,
            } = handle;

            if let Err(error) = self.refresh_topology(&connection).await {
                warn!(
                    node = %connection.get_connect_address(),
                    error = %error,
                    "Initial topology read failed; rotating the control connection"
                );
                tokio::time::sleep(RECONNECT_INTERVAL).await;
                continue;
            }

            let mut refresh_deadline = Instant::now() + self.refresh_interval;

            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(refresh_deadline) => {
                        match self.refresh_topology(&connection).await {
                            Ok(()) => {
                                refresh_deadline = Instant::now() + self.refresh_interval;
                            }
                            Err(error) => {
                                warn!(
                                    node = %connection.get_connect_address(),
                                    error = %error,
                                    "Topology refresh failed; rotating the control connection"
                                );
                                break;
                            }
                        }
                    }

                    event = server_events.recv() => {
                        match event {
                            Some(event) => {
                                self.handle_server_event(event, &mut refresh_deadline);
                            }
                            // All event senders dropped; the control
                            // connection must be gone.
                            None => break,
                        }
                    }

                    reason = &mut error_receiver => {
                        match reason {
                            Ok(error) => warn!(
                                node = %connection.get_connect_address(),
                                error = %error,
                                "Control connection broke"
                            ),
                            Err(_) => warn!(
                                node = %connection.get_connect_address(),
                                "Control connection worker vanished"
                            ),
                        }
                        break;
                    }
                }

                if self.delta_sender.is_closed() {
                    return;
                }
            }
        }
    }

    /// Connects to candidates (learned peers first, then the original
    /// contact points) in random order until one handshake succeeds.
    /// Returns `None` only when the consumer dropped the delta channel.
    async fn establish_control_connection(&mut self) -> Option<ControlConnectionHandle> {
        loop {
            let mut endpoints = if self.candidates.is_empty() {
                self.contact_points.clone()
            } else {
                self.candidates.clone()
            };
            endpoints.shuffle(&mut rand::rng());

            for endpoint in endpoints {
                if self.delta_sender.is_closed() {
                    return None;
                }

                debug!(node = %endpoint, "Attempting to establish a control connection");
                match open_connection(endpoint, &self.config).await {
                    Ok((connection, error_receiver)) => {
                        debug!(node = %endpoint, "Control connection established");
                        return Some(ControlConnectionHandle {
                            connection: ControlConnection::new(connection),
                            error_receiver,
                        });
                    }
                    Err(error) => {
                        warn!(
                            node = %endpoint,
                            error = %error,
                            "Failed to establish a control connection"
                        );
                    }
                }
            }

            // Learned peers may all be gone (e.g. the whole cluster moved);
            // fall back to the original contact points on the next pass.
            self.candidates.clear();
            tokio::time::sleep(RECONNECT_INTERVAL).await;
        }
    }

    async fn refresh_topology(
        &mut self,
        connection: &ControlConnection,
    ) -> Result<(), MetadataError> {
        let fresh = connection.query_topology().await?;
        debug!(hosts = fresh.len(), "Fetched topology");

        let (added, removed) = diff_hosts(&self.known_hosts, &fresh);

        for host in removed {
            self.known_hosts.remove(&host.id());
            let _ = self.delta_sender.send(ClusterEvent::HostRemoved(host));
        }
        for host in added {
            self.known_hosts.insert(host.id(), host.clone());
            let _ = self.delta_sender.send(ClusterEvent::HostAdded(host));
        }
        // Unchanged hosts are deliberately not re-announced, but metadata
        // updates (rack moves, token changes) are still recorded.
        for host in fresh {
            self.known_hosts.insert(host.id(), host);
        }

        self.candidates = self
            .known_hosts
            .values()
            .map(|host| SocketAddr::new(host.address, host.port))
            .collect();

        Ok(())
    }

    fn handle_server_event(&mut self, event: Event, refresh_deadline: &mut Instant) {
        debug!(event = ?event, "Received server event");
        match event {
            Event::StatusChange(StatusChangeEvent::Up(address)) => {
                let _ = self.delta_sender.send(ClusterEvent::HostUp { address });
            }
            Event::StatusChange(StatusChangeEvent::Down(address)) => {
                let _ = self.delta_sender.send(ClusterEvent::HostDown { address });
            }
            Event::TopologyChange(
                TopologyChangeEvent::NewNode(_) | TopologyChangeEvent::RemovedNode(_),
            ) => {
                // Re-read the peer tables shortly, but never later than the
                // regular refresh would have run anyway.
                let event_deadline = Instant::now() + EVENT_REFRESH_DELAY;
                if event_deadline < *refresh_deadline {
                    *refresh_deadline = event_deadline;
                }
            }
            Event::TopologyChange(TopologyChangeEvent::MovedNode(address)) => {
                warn!(node = %address, "Ignoring MOVED_NODE event");
            }
            Event::SchemaChange(change) => {
                debug!(change = ?change, "Ignoring schema change event");
            }
        }
    }
}
