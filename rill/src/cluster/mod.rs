//! Cluster topology tracking.
//!
//! A [`ClusterSupervisor`] keeps one control connection to the cluster,
//! subscribes to its STATUS_CHANGE/TOPOLOGY_CHANGE events, re-reads the
//! `system.local`/`system.peers` tables on a timer, and reduces everything
//! to a stream of host deltas for the embedding layer.

pub(crate) mod control_connection;
pub mod topology;
pub mod worker;

use std::net::{IpAddr, SocketAddr};

pub use topology::Host;
pub use worker::ClusterSupervisor;

/// A delta of the cluster state, as seen by the topology supervisor.
///
/// Deltas are edge-triggered but consumers must treat them idempotently:
/// after a control connection failover the supervisor may re-announce hosts
/// it already reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    /// A node appeared in the peer tables.
    HostAdded(Host),
    /// A node disappeared from the peer tables.
    HostRemoved(Host),
    /// The server reported a node as up.
    HostUp { address: SocketAddr },
    /// The server reported a node as down.
    HostDown { address: SocketAddr },
}

/// Identity of a host: its address and native-protocol port.
pub type HostId = (IpAddr, u16);
