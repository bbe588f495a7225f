//! Core of an async driver for CQL-speaking wide-column stores.
//!
//! The crate is organized around three long-lived actors:
//!
//! * [`network::connection::Connection`] - one multiplexed connection to one
//!   node, routing up to 32,768 concurrent requests by stream id,
//! * [`network::ConnectionKeeper`] - the per-node lifecycle machine that
//!   keeps reopening that connection whenever it breaks,
//! * [`cluster::ClusterSupervisor`] - a control connection to one contact
//!   point that tracks cluster topology and emits host deltas.
//!
//! Everything wire-level lives in the companion `rill-cql` crate.
//!
//! What this crate deliberately leaves to its embedder: typed (de)serialization
//! of CQL values, retry and load-balancing policies, paging iterators, and the
//! prepared-statement cache policy (only its interface is defined here).

pub mod authentication;
pub mod cluster;
pub mod errors;
pub mod network;
pub mod response;
pub mod statement;

pub use rill_cql::frame::types::Consistency;
pub use rill_cql::frame::value::SerializedValues;
pub use rill_cql::frame::version::ProtocolVersion;
pub use rill_cql::frame::Compression;

pub use cluster::{ClusterEvent, ClusterSupervisor, Host};
pub use network::connection::{Connection, ConnectionConfig, SlotSnapshot};
pub use network::{ConnectionEvent, ConnectionKeeper};
pub use statement::{Batch, PreparedStatement, Statement};
