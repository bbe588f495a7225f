//! Error types surfaced by the driver core.
//!
//! The split follows the propagation policy of the connection machine:
//! transport and decode failures are fatal to the connection and travel as
//! [`BrokenConnectionError`] (every in-flight waiter receives a clone),
//! server errors travel to a single waiter as [`RequestError::DbError`],
//! and caller-local timeouts never touch the connection at all.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rill_cql::frame::frame_errors::{FrameError, ParseError};
use rill_cql::frame::response::error::DbError;
use rill_cql::frame::version::ProtocolVersion;
use rill_cql::frame::Compression;
use thiserror::Error;

/// An error that prevented a connection from reaching, or staying in, its
/// connected state.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ConnectionError {
    #[error("Connect timeout elapsed")]
    ConnectTimeout,
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("Could not complete the connection setup: {0}")]
    Setup(#[from] ConnectionSetupError),
    #[error(
        "Protocol negotiation failed: server rejected every offered version down to {last_tried}"
    )]
    ProtocolNegotiationFailed { last_tried: ProtocolVersion },
    #[error(
        "Compression algorithm {algorithm} requested, but the server supports only {supported:?}"
    )]
    UnsupportedCompression {
        algorithm: Compression,
        supported: Vec<String>,
    },
    #[error(transparent)]
    BrokenConnection(#[from] BrokenConnectionError),
}

/// A failure of one of the setup requests (OPTIONS, STARTUP, AUTH exchange,
/// initial USE, REGISTER).
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ConnectionSetupError {
    #[error("{request} request failed with database error [{}]: {reason}", .error.code())]
    DbError {
        request: &'static str,
        error: DbError,
        reason: String,
    },
    #[error("Expected {expected} in response to {request}, got {got}")]
    UnexpectedResponse {
        request: &'static str,
        expected: &'static str,
        got: &'static str,
    },
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("Failed to parse response body: {0}")]
    ResponseParse(#[from] ParseError),
    #[error("Server demands authentication with {authenticator}, but no authenticator configured")]
    MissingAuthentication { authenticator: String },
    #[error("Authentication error: {0}")]
    Authentication(String),
    #[error("USE query returned keyspace {got:?}, expected {expected:?}")]
    KeyspaceNameMismatch { expected: String, got: String },
}

/// The reason a connection broke. Shared by all waiters that were in flight
/// at the moment of the breakage.
#[derive(Error, Debug, Clone)]
#[error("Connection broken, reason: {0}")]
pub struct BrokenConnectionError(Arc<BrokenConnectionErrorKind>);

impl BrokenConnectionError {
    pub fn kind(&self) -> &BrokenConnectionErrorKind {
        &self.0
    }
}

impl From<BrokenConnectionErrorKind> for BrokenConnectionError {
    fn from(value: BrokenConnectionErrorKind) -> Self {
        BrokenConnectionError(Arc::new(value))
    }
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BrokenConnectionErrorKind {
    #[error("Failed to read from socket: {0}")]
    ReadError(std::io::Error),
    #[error("Failed to write to socket: {0}")]
    WriteError(std::io::Error),
    #[error("Malformed frame: {0}")]
    FrameError(#[from] FrameError),
    #[error("Received a frame with unexpected stream id {0}")]
    UnexpectedStreamId(i16),
    #[error("Failed to handle a server event: {0}")]
    EventHandling(#[from] ParseError),
    #[error("Expected EVENT response on stream -1, got {0}")]
    UnexpectedEventResponse(&'static str),
    #[error("Connection routing task terminated")]
    ChannelError,
    #[error("Timed out waiting for response to keepalive request on connection to {0}")]
    KeepaliveTimeout(SocketAddr),
    #[error("Keepalive request failed: {0}")]
    KeepaliveRequestError(Arc<RequestError>),
}

/// An error of a single request on an established connection.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RequestError {
    #[error("Connection is not established")]
    NotConnected,
    #[error("All stream ids are occupied")]
    UnableToAllocStreamId,
    #[error(transparent)]
    BrokenConnection(#[from] BrokenConnectionError),
    #[error("Failed to serialize request: {0}")]
    Serialization(#[from] FrameError),
    #[error("Failed to parse response: {0}")]
    ResponseParse(#[from] ParseError),
    #[error("Database error [{}]: {reason}", .error.code())]
    DbError { error: DbError, reason: String },
    #[error("Unexpected response kind: {0}")]
    UnexpectedResponse(&'static str),
    #[error("Request timed out after {0:?}; its stream id stays reserved until the response arrives")]
    RequestTimeout(Duration),
    #[error(
        "Statement requests {request} compression, but the connection negotiated {connection:?}"
    )]
    CompressionMismatch {
        connection: Option<Compression>,
        request: Compression,
    },
    #[error("Statement re-preparation changed its id (expected {expected_id:?}, got {reprepared_id:?})")]
    RepreparedIdChanged {
        statement: String,
        expected_id: Vec<u8>,
        reprepared_id: Vec<u8>,
    },
    #[error("USE query returned keyspace {got:?}, expected {expected:?}")]
    KeyspaceNameMismatch { expected: String, got: String },
}

impl RequestError {
    /// Whether this error indicates the request never reached a healthy
    /// connection (as opposed to being judged by the server).
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            RequestError::NotConnected
                | RequestError::BrokenConnection(_)
                | RequestError::UnableToAllocStreamId
        )
    }
}

/// An error of the topology supervisor.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum MetadataError {
    #[error("No contact point is reachable")]
    NoReachableContactPoint,
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error("system.{table} returned a malformed row: {reason}")]
    MalformedSystemRow {
        table: &'static str,
        reason: &'static str,
    },
}
