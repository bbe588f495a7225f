//! Statements, prepared statements, batches and the prepared-cache seam.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
pub use rill_cql::frame::request::batch::BatchType;
use rill_cql::frame::response::result::{PreparedMetadata, ResultMetadata};
use rill_cql::frame::types::{Consistency, SerialConsistency};
use rill_cql::frame::Compression;

/// Configuration common to statements, prepared statements and batches.
#[derive(Debug, Clone, Default)]
pub struct StatementConfig {
    /// Consistency to use; the connection default applies when unset.
    pub consistency: Option<Consistency>,
    pub serial_consistency: Option<SerialConsistency>,
    /// Whether to request a server-side trace of the execution.
    pub tracing: bool,
    /// Client timestamp attached to the mutation.
    pub timestamp: Option<i64>,
    /// Caller-local response timeout. The stream id is not reclaimed when it
    /// fires; the late response releases it on arrival.
    pub request_timeout: Option<Duration>,
    /// Per-statement compression expectation. Must match what the connection
    /// negotiated; used to catch statements prepared for a differently
    /// configured connection.
    pub compression: Option<Compression>,
    /// Opaque key/value payload forwarded to the server alongside the request.
    pub custom_payload: Option<HashMap<String, Vec<u8>>>,
}

impl StatementConfig {
    pub(crate) fn determine_consistency(&self, default_consistency: Consistency) -> Consistency {
        self.consistency.unwrap_or(default_consistency)
    }
}

/// An unprepared CQL statement.
#[derive(Debug, Clone, Default)]
pub struct Statement {
    pub contents: String,
    pub config: StatementConfig,
    pub page_size: Option<i32>,
}

impl Statement {
    pub fn new(contents: impl Into<String>) -> Self {
        Self {
            contents: contents.into(),
            config: Default::default(),
            page_size: None,
        }
    }

    pub fn with_page_size(mut self, page_size: i32) -> Self {
        self.page_size = Some(page_size);
        self
    }
}

impl From<String> for Statement {
    fn from(contents: String) -> Statement {
        Statement::new(contents)
    }
}

impl From<&str> for Statement {
    fn from(contents: &str) -> Statement {
        Statement::new(contents.to_owned())
    }
}

/// A statement prepared on some connection, executable by id.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    statement: Arc<Statement>,
    id: Bytes,
    result_metadata_id: Option<Bytes>,
    prepared_metadata: Arc<PreparedMetadata>,
    result_metadata: Arc<ResultMetadata>,
}

impl PreparedStatement {
    pub(crate) fn new(
        statement: Statement,
        id: Bytes,
        result_metadata_id: Option<Bytes>,
        prepared_metadata: PreparedMetadata,
        result_metadata: ResultMetadata,
    ) -> Self {
        Self {
            statement: Arc::new(statement),
            id,
            result_metadata_id,
            prepared_metadata: Arc::new(prepared_metadata),
            result_metadata: Arc::new(result_metadata),
        }
    }

    pub fn get_id(&self) -> &Bytes {
        &self.id
    }

    pub fn get_result_metadata_id(&self) -> Option<&Bytes> {
        self.result_metadata_id.as_ref()
    }

    pub fn get_statement(&self) -> &Statement {
        &self.statement
    }

    pub fn get_prepared_metadata(&self) -> &PreparedMetadata {
        &self.prepared_metadata
    }

    pub fn get_result_metadata(&self) -> &ResultMetadata {
        &self.result_metadata
    }

    pub fn config(&self) -> &StatementConfig {
        &self.statement.config
    }
}

/// A batch of statements executed as one request.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub statements: Vec<BatchStatement>,
    pub batch_type: BatchType,
    pub config: StatementConfig,
}

impl Batch {
    pub fn new(batch_type: BatchType) -> Self {
        Self {
            batch_type,
            ..Default::default()
        }
    }

    pub fn append_statement(&mut self, statement: impl Into<BatchStatement>) {
        self.statements.push(statement.into());
    }
}

#[derive(Debug, Clone)]
pub enum BatchStatement {
    Query(Statement),
    Prepared(PreparedStatement),
}

impl From<Statement> for BatchStatement {
    fn from(statement: Statement) -> Self {
        BatchStatement::Query(statement)
    }
}

impl From<PreparedStatement> for BatchStatement {
    fn from(prepared: PreparedStatement) -> Self {
        BatchStatement::Prepared(prepared)
    }
}

/// Interface of the prepared-statement cache.
///
/// The caching policy (capacity, eviction, sharing between connections) is
/// the embedder's business; the connection only consults and fills the cache,
/// emitting hit/miss observations as it goes.
pub trait PreparedCache: Send + Sync {
    /// Returns a previously prepared statement for this statement text, if cached.
    fn lookup(&self, statement_text: &str) -> Option<PreparedStatement>;

    /// Stores a freshly prepared statement.
    fn store(&self, prepared: &PreparedStatement);

    /// Drops a cache entry, e.g. after the server reported it unprepared.
    fn evict(&self, statement_text: &str);
}
