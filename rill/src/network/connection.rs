//! A single multiplexed connection to one node.
//!
//! The connection performs its whole handshake (OPTIONS/SUPPORTED/STARTUP,
//! optional authentication, optional initial USE, optional REGISTER) on the
//! raw stream, so protocol version, compression and v5 framing are all
//! settled before the routing worker ever starts. The worker then owns the
//! socket: a reader half routes inbound envelopes to waiters by stream id,
//! a writer half drains the submit queue, and an optional keepaliver probes
//! the node with OPTIONS requests.
//!
//! Requests run in caller context. A caller checks out a slot (stream id +
//! an immutable snapshot of the dispatch context), encodes its request
//! against that snapshot and submits the bytes; the response is delivered
//! through a one-shot channel. Caller-side timeouts drop the channel's
//! receiving half and nothing else: the stream id stays reserved until the
//! late response arrives and is discarded, which avoids ever reusing an id
//! that the server may still answer.

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use bytes::Bytes;
use futures::{future::RemoteHandle, FutureExt};
use rill_cql::frame::request::batch as cql_batch;
use rill_cql::frame::request::query::{Query, QueryParameters};
use rill_cql::frame::request::startup::{
    Startup, COMPRESSION, CQL_VERSION, DEFAULT_CQL_VERSION, DEFAULT_DRIVER_NAME,
    DEFAULT_DRIVER_VERSION, DRIVER_NAME, DRIVER_VERSION,
};
use rill_cql::frame::request::{
    AuthResponse, Execute, Options, Prepare, Register, SerializableRequest,
};
use rill_cql::frame::response::error::DbError;
use rill_cql::frame::response::event::Event;
use rill_cql::frame::response::result;
use rill_cql::frame::response::{Response, ResponseOpcode, Supported};
use rill_cql::frame::segment;
use rill_cql::frame::server_event_type::EventType;
use rill_cql::frame::types::Consistency;
use rill_cql::frame::value::SerializedValues;
use rill_cql::frame::version::{downgrade_hint, ProtocolVersion};
use rill_cql::frame::{
    self, Compression, FrameParams, SerializedRequest,
};
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_rustls::rustls::pki_types::ServerName;
use tracing::{debug, error, trace, warn};

use crate::authentication::Authenticator;
use crate::errors::{
    BrokenConnectionError, BrokenConnectionErrorKind, ConnectionError, ConnectionSetupError,
    RequestError,
};
use crate::response::{QueryResponse, QueryResult};
use crate::statement::{
    Batch, BatchStatement, PreparedCache, PreparedStatement, Statement, StatementConfig,
};

/// Number of multiplexing slots per connection. Stream ids are signed 16-bit
/// on the wire and negative ids belong to the server, which leaves exactly
/// this many usable ids.
pub const STREAM_ID_COUNT: usize = 1 << 15;

/// TLS material for encrypted connections.
#[derive(Clone)]
pub struct TlsContext {
    connector: tokio_rustls::TlsConnector,
}

impl TlsContext {
    pub fn new(config: Arc<tokio_rustls::rustls::ClientConfig>) -> Self {
        Self {
            connector: config.into(),
        }
    }
}

/// A hook applied to the connection options before every connect attempt.
pub type ConfigureHook = Arc<dyn Fn(ConnectionConfig) -> ConnectionConfig + Send + Sync>;

/// Configuration of a single node connection.
#[derive(Clone)]
pub struct ConnectionConfig {
    /// Protocol version to speak; `None` auto-negotiates starting from the
    /// newest supported one.
    pub protocol_version: Option<ProtocolVersion>,
    pub compression: Option<Compression>,
    /// Keyspace to USE right after the handshake.
    pub keyspace: Option<String>,
    pub default_consistency: Consistency,
    pub tcp_nodelay: bool,
    pub tcp_keepalive_interval: Option<Duration>,
    pub connect_timeout: Duration,
    /// Interval of protocol-level keepalive probes (OPTIONS requests).
    pub keepalive_interval: Option<Duration>,
    pub keepalive_timeout: Option<Duration>,
    /// Encryption; plain TCP when absent.
    pub tls: Option<TlsContext>,
    pub authenticator: Option<Arc<dyn Authenticator>>,
    /// Set only on control connections; makes the connection REGISTER for
    /// events and forward them here.
    pub event_sender: Option<mpsc::Sender<Event>>,
    pub prepared_cache: Option<Arc<dyn PreparedCache>>,
    /// Applied to a copy of the original options on every connect attempt.
    pub configure: Option<ConfigureHook>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            protocol_version: None,
            compression: None,
            keyspace: None,
            default_consistency: Consistency::default(),
            tcp_nodelay: true,
            tcp_keepalive_interval: None,
            connect_timeout: Duration::from_secs(5),
            keepalive_interval: None,
            keepalive_timeout: None,
            tls: None,
            authenticator: None,
            event_sender: None,
            prepared_cache: None,
            configure: None,
        }
    }
}

impl ConnectionConfig {
    /// Resolves the per-attempt options by running the configure hook, if any.
    pub(crate) fn resolve(&self) -> ConnectionConfig {
        match &self.configure {
            Some(hook) => hook(self.clone()),
            None => self.clone(),
        }
    }
}

// Used to listen for a fatal error on the connection.
pub type ErrorReceiver = oneshot::Receiver<ConnectionError>;

type ResponseHandler = oneshot::Sender<Result<TaskResponse, BrokenConnectionError>>;

struct Task {
    data: Vec<u8>,
}

#[derive(Debug)]
pub(crate) struct TaskResponse {
    pub(crate) params: FrameParams,
    pub(crate) opcode: ResponseOpcode,
    pub(crate) body: Bytes,
}

/// An immutable snapshot of the dispatch context, taken at checkout time.
#[derive(Debug, Clone)]
pub struct SlotSnapshot {
    pub stream_id: i16,
    pub address: SocketAddr,
    pub protocol_version: ProtocolVersion,
    pub compression: Option<Compression>,
    pub keyspace: Option<String>,
}

/// A checked-out stream id together with its reply channel. Consumed by
/// dispatching exactly one request.
#[derive(Debug)]
pub struct Slot {
    snapshot: SlotSnapshot,
    receiver: oneshot::Receiver<Result<TaskResponse, BrokenConnectionError>>,
}

impl Slot {
    pub fn snapshot(&self) -> &SlotSnapshot {
        &self.snapshot
    }
}

struct RouterHandle {
    submit_channel: mpsc::Sender<Task>,
    handler_map: Arc<StdMutex<ResponseHandlerMap>>,
}

impl RouterHandle {
    fn allocate(
        &self,
        handler: ResponseHandler,
        forced_stream_id: Option<i16>,
    ) -> Result<i16, RequestError> {
        let mut map = self.handler_map.lock().unwrap();
        map.allocate(handler, forced_stream_id)
            .map_err(|_| RequestError::UnableToAllocStreamId)
    }

    async fn submit(&self, data: Vec<u8>, stream_id: i16) -> Result<(), RequestError> {
        if self.submit_channel.send(Task { data }).await.is_err() {
            // The router is gone; give the id back and drop the handler so
            // the caller observes a broken connection right away.
            let _ = self.handler_map.lock().unwrap().lookup(stream_id);
            return Err(BrokenConnectionError::from(BrokenConnectionErrorKind::ChannelError).into());
        }
        Ok(())
    }
}

/// Per-request envelope options, snapshotted from statement configuration.
#[derive(Default)]
struct RequestOptions<'a> {
    tracing: bool,
    timeout: Option<Duration>,
    custom_payload: Option<&'a HashMap<String, Vec<u8>>>,
}

impl<'a> From<&'a StatementConfig> for RequestOptions<'a> {
    fn from(config: &'a StatementConfig) -> Self {
        Self {
            tracing: config.tracing,
            timeout: config.request_timeout,
            custom_payload: config.custom_payload.as_ref(),
        }
    }
}

/// Parameters the routing worker needs, settled during the handshake.
#[derive(Clone)]
struct RouterConfig {
    version: ProtocolVersion,
    compression: Option<Compression>,
    event_sender: Option<mpsc::Sender<Event>>,
    keepalive_interval: Option<Duration>,
    keepalive_timeout: Option<Duration>,
    address: SocketAddr,
}

impl RouterConfig {
    /// Compression of the envelope body; v5 compresses the outer segments
    /// instead.
    fn envelope_compression(&self) -> Option<Compression> {
        if self.version.uses_outer_framing() {
            None
        } else {
            self.compression
        }
    }
}

/// An established, handshake-complete connection to one node.
pub struct Connection {
    _worker_handle: RemoteHandle<()>,

    connect_address: SocketAddr,
    config: ConnectionConfig,
    version: ProtocolVersion,
    compression: Option<Compression>,
    current_keyspace: StdMutex<Option<String>>,
    router_handle: Arc<RouterHandle>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("connect_address", &self.connect_address)
            .field("version", &self.version)
            .field("compression", &self.compression)
            .finish_non_exhaustive()
    }
}

impl Connection {
    fn spawn<S>(
        stream: S,
        connect_address: SocketAddr,
        config: ConnectionConfig,
        version: ProtocolVersion,
        compression: Option<Compression>,
        current_keyspace: Option<String>,
    ) -> (Self, ErrorReceiver)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        // TODO: benchmark a reasonable submit queue depth under load.
        let (submit_sender, submit_receiver) = mpsc::channel(1024);
        let (error_sender, error_receiver) = oneshot::channel();
        let handler_map = Arc::new(StdMutex::new(ResponseHandlerMap::new()));

        let router_handle = Arc::new(RouterHandle {
            submit_channel: submit_sender,
            handler_map,
        });

        let router_config = RouterConfig {
            version,
            compression,
            event_sender: config.event_sender.clone(),
            keepalive_interval: config.keepalive_interval,
            keepalive_timeout: config.keepalive_timeout,
            address: connect_address,
        };

        let (task, _worker_handle) = Self::router(
            stream,
            submit_receiver,
            error_sender,
            router_handle.clone(),
            router_config,
        )
        .remote_handle();
        tokio::task::spawn(task);

        let connection = Connection {
            _worker_handle,
            connect_address,
            config,
            version,
            compression,
            current_keyspace: StdMutex::new(current_keyspace),
            router_handle,
        };

        (connection, error_receiver)
    }

    pub fn get_connect_address(&self) -> SocketAddr {
        self.connect_address
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn compression(&self) -> Option<Compression> {
        self.compression
    }

    pub fn current_keyspace(&self) -> Option<String> {
        self.current_keyspace.lock().unwrap().clone()
    }

    /// Number of stream ids currently free. Full capacity is
    /// [`STREAM_ID_COUNT`]; anything less means requests are in flight.
    pub fn free_slots(&self) -> usize {
        self.router_handle
            .handler_map
            .lock()
            .unwrap()
            .free_ids_count()
    }

    /// Atomically moves a stream id from the free set to the in-flight map
    /// and snapshots the dispatch context.
    pub fn checkout(&self) -> Result<Slot, RequestError> {
        self.checkout_at(None)
    }

    /// Like [`Connection::checkout`], but claims a specific stream id.
    /// Fails when that id is already in flight.
    pub fn checkout_at(&self, forced_stream_id: Option<i16>) -> Result<Slot, RequestError> {
        let (sender, receiver) = oneshot::channel();
        let stream_id = self.router_handle.allocate(sender, forced_stream_id)?;
        Ok(Slot {
            snapshot: SlotSnapshot {
                stream_id,
                address: self.connect_address,
                protocol_version: self.version,
                compression: self.compression,
                keyspace: self.current_keyspace(),
            },
            receiver,
        })
    }

    /// Writes an encoded request on the slot's stream id and awaits its
    /// response.
    pub async fn dispatch(
        &self,
        slot: Slot,
        mut serialized: SerializedRequest,
    ) -> Result<QueryResponse, RequestError> {
        serialized.set_stream(slot.snapshot.stream_id);
        self.router_handle
            .submit(serialized.into_data(), slot.snapshot.stream_id)
            .await?;

        let task_response = match slot.receiver.await {
            Ok(res) => res?,
            // Sender dropped without a drain pass; the routing worker was
            // torn down abruptly.
            Err(_) => {
                return Err(
                    BrokenConnectionError::from(BrokenConnectionErrorKind::ChannelError).into(),
                )
            }
        };

        let response = self.parse_response(task_response)?;

        // Advisory: any successful USE observed on this connection updates
        // the keyspace snapshot handed to future checkouts.
        if let Response::Result(result::Result::SetKeyspace(ref sk)) = response.response {
            *self.current_keyspace.lock().unwrap() = Some(sk.keyspace_name.clone());
        }

        Ok(response)
    }

    fn parse_response(&self, task_response: TaskResponse) -> Result<QueryResponse, RequestError> {
        let envelope_compression = if self.version.uses_outer_framing() {
            None
        } else {
            self.compression
        };

        let body_with_ext = frame::parse_response_body_extensions(
            task_response.params.flags,
            envelope_compression,
            task_response.body,
        )
        .map_err(|err| {
            RequestError::BrokenConnection(BrokenConnectionErrorKind::FrameError(err).into())
        })?;

        for warn_description in &body_with_ext.warnings {
            warn!(
                warning = warn_description.as_str(),
                "Response from the database contains a warning",
            );
        }

        let response = Response::deserialize(
            self.version,
            task_response.opcode,
            &mut &*body_with_ext.body,
        )?;

        Ok(QueryResponse {
            response,
            warnings: body_with_ext.warnings,
            tracing_id: body_with_ext.trace_id,
            custom_payload: body_with_ext.custom_payload,
        })
    }

    async fn send_request(
        &self,
        request: &impl SerializableRequest,
        compress: bool,
        request_options: &RequestOptions<'_>,
        forced_stream_id: Option<i16>,
    ) -> Result<QueryResponse, RequestError> {
        let compression = if compress { self.compression } else { None };
        let serialized = SerializedRequest::make_with_custom_payload(
            request,
            self.version,
            compression,
            request_options.tracing,
            request_options.custom_payload,
        )?;
        let slot = self.checkout_at(forced_stream_id)?;

        let response_fut = self.dispatch(slot, serialized);
        match request_options.timeout {
            Some(duration) => tokio::time::timeout(duration, response_fut)
                .await
                .map_err(|_| RequestError::RequestTimeout(duration))?,
            None => response_fut.await,
        }
    }

    fn check_statement_compression(
        &self,
        requested: Option<Compression>,
    ) -> Result<(), RequestError> {
        match requested {
            Some(request) if Some(request) != self.compression => {
                Err(RequestError::CompressionMismatch {
                    connection: self.compression,
                    request,
                })
            }
            _ => Ok(()),
        }
    }

    pub async fn query_unpaged(
        &self,
        statement: impl Into<Statement>,
    ) -> Result<QueryResult, RequestError> {
        let statement: Statement = statement.into();
        self.query_raw(&statement, SerializedValues::EMPTY)
            .await?
            .into_query_result()
    }

    pub async fn query_raw(
        &self,
        statement: &Statement,
        values: &SerializedValues,
    ) -> Result<QueryResponse, RequestError> {
        self.check_statement_compression(statement.config.compression)?;

        let query = Query {
            contents: Cow::Borrowed(&statement.contents),
            parameters: QueryParameters {
                consistency: statement
                    .config
                    .determine_consistency(self.config.default_consistency),
                serial_consistency: statement.config.serial_consistency,
                timestamp: statement.config.timestamp,
                page_size: statement.page_size,
                values: Cow::Borrowed(values),
                ..Default::default()
            },
        };

        self.send_request(&query, true, &RequestOptions::from(&statement.config), None)
            .await
    }

    /// Prepares a statement, consulting the prepared cache unless `force` is
    /// set.
    pub async fn prepare(
        &self,
        statement: &Statement,
        force: bool,
    ) -> Result<PreparedStatement, RequestError> {
        if !force {
            if let Some(cache) = &self.config.prepared_cache {
                if let Some(prepared) = cache.lookup(&statement.contents) {
                    debug!(
                        statement = statement.contents.as_str(),
                        "Prepared cache hit"
                    );
                    return Ok(prepared);
                }
                debug!(
                    statement = statement.contents.as_str(),
                    "Prepared cache miss"
                );
            }
        }

        let prepared = self.prepare_uncached(statement).await?;
        if let Some(cache) = &self.config.prepared_cache {
            cache.store(&prepared);
        }
        Ok(prepared)
    }

    async fn prepare_uncached(
        &self,
        statement: &Statement,
    ) -> Result<PreparedStatement, RequestError> {
        let response = self
            .send_request(
                &Prepare {
                    query: &statement.contents,
                },
                true,
                &RequestOptions::from(&statement.config),
                None,
            )
            .await?
            .into_non_error()?;

        match response.response {
            Response::Result(result::Result::Prepared(p)) => Ok(PreparedStatement::new(
                statement.clone(),
                p.id,
                p.result_metadata_id,
                p.prepared_metadata,
                p.result_metadata,
            )),
            other => Err(RequestError::UnexpectedResponse(other.to_response_kind())),
        }
    }

    async fn reprepare(&self, previous: &PreparedStatement) -> Result<(), RequestError> {
        if let Some(cache) = &self.config.prepared_cache {
            cache.evict(&previous.get_statement().contents);
        }
        let reprepared = self.prepare_uncached(previous.get_statement()).await?;

        // A statement id is a digest of its text; a changed id means the
        // server prepared something else than we meant to run.
        if reprepared.get_id() != previous.get_id() {
            return Err(RequestError::RepreparedIdChanged {
                statement: previous.get_statement().contents.clone(),
                expected_id: previous.get_id().to_vec(),
                reprepared_id: reprepared.get_id().to_vec(),
            });
        }
        Ok(())
    }

    pub async fn execute_unpaged(
        &self,
        prepared: &PreparedStatement,
        values: &SerializedValues,
    ) -> Result<QueryResult, RequestError> {
        self.execute_raw(prepared, values, None)
            .await?
            .into_query_result()
    }

    /// Executes a prepared statement. A specific stream id may be forced,
    /// which tests use to pin multiplexing behavior.
    pub async fn execute_raw(
        &self,
        prepared: &PreparedStatement,
        values: &SerializedValues,
        forced_stream_id: Option<i16>,
    ) -> Result<QueryResponse, RequestError> {
        let config = prepared.config();
        self.check_statement_compression(config.compression)?;

        let execute = Execute {
            id: prepared.get_id().clone(),
            result_metadata_id: prepared.get_result_metadata_id().cloned(),
            parameters: QueryParameters {
                consistency: config.determine_consistency(self.config.default_consistency),
                serial_consistency: config.serial_consistency,
                timestamp: config.timestamp,
                page_size: prepared.get_statement().page_size,
                values: Cow::Borrowed(values),
                ..Default::default()
            },
        };

        let response = self
            .send_request(
                &execute,
                true,
                &RequestOptions::from(config),
                forced_stream_id,
            )
            .await?;

        if let Response::Error(rill_cql::frame::response::Error {
            error: DbError::Unprepared { ref statement_id },
            ..
        }) = response.response
        {
            debug!(
                statement_id = ?statement_id,
                "Server reports statement unprepared; repreparing and retrying"
            );
            self.reprepare(prepared).await?;
            return self
                .send_request(&execute, true, &RequestOptions::from(config), None)
                .await;
        }

        Ok(response)
    }

    pub async fn batch(
        &self,
        init_batch: &Batch,
        values: &[SerializedValues],
    ) -> Result<QueryResult, RequestError> {
        let config = &init_batch.config;
        self.check_statement_compression(config.compression)?;

        let batch = self.prepare_batch(init_batch, values).await?;

        loop {
            let statements: Vec<cql_batch::BatchStatement> = batch
                .statements
                .iter()
                .map(|statement| match statement {
                    BatchStatement::Query(q) => cql_batch::BatchStatement::Query {
                        text: Cow::Borrowed(q.contents.as_str()),
                    },
                    BatchStatement::Prepared(p) => cql_batch::BatchStatement::Prepared {
                        id: p.get_id().clone(),
                    },
                })
                .collect();

            let batch_frame = cql_batch::Batch {
                statements: Cow::Owned(statements),
                batch_type: batch.batch_type,
                consistency: config.determine_consistency(self.config.default_consistency),
                serial_consistency: config.serial_consistency,
                timestamp: config.timestamp,
                values: values.to_vec(),
            };

            let response = self
                .send_request(&batch_frame, true, &RequestOptions::from(config), None)
                .await?;

            match response.response {
                Response::Error(rill_cql::frame::response::Error {
                    error: DbError::Unprepared { ref statement_id },
                    ..
                }) => {
                    let unprepared = batch.statements.iter().find_map(|s| match s {
                        BatchStatement::Prepared(p) if p.get_id() == statement_id => Some(p),
                        _ => None,
                    });
                    match unprepared {
                        Some(p) => {
                            debug!(
                                statement_id = ?statement_id,
                                "Batch statement unprepared; repreparing and retrying"
                            );
                            self.reprepare(p).await?;
                            continue;
                        }
                        None => {
                            return Err(RequestError::UnexpectedResponse(
                                "ERROR Unprepared for a statement absent from the batch",
                            ))
                        }
                    }
                }
                _ => return response.into_query_result(),
            }
        }
    }

    /// Prepares the unprepared batch statements that carry values; the server
    /// cannot bind values to plain-text statements inside a batch.
    async fn prepare_batch(
        &self,
        init_batch: &Batch,
        values: &[SerializedValues],
    ) -> Result<Batch, RequestError> {
        let mut to_prepare = HashSet::<&str>::new();
        for (i, statement) in init_batch.statements.iter().enumerate() {
            if let BatchStatement::Query(query) = statement {
                let has_values = values.get(i).map(|v| !v.is_empty()).unwrap_or(false);
                if has_values {
                    to_prepare.insert(query.contents.as_str());
                }
            }
        }

        if to_prepare.is_empty() {
            return Ok(init_batch.clone());
        }

        let mut prepared_queries = HashMap::<String, PreparedStatement>::new();
        for query in &to_prepare {
            let prepared = self.prepare(&Statement::new(query.to_string()), false).await?;
            prepared_queries.insert(query.to_string(), prepared);
        }

        let mut batch = Batch::new(init_batch.batch_type);
        batch.config = init_batch.config.clone();
        for statement in &init_batch.statements {
            match statement {
                BatchStatement::Query(query) => {
                    match prepared_queries.get(query.contents.as_str()) {
                        Some(prepared) => batch.append_statement(prepared.clone()),
                        None => batch.append_statement(query.clone()),
                    }
                }
                BatchStatement::Prepared(prepared) => batch.append_statement(prepared.clone()),
            }
        }
        Ok(batch)
    }

    pub async fn use_keyspace(
        &self,
        keyspace_name: &str,
        case_sensitive: bool,
    ) -> Result<(), RequestError> {
        // The keyspace cannot be a bound value; the statement text carries it.
        let query: Statement = match case_sensitive {
            true => format!("USE \"{}\"", keyspace_name).into(),
            false => format!("USE {}", keyspace_name).into(),
        };

        let response = self
            .query_raw(&query, SerializedValues::EMPTY)
            .await?
            .into_non_error()?;
        match response.response {
            Response::Result(result::Result::SetKeyspace(sk)) => {
                if sk.keyspace_name.eq_ignore_ascii_case(keyspace_name) {
                    Ok(())
                } else {
                    Err(RequestError::KeyspaceNameMismatch {
                        expected: keyspace_name.to_string(),
                        got: sk.keyspace_name,
                    })
                }
            }
            other => Err(RequestError::UnexpectedResponse(other.to_response_kind())),
        }
    }

    pub async fn register(&self, event_types: Vec<EventType>) -> Result<(), RequestError> {
        let register = Register {
            event_types_to_register_for: event_types,
        };

        let response = self
            .send_request(&register, true, &RequestOptions::default(), None)
            .await?
            .into_non_error()?;
        match response.response {
            Response::Ready => Ok(()),
            other => Err(RequestError::UnexpectedResponse(other.to_response_kind())),
        }
    }

    async fn router<S>(
        stream: S,
        submit_receiver: mpsc::Receiver<Task>,
        error_sender: oneshot::Sender<ConnectionError>,
        router_handle: Arc<RouterHandle>,
        router_config: RouterConfig,
    ) where
        S: AsyncRead + AsyncWrite,
    {
        let (read_half, write_half) = split(stream);

        // The handler map is shared with caller contexts through
        // RouterHandle, so a real lock is required here, unlike a map local
        // to the router task. No await point is ever reached while holding
        // it, so contention stays bounded by the short critical sections.
        let r = Self::reader(
            BufReader::with_capacity(8192, read_half),
            &router_handle,
            &router_config,
        );
        let w = Self::writer(
            BufWriter::with_capacity(8192, write_half),
            submit_receiver,
            &router_config,
        );
        let k = Self::keepaliver(&router_handle, &router_config);

        let result = futures::try_join!(r, w, k);

        let error: BrokenConnectionError = match result {
            Ok(_) => return, // Connection was dropped; nothing to drain.
            Err(err) => err,
        };

        // Drain: every in-flight waiter learns about the disconnection and
        // the full stream id range becomes free again.
        let handlers = router_handle.handler_map.lock().unwrap().drain();
        for (_, handler) in handlers {
            // Ignore sending error; the waiter may be long gone.
            let _ = handler.send(Err(error.clone()));
        }

        // If someone is listening for connection errors, notify them.
        let _ = error_sender.send(error.into());
    }

    async fn reader(
        mut read_half: impl AsyncRead + Unpin,
        router_handle: &RouterHandle,
        router_config: &RouterConfig,
    ) -> Result<(), BrokenConnectionError> {
        loop {
            let (params, opcode, body) = if router_config.version.uses_outer_framing() {
                segment::read_response_frame_v5(&mut read_half, router_config.compression).await
            } else {
                frame::read_response_frame(&mut read_half).await
            }
            .map_err(BrokenConnectionErrorKind::FrameError)?;

            let response = TaskResponse {
                params,
                opcode,
                body,
            };

            match params.stream.cmp(&-1) {
                std::cmp::Ordering::Less => {
                    // Negative stream ids are reserved for the server. Only
                    // -1 is in use today; anything else is ignored.
                    continue;
                }
                std::cmp::Ordering::Equal => {
                    Self::handle_event(response, router_config).await?;
                    continue;
                }
                std::cmp::Ordering::Greater => {}
            }

            let handler = router_handle
                .handler_map
                .lock()
                .unwrap()
                .lookup(params.stream);

            match handler {
                Some(handler) => {
                    // A failed send means the waiter stopped caring (caller
                    // timeout or cancellation); the frame is discarded and
                    // the id was already released by the lookup.
                    let _ = handler.send(Ok(response));
                }
                None => {
                    // Unsolicited frame; the in-flight bookkeeping cannot be
                    // trusted anymore.
                    error!(
                        stream_id = params.stream,
                        "Received response with unexpected stream id"
                    );
                    return Err(BrokenConnectionErrorKind::UnexpectedStreamId(params.stream).into());
                }
            }
        }
    }

    async fn writer(
        mut write_half: impl AsyncWrite + Unpin,
        mut submit_receiver: mpsc::Receiver<Task>,
        router_config: &RouterConfig,
    ) -> Result<(), BrokenConnectionError> {
        // When the Connection object is dropped, the sender half of the
        // channel is dropped too; this task then finishes and takes the
        // whole routing worker down with it.
        while let Some(mut task) = submit_receiver.recv().await {
            let mut num_requests = 0;
            let mut total_sent = 0;
            loop {
                let wire_bytes: Cow<[u8]> = if router_config.version.uses_outer_framing() {
                    Cow::Owned(
                        segment::encode_segments(&task.data, router_config.compression)
                            .map_err(BrokenConnectionErrorKind::FrameError)?,
                    )
                } else {
                    Cow::Borrowed(&task.data)
                };
                total_sent += wire_bytes.len();
                num_requests += 1;
                write_half
                    .write_all(&wire_bytes)
                    .await
                    .map_err(BrokenConnectionErrorKind::WriteError)?;

                task = match submit_receiver.try_recv() {
                    Ok(t) => t,
                    Err(_) => {
                        // Coalesce: give queued submitters one scheduling
                        // round to land their requests in this flush.
                        tokio::task::yield_now().await;
                        match submit_receiver.try_recv() {
                            Ok(t) => t,
                            Err(_) => break,
                        }
                    }
                };
            }
            trace!("Sending {} requests; {} bytes", num_requests, total_sent);
            write_half
                .flush()
                .await
                .map_err(BrokenConnectionErrorKind::WriteError)?;
        }

        Ok(())
    }

    async fn keepaliver(
        router_handle: &RouterHandle,
        router_config: &RouterConfig,
    ) -> Result<(), BrokenConnectionError> {
        let Some(keepalive_interval) = router_config.keepalive_interval else {
            // No keepalives are to be sent.
            return Ok(());
        };

        let mut interval = tokio::time::interval(keepalive_interval);
        interval.tick().await; // Use up the first, instant tick.
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            let probe = async {
                let serialized =
                    SerializedRequest::make(&Options, router_config.version, None, false)
                        .map_err(|e| {
                            RequestError::BrokenConnection(
                                BrokenConnectionErrorKind::FrameError(e).into(),
                            )
                        })?;
                let (sender, receiver) = oneshot::channel();
                let stream_id = router_handle.allocate(sender, None)?;
                let mut serialized = serialized;
                serialized.set_stream(stream_id);
                router_handle.submit(serialized.into_data(), stream_id).await?;
                match receiver.await {
                    Ok(res) => res.map(|_| ()).map_err(RequestError::from),
                    Err(_) => Err(RequestError::BrokenConnection(
                        BrokenConnectionErrorKind::ChannelError.into(),
                    )),
                }
            };

            let result = match router_config.keepalive_timeout {
                Some(timeout) => match tokio::time::timeout(timeout, probe).await {
                    Ok(res) => res,
                    Err(_) => {
                        warn!(
                            node = %router_config.address,
                            "Timed out while waiting for response to keepalive request"
                        );
                        return Err(BrokenConnectionErrorKind::KeepaliveTimeout(
                            router_config.address,
                        )
                        .into());
                    }
                },
                None => probe.await,
            };

            if let Err(err) = result {
                warn!(
                    node = %router_config.address,
                    error = %err,
                    "Failed to execute keepalive request"
                );
                return Err(
                    BrokenConnectionErrorKind::KeepaliveRequestError(Arc::new(err)).into(),
                );
            }

            trace!(node = %router_config.address, "Keepalive request successful");
        }
    }

    async fn handle_event(
        task_response: TaskResponse,
        router_config: &RouterConfig,
    ) -> Result<(), BrokenConnectionError> {
        let Some(event_sender) = router_config.event_sender.as_ref() else {
            // Not a control connection; the server should not push events
            // here, but tolerating them is harmless.
            return Ok(());
        };

        let body_with_ext = frame::parse_response_body_extensions(
            task_response.params.flags,
            router_config.envelope_compression(),
            task_response.body,
        )
        .map_err(BrokenConnectionErrorKind::FrameError)?;

        let response = Response::deserialize(
            router_config.version,
            task_response.opcode,
            &mut &*body_with_ext.body,
        )
        .map_err(BrokenConnectionErrorKind::EventHandling)?;

        let event = match response {
            Response::Event(event) => event,
            other => {
                error!(
                    response = other.to_response_kind(),
                    "Expected EVENT response on stream -1"
                );
                return Err(BrokenConnectionErrorKind::UnexpectedEventResponse(
                    other.to_response_kind(),
                )
                .into());
            }
        };

        event_sender
            .send(event)
            .await
            .map_err(|_| BrokenConnectionErrorKind::ChannelError.into())
    }
}

/// Opens a transport to the node and performs the CQL-level setup, retrying
/// with older protocol versions when the server refuses the offered one.
pub async fn open_connection(
    addr: SocketAddr,
    config: &ConnectionConfig,
) -> Result<(Connection, ErrorReceiver), ConnectionError> {
    let mut version = config.protocol_version.unwrap_or(ProtocolVersion::LATEST);

    loop {
        let tcp_stream = connect_tcp(addr, config).await?;

        let attempt = match &config.tls {
            Some(tls) => {
                let server_name = ServerName::IpAddress(addr.ip().into());
                let tls_stream = tls.connector.connect(server_name, tcp_stream).await?;
                setup_connection(tls_stream, addr, config, version).await?
            }
            None => setup_connection(tcp_stream, addr, config, version).await?,
        };

        match attempt {
            SetupAttempt::Done(connection, error_receiver) => {
                debug!(node = %addr, %version, "Connection established");
                return Ok((connection, error_receiver));
            }
            SetupAttempt::Downgrade(hint) => {
                let next = match hint {
                    Some(hinted) if hinted < version => hinted,
                    _ => version
                        .next_lower()
                        .ok_or(ConnectionError::ProtocolNegotiationFailed {
                            last_tried: version,
                        })?,
                };
                debug!(
                    node = %addr,
                    offered = %version,
                    retrying_with = %next,
                    "Server rejected protocol version"
                );
                version = next;
            }
        }
    }
}

enum SetupAttempt {
    Done(Connection, ErrorReceiver),
    /// The server refused the offered protocol version; retry with the
    /// hinted version (when given and lower), or the next version down.
    Downgrade(Option<ProtocolVersion>),
}

async fn connect_tcp(addr: SocketAddr, config: &ConnectionConfig) -> Result<TcpStream, ConnectionError> {
    let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| ConnectionError::ConnectTimeout)??;
    stream.set_nodelay(config.tcp_nodelay)?;

    if let Some(tcp_keepalive_interval) = config.tcp_keepalive_interval {
        setup_tcp_keepalive(&stream, tcp_keepalive_interval)?;
    }

    Ok(stream)
}

fn setup_tcp_keepalive(
    stream: &TcpStream,
    tcp_keepalive_interval: Duration,
) -> std::io::Result<()> {
    // "time" here is the idle period before probing starts; the probe
    // spacing is fixed at one second where the platform lets us set it.
    let mut tcp_keepalive = TcpKeepalive::new().with_time(tcp_keepalive_interval);

    #[cfg(any(
        target_os = "android",
        target_os = "freebsd",
        target_os = "fuchsia",
        target_os = "illumos",
        target_os = "ios",
        target_os = "linux",
        target_os = "macos",
        target_os = "netbsd",
        target_os = "windows",
    ))]
    {
        tcp_keepalive = tcp_keepalive.with_interval(Duration::from_secs(1));
    }

    let sf = SockRef::from(stream);
    sf.set_tcp_keepalive(&tcp_keepalive)
}

/// Runs OPTIONS/SUPPORTED/STARTUP (plus authentication, USE and REGISTER as
/// configured) on the raw stream, then hands it to the routing worker.
async fn setup_connection<S>(
    mut stream: S,
    addr: SocketAddr,
    config: &ConnectionConfig,
    version: ProtocolVersion,
) -> Result<SetupAttempt, ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /* Learn which options the server supports. */
    let response =
        setup_request(&mut stream, &Options, version, false, None, None).await?;
    let supported = match response {
        Response::Supported(supported) => supported,
        Response::Error(err) if err.error == DbError::ProtocolError => {
            return Ok(SetupAttempt::Downgrade(downgrade_hint(&err.reason)));
        }
        Response::Error(err) => {
            return Err(setup_db_error("OPTIONS", err).into());
        }
        other => return Err(unexpected_response("OPTIONS", "SUPPORTED", &other).into()),
    };

    /* The compressor must be spoken by the server; v5 additionally dropped
     * Snappy when compression moved into the outer framing. */
    if let Some(algorithm) = config.compression {
        let algorithms = supported.compression_algorithms();
        let unsupported_by_server = !algorithms.iter().any(|a| a == algorithm.as_str());
        let unsupported_by_framing =
            version.uses_outer_framing() && algorithm != Compression::Lz4;
        if unsupported_by_server || unsupported_by_framing {
            return Err(ConnectionError::UnsupportedCompression {
                algorithm,
                supported: algorithms.to_vec(),
            });
        }
    }

    /* STARTUP with the accepted options. */
    let options = build_startup_options(&supported, config.compression);
    let response = setup_request(
        &mut stream,
        &Startup { options },
        version,
        false,
        None,
        None,
    )
    .await?;

    // From here on a v5 connection wraps everything in outer segments, and a
    // v3/v4 one may receive compressed envelope bodies.
    let framed = version.uses_outer_framing();
    let segment_compression = framed.then_some(config.compression).flatten();
    let envelope_compression = if framed { None } else { config.compression };

    match response {
        Response::Ready => {}
        Response::Authenticate(authenticate) => {
            perform_authentication(
                &mut stream,
                config,
                version,
                framed,
                segment_compression,
                envelope_compression,
                &authenticate.authenticator_name,
            )
            .await?;
        }
        Response::Error(err) if err.error == DbError::ProtocolError => {
            return Ok(SetupAttempt::Downgrade(downgrade_hint(&err.reason)));
        }
        Response::Error(err) => return Err(setup_db_error("STARTUP", err).into()),
        other => {
            return Err(unexpected_response("STARTUP", "READY | AUTHENTICATE", &other).into())
        }
    }

    /* Synchronous USE on stream id 0, before any multiplexed traffic. */
    let mut current_keyspace = None;
    if let Some(keyspace) = &config.keyspace {
        let query = Query {
            contents: Cow::Owned(format!("USE {}", keyspace)),
            parameters: QueryParameters {
                consistency: config.default_consistency,
                ..Default::default()
            },
        };
        let response = setup_request(
            &mut stream,
            &query,
            version,
            framed,
            segment_compression,
            envelope_compression,
        )
        .await?;
        match response {
            Response::Result(result::Result::SetKeyspace(sk)) => {
                if !sk.keyspace_name.eq_ignore_ascii_case(keyspace) {
                    return Err(ConnectionSetupError::KeyspaceNameMismatch {
                        expected: keyspace.clone(),
                        got: sk.keyspace_name,
                    }
                    .into());
                }
                current_keyspace = Some(sk.keyspace_name);
            }
            Response::Error(err) => return Err(setup_db_error("USE", err).into()),
            other => return Err(unexpected_response("USE", "RESULT Set_keyspace", &other).into()),
        }
    }

    /* Control connections REGISTER for cluster events. */
    if config.event_sender.is_some() {
        let register = Register {
            event_types_to_register_for: vec![EventType::TopologyChange, EventType::StatusChange],
        };
        let response = setup_request(
            &mut stream,
            &register,
            version,
            framed,
            segment_compression,
            envelope_compression,
        )
        .await?;
        match response {
            Response::Ready => {}
            Response::Error(err) => return Err(setup_db_error("REGISTER", err).into()),
            other => return Err(unexpected_response("REGISTER", "READY", &other).into()),
        }
    }

    let (connection, error_receiver) = Connection::spawn(
        stream,
        addr,
        config.clone(),
        version,
        config.compression,
        current_keyspace,
    );
    Ok(SetupAttempt::Done(connection, error_receiver))
}

fn build_startup_options<'a>(
    supported: &'a Supported,
    compression: Option<Compression>,
) -> HashMap<Cow<'a, str>, Cow<'a, str>> {
    let mut options: HashMap<Cow<str>, Cow<str>> = HashMap::new();

    let cql_version = supported
        .cql_versions()
        .first()
        .map(|v| Cow::Borrowed(v.as_str()))
        .unwrap_or(Cow::Borrowed(DEFAULT_CQL_VERSION));
    options.insert(Cow::Borrowed(CQL_VERSION), cql_version);

    options.insert(Cow::Borrowed(DRIVER_NAME), Cow::Borrowed(DEFAULT_DRIVER_NAME));
    options.insert(
        Cow::Borrowed(DRIVER_VERSION),
        Cow::Borrowed(DEFAULT_DRIVER_VERSION),
    );

    if let Some(compression) = compression {
        options.insert(Cow::Borrowed(COMPRESSION), Cow::Borrowed(compression.as_str()));
    }

    options
}

#[allow(clippy::too_many_arguments)]
async fn perform_authentication<S>(
    stream: &mut S,
    config: &ConnectionConfig,
    version: ProtocolVersion,
    framed: bool,
    segment_compression: Option<Compression>,
    envelope_compression: Option<Compression>,
    authenticator_name: &str,
) -> Result<(), ConnectionSetupError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Some(authenticator) = config.authenticator.as_ref() else {
        return Err(ConnectionSetupError::MissingAuthentication {
            authenticator: authenticator_name.to_string(),
        });
    };

    let mut token = authenticator
        .initial_token(authenticator_name)
        .await
        .map_err(ConnectionSetupError::Authentication)?;

    loop {
        let response = setup_request(
            stream,
            &AuthResponse { response: token },
            version,
            framed,
            segment_compression,
            envelope_compression,
        )
        .await?;

        match response {
            Response::AuthChallenge(challenge) => {
                token = authenticator
                    .respond_to_challenge(challenge.authenticate_message.as_deref())
                    .await
                    .map_err(ConnectionSetupError::Authentication)?;
            }
            Response::AuthSuccess(success) => {
                authenticator
                    .verify_success(success.success_message.as_deref())
                    .await
                    .map_err(ConnectionSetupError::Authentication)?;
                return Ok(());
            }
            Response::Error(err) => return Err(setup_db_error("AUTH_RESPONSE", err)),
            other => {
                return Err(unexpected_response(
                    "AUTH_RESPONSE",
                    "AUTH_CHALLENGE | AUTH_SUCCESS",
                    &other,
                ))
            }
        }
    }
}

/// Sends one setup request on stream id 0 and reads its response off the
/// stream. Pre-router requests are strictly sequential, so reading inline is
/// safe; server events cannot arrive yet because REGISTER is itself one of
/// these requests.
async fn setup_request<S>(
    stream: &mut S,
    request: &impl SerializableRequest,
    version: ProtocolVersion,
    framed: bool,
    segment_compression: Option<Compression>,
    envelope_compression: Option<Compression>,
) -> Result<Response, ConnectionSetupError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let serialized = SerializedRequest::make(request, version, envelope_compression, false)?;

    if framed {
        let framed_bytes = segment::encode_segments(serialized.get_data(), segment_compression)?;
        stream.write_all(&framed_bytes).await.map_err(setup_io_error)?;
    } else {
        stream
            .write_all(serialized.get_data())
            .await
            .map_err(setup_io_error)?;
    }
    stream.flush().await.map_err(setup_io_error)?;

    let (params, opcode, body) = if framed {
        segment::read_response_frame_v5(stream, segment_compression).await?
    } else {
        frame::read_response_frame(stream).await?
    };

    let body_with_ext =
        frame::parse_response_body_extensions(params.flags, envelope_compression, body)?;
    let response = Response::deserialize(version, opcode, &mut &*body_with_ext.body)?;
    Ok(response)
}

fn setup_io_error(err: std::io::Error) -> ConnectionSetupError {
    ConnectionSetupError::Frame(err.into())
}

fn setup_db_error(request: &'static str, err: rill_cql::frame::response::Error) -> ConnectionSetupError {
    ConnectionSetupError::DbError {
        request,
        error: err.error,
        reason: err.reason,
    }
}

fn unexpected_response(
    request: &'static str,
    expected: &'static str,
    got: &Response,
) -> ConnectionSetupError {
    ConnectionSetupError::UnexpectedResponse {
        request,
        expected,
        got: got.to_response_kind(),
    }
}

/// Bookkeeping of in-flight requests: the free stream id set and the map
/// from occupied ids to their reply channels. The two always partition the
/// full id range.
struct ResponseHandlerMap {
    stream_set: StreamIdSet,
    handlers: HashMap<i16, ResponseHandler>,
}

impl ResponseHandlerMap {
    fn new() -> Self {
        Self {
            stream_set: StreamIdSet::new(),
            handlers: HashMap::new(),
        }
    }

    fn allocate(
        &mut self,
        handler: ResponseHandler,
        forced_stream_id: Option<i16>,
    ) -> Result<i16, ResponseHandler> {
        let stream_id = match forced_stream_id {
            Some(id) => {
                if self.stream_set.allocate_exact(id) {
                    Some(id)
                } else {
                    None
                }
            }
            None => self.stream_set.allocate(),
        };

        match stream_id {
            Some(stream_id) => {
                let prev_handler = self.handlers.insert(stream_id, handler);
                assert!(prev_handler.is_none());
                Ok(stream_id)
            }
            None => Err(handler),
        }
    }

    /// Releases the stream id and takes its handler out, if any.
    fn lookup(&mut self, stream_id: i16) -> Option<ResponseHandler> {
        self.stream_set.free(stream_id);
        self.handlers.remove(&stream_id)
    }

    /// Empties the in-flight map and restores the full free id set. Used on
    /// the transition into the disconnected state.
    fn drain(&mut self) -> HashMap<i16, ResponseHandler> {
        self.stream_set = StreamIdSet::new();
        std::mem::take(&mut self.handlers)
    }

    fn free_ids_count(&self) -> usize {
        STREAM_ID_COUNT - self.handlers.len()
    }
}

/// The set of free stream ids, kept as a bitmap of 32,768 slots.
struct StreamIdSet {
    used_bitmap: Box<[u64]>,
}

impl StreamIdSet {
    fn new() -> Self {
        const BITMAP_SIZE: usize = STREAM_ID_COUNT / 64;
        Self {
            used_bitmap: vec![0; BITMAP_SIZE].into_boxed_slice(),
        }
    }

    fn allocate(&mut self) -> Option<i16> {
        for (block_id, block) in self.used_bitmap.iter_mut().enumerate() {
            if *block != !0 {
                let off = block.trailing_ones();
                *block |= 1u64 << off;
                let stream_id = off as i16 + block_id as i16 * 64;
                return Some(stream_id);
            }
        }
        None
    }

    /// Claims a specific id; `false` if it is already in use or out of range.
    fn allocate_exact(&mut self, stream_id: i16) -> bool {
        if stream_id < 0 {
            return false;
        }
        let block_id = stream_id as usize / 64;
        let off = stream_id as usize % 64;
        if self.used_bitmap[block_id] & (1 << off) != 0 {
            return false;
        }
        self.used_bitmap[block_id] |= 1 << off;
        true
    }

    fn free(&mut self, stream_id: i16) {
        let block_id = stream_id as usize / 64;
        let off = stream_id as usize % 64;
        self.used_bitmap[block_id] &= !(1 << off);
    }

    #[cfg(test)]
    fn used_count(&self) -> usize {
        self.used_bitmap
            .iter()
            .map(|block| block.count_ones() as usize)
            .sum()
    }
}
