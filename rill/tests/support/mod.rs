#![allow(dead_code)] // Each test binary uses its own subset of the helpers.

//! A minimal in-process node for driver tests.
//!
//! Speaks just enough of the native protocol to carry a handshake, answer
//! queries with canned results, push server events, and misbehave on demand
//! (protocol-version refusal, swallowed or delayed responses, wrong stream
//! ids, sudden disconnects).

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use rill_cql::frame::segment;
use rill_cql::frame::types;
use rill_cql::frame::Compression;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

static TRACING_INIT: Once = Once::new();

/// Enables tracing output in tests, honoring RUST_LOG.
pub fn setup_tracing() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

// Request opcodes the mock understands.
const OP_STARTUP: u8 = 0x01;
const OP_OPTIONS: u8 = 0x05;
const OP_QUERY: u8 = 0x07;
const OP_PREPARE: u8 = 0x09;
const OP_EXECUTE: u8 = 0x0A;
const OP_REGISTER: u8 = 0x0B;
const OP_BATCH: u8 = 0x0D;
const OP_AUTH_RESPONSE: u8 = 0x0F;

// Response opcodes.
const OP_ERROR: u8 = 0x00;
const OP_READY: u8 = 0x02;
const OP_AUTHENTICATE: u8 = 0x03;
const OP_SUPPORTED: u8 = 0x06;
const OP_RESULT: u8 = 0x08;
const OP_EVENT: u8 = 0x0C;
const OP_AUTH_CHALLENGE: u8 = 0x0E;
const OP_AUTH_SUCCESS: u8 = 0x10;

/// The prepared-statement id every PREPARE is answered with.
pub const MOCK_PREPARED_ID: [u8; 4] = [0xCA, 0xFE, 0xBA, 0xBE];

#[derive(Clone, Debug)]
pub enum MockEvent {
    StatusUp(SocketAddr),
    StatusDown(SocketAddr),
}

/// Makes the mock demand authentication during STARTUP.
#[derive(Clone, Debug)]
pub struct MockAuth {
    /// Authenticator class announced in the AUTHENTICATE response.
    pub authenticator_name: String,
    /// Challenges issued (in order) before the exchange is accepted.
    pub challenges: Vec<Vec<u8>>,
}

/// Knobs of the mock node. Shared mutable fields let tests change behavior
/// while connections are live.
#[derive(Clone, Default)]
pub struct NodeBehavior {
    /// Protocol versions (request bytes) refused with a downgrade hint.
    pub reject_protocol_versions: Vec<u8>,
    /// Highest version named in the refusal message.
    pub downgrade_hint: Option<u8>,
    /// Never answer QUERY/EXECUTE/BATCH requests.
    pub swallow_queries: bool,
    /// Drop the socket right after this many QUERY envelopes were read.
    pub close_after_queries: Option<usize>,
    /// Answer queries on a stream id the client never used.
    pub respond_on_wrong_stream: bool,
    /// Sleep before answering each query.
    pub delay_queries: Option<Duration>,
    /// Drop the socket this long after a completed handshake.
    pub die_after_handshake: Option<Duration>,
    /// Push these events right after answering REGISTER.
    pub events_after_register: Vec<MockEvent>,
    /// Size of the single blob cell returned for queries mentioning "blob".
    pub blob_size: usize,
    /// Peer addresses reported in system.peers.
    pub peers: Arc<Mutex<Vec<IpAddr>>>,
    /// Demand authentication, driving the given challenge sequence.
    pub authenticate: Option<MockAuth>,
    /// Never answer keepalive probes (OPTIONS after the handshake).
    pub swallow_keepalives: bool,
    /// Answer the first EXECUTE/BATCH with an Unprepared error, then behave.
    pub unprepared_once: bool,
}

pub struct MockNode {
    pub address: SocketAddr,
    pub queries_served: Arc<AtomicUsize>,
    pub prepares_served: Arc<AtomicUsize>,
    pub keepalives_served: Arc<AtomicUsize>,
    /// Tokens received in AUTH_RESPONSE requests, in arrival order.
    pub auth_tokens: Arc<Mutex<Vec<Option<Vec<u8>>>>>,
}

#[derive(Clone)]
struct ServeContext {
    behavior: NodeBehavior,
    queries_served: Arc<AtomicUsize>,
    prepares_served: Arc<AtomicUsize>,
    keepalives_served: Arc<AtomicUsize>,
    auth_tokens: Arc<Mutex<Vec<Option<Vec<u8>>>>>,
}

pub async fn spawn_node(behavior: NodeBehavior) -> MockNode {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();

    let ctx = ServeContext {
        behavior,
        queries_served: Arc::new(AtomicUsize::new(0)),
        prepares_served: Arc::new(AtomicUsize::new(0)),
        keepalives_served: Arc::new(AtomicUsize::new(0)),
        auth_tokens: Arc::new(Mutex::new(Vec::new())),
    };

    let node = MockNode {
        address,
        queries_served: ctx.queries_served.clone(),
        prepares_served: ctx.prepares_served.clone(),
        keepalives_served: ctx.keepalives_served.clone(),
        auth_tokens: ctx.auth_tokens.clone(),
    };

    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(serve(socket, ctx.clone()));
        }
    });

    node
}

struct ClientEnvelope {
    version: u8,
    stream: i16,
    opcode: u8,
    body: Vec<u8>,
}

async fn read_plain_envelope(socket: &mut TcpStream) -> std::io::Result<ClientEnvelope> {
    let mut header = [0u8; 9];
    socket.read_exact(&mut header).await?;
    let body_len = u32::from_be_bytes(header[5..9].try_into().unwrap()) as usize;
    let mut body = vec![0u8; body_len];
    socket.read_exact(&mut body).await?;
    Ok(ClientEnvelope {
        version: header[0],
        stream: i16::from_be_bytes([header[2], header[3]]),
        opcode: header[4],
        body,
    })
}

async fn read_framed_envelope(
    socket: &mut TcpStream,
    compression: Option<Compression>,
) -> std::io::Result<ClientEnvelope> {
    let inner = segment::read_segments(socket, compression)
        .await
        .map_err(std::io::Error::other)?;
    let body_len = u32::from_be_bytes(inner[5..9].try_into().unwrap()) as usize;
    Ok(ClientEnvelope {
        version: inner[0],
        stream: i16::from_be_bytes([inner[2], inner[3]]),
        opcode: inner[4],
        body: inner[9..9 + body_len].to_vec(),
    })
}

fn response_envelope(version: u8, stream: i16, opcode: u8, body: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(9 + body.len());
    data.push(version | 0x80);
    data.push(0); // flags
    data.extend_from_slice(&stream.to_be_bytes());
    data.push(opcode);
    data.extend_from_slice(&(body.len() as u32).to_be_bytes());
    data.extend_from_slice(body);
    data
}

async fn respond(
    socket: &mut TcpStream,
    framed: bool,
    compression: Option<Compression>,
    version: u8,
    stream: i16,
    opcode: u8,
    body: &[u8],
) -> std::io::Result<()> {
    let envelope = response_envelope(version, stream, opcode, body);
    if framed {
        let framed_bytes =
            segment::encode_segments(&envelope, compression).map_err(std::io::Error::other)?;
        socket.write_all(&framed_bytes).await?;
    } else {
        socket.write_all(&envelope).await?;
    }
    socket.flush().await
}

fn supported_body() -> Vec<u8> {
    let mut body = Vec::new();
    let mut options = std::collections::HashMap::new();
    options.insert("CQL_VERSION".to_string(), vec!["3.0.0".to_string()]);
    options.insert(
        "COMPRESSION".to_string(),
        vec!["lz4".to_string(), "snappy".to_string()],
    );
    types::write_string_multimap(&options, &mut body).unwrap();
    body
}

fn protocol_error_body(offered: u8, highest: u8) -> Vec<u8> {
    let mut body = Vec::new();
    types::write_int(0x000A, &mut body);
    let reason = format!(
        "Invalid or unsupported protocol version ({}); the lowest supported version is 3 and the highest is {}",
        offered, highest
    );
    types::write_string(&reason, &mut body).unwrap();
    body
}

fn set_keyspace_body(keyspace: &str) -> Vec<u8> {
    let mut body = Vec::new();
    types::write_int(0x0003, &mut body);
    types::write_string(keyspace, &mut body).unwrap();
    body
}

fn void_body() -> Vec<u8> {
    let mut body = Vec::new();
    types::write_int(0x0001, &mut body);
    body
}

fn authenticate_body(authenticator_name: &str) -> Vec<u8> {
    let mut body = Vec::new();
    types::write_string(authenticator_name, &mut body).unwrap();
    body
}

fn auth_challenge_body(challenge: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    types::write_bytes(challenge, &mut body).unwrap();
    body
}

fn auth_success_body() -> Vec<u8> {
    let mut body = Vec::new();
    types::write_bytes_opt(None::<&[u8]>, &mut body).unwrap();
    body
}

fn unprepared_error_body() -> Vec<u8> {
    let mut body = Vec::new();
    types::write_int(0x2500, &mut body);
    types::write_string("Prepared query with ID cafebabe not found", &mut body).unwrap();
    types::write_short_bytes(&MOCK_PREPARED_ID, &mut body).unwrap();
    body
}

fn event_body(event: &MockEvent) -> Vec<u8> {
    let mut body = Vec::new();
    types::write_string("STATUS_CHANGE", &mut body).unwrap();
    match event {
        MockEvent::StatusUp(addr) => {
            types::write_string("UP", &mut body).unwrap();
            types::write_inet(*addr, &mut body);
        }
        MockEvent::StatusDown(addr) => {
            types::write_string("DOWN", &mut body).unwrap();
            types::write_inet(*addr, &mut body);
        }
    }
    body
}

/// Builds a Rows body: every column gets a global table spec and the given
/// type id; cells are raw.
fn rows_body(cols: &[(&str, Vec<u16>)], rows: &[Vec<Option<Vec<u8>>>]) -> Vec<u8> {
    let mut body = Vec::new();
    types::write_int(0x0002, &mut body);
    types::write_int(0x0001, &mut body); // global tables spec
    types::write_int(cols.len() as i32, &mut body);
    types::write_string("system", &mut body).unwrap();
    types::write_string("mock", &mut body).unwrap();
    for (name, type_ids) in cols {
        types::write_string(name, &mut body).unwrap();
        for type_id in type_ids {
            types::write_short(*type_id, &mut body);
        }
    }
    types::write_int(rows.len() as i32, &mut body);
    for row in rows {
        for cell in row {
            types::write_bytes_opt(cell.as_deref(), &mut body).unwrap();
        }
    }
    body
}

fn text_set_cell(elements: &[&str]) -> Vec<u8> {
    let mut cell = Vec::new();
    types::write_int(elements.len() as i32, &mut cell);
    for element in elements {
        types::write_int(element.len() as i32, &mut cell);
        cell.extend_from_slice(element.as_bytes());
    }
    cell
}

fn host_row(address: IpAddr) -> Vec<Option<Vec<u8>>> {
    let addr_cell = match address {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    };
    vec![
        Some(addr_cell),
        Some(b"dc1".to_vec()),
        Some(b"r1".to_vec()),
        Some(text_set_cell(&["-3074457345618258603"])),
    ]
}

fn topology_body(addresses: &[IpAddr]) -> Vec<u8> {
    let rows: Vec<_> = addresses.iter().copied().map(host_row).collect();
    rows_body(
        &[
            ("address", vec![0x0010]),
            ("data_center", vec![0x000D]),
            ("rack", vec![0x000D]),
            ("tokens", vec![0x0022, 0x000D]),
        ],
        &rows,
    )
}

fn blob_rows_body(size: usize) -> Vec<u8> {
    let cell: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    rows_body(&[("payload", vec![0x0003])], &[vec![Some(cell)]])
}

pub fn blob_pattern(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

fn prepared_body(version: u8) -> Vec<u8> {
    let mut body = Vec::new();
    types::write_int(0x0004, &mut body);
    types::write_short_bytes(&MOCK_PREPARED_ID, &mut body).unwrap();
    if version == 5 {
        types::write_short_bytes(&[0x01], &mut body).unwrap();
    }
    // prepared metadata: flags, col count, pk count
    types::write_int(0, &mut body);
    types::write_int(0, &mut body);
    types::write_int(0, &mut body);
    // result metadata: flags, col count
    types::write_int(0, &mut body);
    types::write_int(0, &mut body);
    body
}

async fn serve(mut socket: TcpStream, ctx: ServeContext) {
    let behavior = ctx.behavior.clone();
    let mut version = 4u8;
    let mut framed = false;
    let mut compression: Option<Compression> = None;
    let mut queries_seen = 0usize;
    let mut die_at: Option<tokio::time::Instant> = None;
    let mut handshake_done = false;
    let mut unprepared_sent = false;
    let mut pending_challenges: std::collections::VecDeque<Vec<u8>> = behavior
        .authenticate
        .as_ref()
        .map(|auth| auth.challenges.clone().into())
        .unwrap_or_default();

    loop {
        let envelope = {
            let read = async {
                if framed {
                    read_framed_envelope(&mut socket, compression).await
                } else {
                    read_plain_envelope(&mut socket).await
                }
            };
            match die_at {
                Some(deadline) => {
                    tokio::select! {
                        env = read => env,
                        _ = tokio::time::sleep_until(deadline) => return,
                    }
                }
                None => read.await,
            }
        };
        let Ok(envelope) = envelope else { return };

        match envelope.opcode {
            OP_OPTIONS if handshake_done => {
                // Past the handshake, OPTIONS is the driver's keepalive probe.
                ctx.keepalives_served.fetch_add(1, Ordering::SeqCst);
                if behavior.swallow_keepalives {
                    continue;
                }
                let _ = respond(
                    &mut socket,
                    framed,
                    compression,
                    version,
                    envelope.stream,
                    OP_SUPPORTED,
                    &supported_body(),
                )
                .await;
            }
            OP_OPTIONS => {
                if behavior.reject_protocol_versions.contains(&envelope.version) {
                    let body =
                        protocol_error_body(envelope.version, behavior.downgrade_hint.unwrap_or(4));
                    let _ = respond(
                        &mut socket,
                        framed,
                        compression,
                        envelope.version,
                        envelope.stream,
                        OP_ERROR,
                        &body,
                    )
                    .await;
                    continue;
                }
                version = envelope.version;
                let _ = respond(
                    &mut socket,
                    framed,
                    compression,
                    version,
                    envelope.stream,
                    OP_SUPPORTED,
                    &supported_body(),
                )
                .await;
            }
            OP_STARTUP => {
                let chosen = types::read_string_map(&mut &envelope.body[..]).unwrap_or_default();
                // The STARTUP response itself goes out plain; framing (and
                // therefore the whole AUTH exchange) starts right after it.
                let (opcode, body) = match &behavior.authenticate {
                    Some(auth) => (
                        OP_AUTHENTICATE,
                        authenticate_body(&auth.authenticator_name),
                    ),
                    None => (OP_READY, Vec::new()),
                };
                let _ = respond(
                    &mut socket,
                    false,
                    None,
                    version,
                    envelope.stream,
                    opcode,
                    &body,
                )
                .await;
                handshake_done = true;
                if version == 5 {
                    framed = true;
                    compression = match chosen.get("COMPRESSION").map(String::as_str) {
                        Some("lz4") => Some(Compression::Lz4),
                        _ => None,
                    };
                }
                if let Some(delay) = behavior.die_after_handshake {
                    die_at = Some(tokio::time::Instant::now() + delay);
                }
            }
            OP_AUTH_RESPONSE => {
                let token = types::read_bytes_opt(&mut &envelope.body[..])
                    .unwrap_or(None)
                    .map(<[u8]>::to_vec);
                ctx.auth_tokens.lock().unwrap().push(token);

                let (opcode, body) = match pending_challenges.pop_front() {
                    Some(challenge) => (OP_AUTH_CHALLENGE, auth_challenge_body(&challenge)),
                    None => (OP_AUTH_SUCCESS, auth_success_body()),
                };
                let _ = respond(
                    &mut socket,
                    framed,
                    compression,
                    version,
                    envelope.stream,
                    opcode,
                    &body,
                )
                .await;
            }
            OP_REGISTER => {
                let _ = respond(
                    &mut socket,
                    framed,
                    compression,
                    version,
                    envelope.stream,
                    OP_READY,
                    &[],
                )
                .await;
                for event in &behavior.events_after_register {
                    let _ = respond(
                        &mut socket,
                        framed,
                        compression,
                        version,
                        -1,
                        OP_EVENT,
                        &event_body(event),
                    )
                    .await;
                }
            }
            OP_PREPARE => {
                ctx.prepares_served.fetch_add(1, Ordering::SeqCst);
                let _ = respond(
                    &mut socket,
                    framed,
                    compression,
                    version,
                    envelope.stream,
                    OP_RESULT,
                    &prepared_body(version),
                )
                .await;
            }
            OP_QUERY | OP_EXECUTE | OP_BATCH => {
                queries_seen += 1;
                if let Some(limit) = behavior.close_after_queries {
                    if queries_seen >= limit {
                        return;
                    }
                }
                if behavior.swallow_queries {
                    continue;
                }
                if let Some(delay) = behavior.delay_queries {
                    tokio::time::sleep(delay).await;
                }

                if behavior.unprepared_once
                    && !unprepared_sent
                    && matches!(envelope.opcode, OP_EXECUTE | OP_BATCH)
                {
                    unprepared_sent = true;
                    let _ = respond(
                        &mut socket,
                        framed,
                        compression,
                        version,
                        envelope.stream,
                        OP_ERROR,
                        &unprepared_error_body(),
                    )
                    .await;
                    continue;
                }

                let body = if envelope.opcode == OP_QUERY {
                    let text = types::read_long_string(&mut &envelope.body[..])
                        .unwrap_or_default()
                        .to_string();
                    if let Some(keyspace) = text.strip_prefix("USE ") {
                        set_keyspace_body(keyspace.trim_matches('"'))
                    } else if text.contains("system.local") || text.contains("system.peers") {
                        let addresses: Vec<IpAddr> = if text.contains("system.local") {
                            vec![IpAddr::from([0u8, 0, 0, 0])]
                        } else {
                            behavior.peers.lock().unwrap().clone()
                        };
                        topology_body(&addresses)
                    } else if text.contains("blob") {
                        blob_rows_body(behavior.blob_size)
                    } else {
                        void_body()
                    }
                } else {
                    void_body()
                };

                let stream = if behavior.respond_on_wrong_stream {
                    envelope.stream.wrapping_add(1000)
                } else {
                    envelope.stream
                };
                ctx.queries_served.fetch_add(1, Ordering::SeqCst);
                let _ = respond(
                    &mut socket,
                    framed,
                    compression,
                    version,
                    stream,
                    OP_RESULT,
                    &body,
                )
                .await;
            }
            _ => {
                let _ = respond(
                    &mut socket,
                    framed,
                    compression,
                    version,
                    envelope.stream,
                    OP_READY,
                    &[],
                )
                .await;
            }
        }
    }
}
