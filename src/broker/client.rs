//! Client Connections
//!
//! One task per client socket. The read half runs in the connection task and
//! applies operations to the registry and dispatcher; a writer task drains
//! the client's outbound queue. Anything that wants to reach the client goes
//! through its [`ClientHandle`], which never blocks: a client that lets more
//! than `max_pending_bytes` pile up is disconnected as a slow consumer.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::dispatch::Source;
use super::Server;
use crate::protocol::client::{encode_err, encode_info, ClientDecoder, ClientOp, OK, PONG};
use crate::protocol::{ConnId, ProtocolError};
use crate::subject::validate_subject;

/// Initial read buffer capacity
const READ_BUF_SIZE: usize = 16 * 1024;

/// Flush threshold for the writer
const WRITE_BUF_SIZE: usize = 64 * 1024;

/// A single socket write that takes longer marks the client slow
const WRITE_DEADLINE: Duration = Duration::from_secs(10);

/// Client connection errors
#[derive(Debug)]
pub enum ClientError {
    Io(io::Error),
    /// Client sent something the decoder refused
    Protocol(ProtocolError),
    /// Outbound queue exceeded its limit
    SlowConsumer,
    /// Refused at accept time
    MaxConnections,
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Io(e) => write!(f, "IO error: {}", e),
            ClientError::Protocol(e) => write!(f, "Protocol error: {}", e),
            ClientError::SlowConsumer => write!(f, "Slow consumer"),
            ClientError::MaxConnections => write!(f, "Maximum connections exceeded"),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClientError::Io(e) => Some(e),
            ClientError::Protocol(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ClientError {
    fn from(e: io::Error) -> Self {
        ClientError::Io(e)
    }
}

impl From<ProtocolError> for ClientError {
    fn from(e: ProtocolError) -> Self {
        ClientError::Protocol(e)
    }
}

/// Handle to a connected client
#[derive(Debug)]
pub struct ClientHandle {
    id: ConnId,
    addr: SocketAddr,
    name: RwLock<Option<String>>,
    connected_at: SystemTime,
    tx: mpsc::UnboundedSender<Bytes>,
    pending_bytes: AtomicUsize,
    /// 0 = unbounded
    max_pending: usize,
    slow: AtomicBool,
    close: CancellationToken,
    msgs_out: AtomicU64,
    msgs_in: AtomicU64,
}

impl ClientHandle {
    pub fn new(
        id: ConnId,
        addr: SocketAddr,
        max_pending: usize,
        close: CancellationToken,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Arc::new(Self {
            id,
            addr,
            name: RwLock::new(None),
            connected_at: SystemTime::now(),
            tx,
            pending_bytes: AtomicUsize::new(0),
            max_pending,
            slow: AtomicBool::new(false),
            close,
            msgs_out: AtomicU64::new(0),
            msgs_in: AtomicU64::new(0),
        });
        (handle, rx)
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn name(&self) -> Option<String> {
        self.name.read().clone()
    }

    fn set_name(&self, name: String) {
        *self.name.write() = Some(name);
    }

    /// Queue bytes for the client; never blocks.
    ///
    /// Returns false if the client is closing or just went over its pending
    /// limit, in which case it is marked slow and closed.
    pub fn send(&self, data: Bytes) -> bool {
        if self.close.is_cancelled() {
            return false;
        }
        let len = data.len();
        let pending = self.pending_bytes.fetch_add(len, Ordering::AcqRel) + len;
        if self.max_pending > 0 && pending > self.max_pending {
            self.pending_bytes.fetch_sub(len, Ordering::AcqRel);
            self.mark_slow();
            return false;
        }
        if self.tx.send(data).is_err() {
            self.pending_bytes.fetch_sub(len, Ordering::AcqRel);
            return false;
        }
        self.msgs_out.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn send_err(&self, message: &str) {
        let mut buf = BytesMut::new();
        encode_err(&mut buf, message);
        self.send(buf.freeze());
    }

    fn mark_slow(&self) {
        if !self.slow.swap(true, Ordering::AcqRel) {
            warn!("Client[{}]: slow consumer, closing", self.id);
        }
        self.close.cancel();
    }

    pub fn is_slow(&self) -> bool {
        self.slow.load(Ordering::Acquire)
    }

    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes.load(Ordering::Acquire)
    }

    /// Ask the connection to close; queued bytes are still flushed
    pub fn close(&self) {
        self.close.cancel();
    }

    pub fn close_token(&self) -> &CancellationToken {
        &self.close
    }

    pub fn info(&self, subscriptions: usize) -> ClientInfo {
        ClientInfo {
            cid: self.id,
            addr: self.addr,
            name: self.name(),
            connected_at: self.connected_at,
            pending_bytes: self.pending_bytes(),
            subscriptions,
            msgs_in: self.msgs_in.load(Ordering::Relaxed),
            msgs_out: self.msgs_out.load(Ordering::Relaxed),
        }
    }
}

/// Introspection view of a client
#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub cid: ConnId,
    pub addr: SocketAddr,
    pub name: Option<String>,
    pub connected_at: SystemTime,
    pub pending_bytes: usize,
    pub subscriptions: usize,
    pub msgs_in: u64,
    pub msgs_out: u64,
}

/// Connected clients by id
#[derive(Debug, Default)]
pub struct ClientTable {
    clients: DashMap<ConnId, Arc<ClientHandle>>,
}

impl ClientTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, handle: Arc<ClientHandle>) {
        self.clients.insert(handle.id(), handle);
    }

    pub fn remove(&self, id: ConnId) -> Option<Arc<ClientHandle>> {
        self.clients.remove(&id).map(|(_, handle)| handle)
    }

    pub fn get(&self, id: ConnId) -> Option<Arc<ClientHandle>> {
        self.clients.get(&id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Client ids in ascending order
    pub fn ids(&self) -> Vec<ConnId> {
        let mut ids: Vec<ConnId> = self.clients.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Handles ordered by id
    pub fn snapshot(&self) -> Vec<Arc<ClientHandle>> {
        let mut handles: Vec<Arc<ClientHandle>> =
            self.clients.iter().map(|entry| entry.value().clone()).collect();
        handles.sort_by_key(|h| h.id());
        handles
    }

    pub fn close_all(&self) {
        for entry in self.clients.iter() {
            entry.value().close();
        }
    }
}

/// Per-connection options set by `CONNECT`
struct SessionOptions {
    verbose: bool,
    echo: bool,
}

/// Run a client connection until it closes
pub(crate) async fn run_client(
    server: Arc<Server>,
    stream: TcpStream,
    addr: SocketAddr,
) -> Result<(), ClientError> {
    let _ = stream.set_nodelay(true);
    let limits = server.limits();
    let (mut reader, mut writer) = stream.into_split();

    if server.clients().len() >= limits.max_connections {
        let mut buf = BytesMut::new();
        encode_err(&mut buf, "maximum connections exceeded");
        let _ = writer.write_all(&buf).await;
        let _ = writer.shutdown().await;
        server.metrics().connection_rejected("max_connections");
        return Err(ClientError::MaxConnections);
    }

    let cid = server.ids().next_id();
    let close = server.shutdown_token().child_token();
    let (handle, rx) = ClientHandle::new(cid, addr, limits.max_pending_bytes, close);

    let mut info = BytesMut::new();
    encode_info(&mut info, &server.server_info(cid));
    handle.send(info.freeze());

    server.clients().insert(handle.clone());
    server.metrics().client_connected();
    debug!("Client[{}]: connected from {}", cid, addr);

    let writer_handle = handle.clone();
    tokio::spawn(async move {
        if let Err(e) = write_loop(rx, writer, &writer_handle).await {
            debug!("Client[{}]: write failed: {}", writer_handle.id(), e);
            writer_handle.close();
        }
    });

    let mut options = SessionOptions {
        verbose: server.default_verbose(),
        echo: true,
    };
    let result = read_loop(&server, &handle, &mut reader, &mut options, limits.max_payload).await;

    server.clients().remove(cid);
    server.registry().remove_owner(cid);
    handle.close();
    server.metrics().client_disconnected();

    match result {
        Ok(()) => debug!("Client[{}]: disconnected", cid),
        Err(ClientError::SlowConsumer) => {
            server.metrics().slow_consumer();
            info!("Client[{}]: disconnected as slow consumer", cid);
        }
        Err(ref e) => debug!("Client[{}]: closed: {}", cid, e),
    }
    result
}

/// Map a decode failure to the `-ERR` text sent before closing
fn protocol_error_message(e: &ProtocolError) -> &'static str {
    match e {
        ProtocolError::PayloadTooLarge { .. } => "Maximum Payload Violation",
        ProtocolError::ControlLineTooLong => "Maximum Control Line Exceeded",
        ProtocolError::UnknownOperation(_) => "Unknown Protocol Operation",
        _ => "Protocol Error",
    }
}

async fn read_loop(
    server: &Server,
    handle: &ClientHandle,
    reader: &mut OwnedReadHalf,
    options: &mut SessionOptions,
    max_payload: usize,
) -> Result<(), ClientError> {
    let close = handle.close_token().clone();
    let mut decoder = ClientDecoder::new(max_payload);
    let mut buf = BytesMut::with_capacity(READ_BUF_SIZE);

    loop {
        loop {
            match decoder.decode(&mut buf) {
                Ok(Some(op)) => process_op(server, handle, options, op),
                Ok(None) => break,
                Err(e) => {
                    debug!("Client[{}]: {}", handle.id(), e);
                    handle.send_err(protocol_error_message(&e));
                    return Err(ClientError::Protocol(e));
                }
            }
        }

        tokio::select! {
            _ = close.cancelled() => {
                return if handle.is_slow() {
                    Err(ClientError::SlowConsumer)
                } else {
                    Ok(())
                };
            }
            result = reader.read_buf(&mut buf) => {
                if result? == 0 {
                    return Ok(());
                }
            }
        }
    }
}

fn process_op(server: &Server, handle: &ClientHandle, options: &mut SessionOptions, op: ClientOp) {
    let cid = handle.id();
    match op {
        ClientOp::Connect(connect) => {
            options.verbose = connect.verbose;
            options.echo = connect.echo;
            if let Some(name) = connect.name {
                handle.set_name(name);
            }
            ack(handle, options);
        }
        ClientOp::Ping => {
            handle.send(Bytes::from_static(PONG));
        }
        ClientOp::Pong => {}
        ClientOp::Sub {
            subject,
            queue,
            sid,
        } => match server.on_local_subscribe(cid, &subject, queue.as_deref(), &sid) {
            Ok(()) => ack(handle, options),
            Err(e) => {
                debug!("Client[{}]: SUB refused: {}", cid, e);
                handle.send_err("Invalid Subject");
            }
        },
        ClientOp::Unsub { sid } => {
            server.on_local_unsubscribe(cid, &sid);
            ack(handle, options);
        }
        ClientOp::Pub {
            subject,
            reply,
            payload,
        } => {
            if validate_subject(&subject).is_err() {
                handle.send_err("Invalid Publish Subject");
                return;
            }
            handle.msgs_in.fetch_add(1, Ordering::Relaxed);
            server.metrics().message_received(payload.len());
            server.dispatcher().publish(
                &subject,
                reply.as_deref(),
                &payload,
                Source::Client {
                    cid,
                    echo: options.echo,
                },
            );
            ack(handle, options);
        }
    }
}

fn ack(handle: &ClientHandle, options: &SessionOptions) {
    if options.verbose {
        handle.send(Bytes::from_static(OK));
    }
}

/// Drain the outbound queue, batching whatever is ready into one write.
///
/// After close the queue is still flushed, unless the client is slow.
async fn write_loop(
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    mut writer: OwnedWriteHalf,
    handle: &ClientHandle,
) -> io::Result<()> {
    let close = handle.close_token().clone();
    let mut buf = BytesMut::with_capacity(WRITE_BUF_SIZE);

    loop {
        if handle.is_slow() {
            break;
        }
        let first = tokio::select! {
            biased;
            data = rx.recv() => data,
            _ = close.cancelled() => None,
        };
        let Some(first) = first else { break };

        buf.extend_from_slice(&first);
        while buf.len() < WRITE_BUF_SIZE {
            match rx.try_recv() {
                Ok(data) => buf.extend_from_slice(&data),
                Err(_) => break,
            }
        }

        match tokio::time::timeout(WRITE_DEADLINE, writer.write_all(&buf)).await {
            Ok(result) => result?,
            Err(_) => {
                handle.mark_slow();
                break;
            }
        }
        handle.pending_bytes.fetch_sub(buf.len(), Ordering::AcqRel);
        buf.clear();
    }

    let _ = writer.shutdown().await;
    Ok(())
}
