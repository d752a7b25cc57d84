use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, instrument, warn};

use crate::config::ClusterConfig;
use crate::order::OrderingFilter;
use crate::suppressor::DuplicateSuppressor;
use crate::wire::{self, flags, Envelope, Payload};
use crate::{ClusterError, Result};

/// Delay between transport-level delivery retries
const RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Delay between listen-port scan attempts
const PORT_SCAN_BACKOFF: Duration = Duration::from_millis(50);

/// Per-connection outbound frame queue depth
const WRITER_QUEUE_DEPTH: usize = 64;

/// Receives envelopes the channel has accepted for delivery (after duplicate
/// suppression and re-ordering). Returning a payload answers a correlated
/// request; `None` produces a bare acknowledgment when one is expected.
#[async_trait]
pub trait ChannelHandler: Send + Sync {
    async fn on_envelope(&self, envelope: Envelope) -> Result<Option<Payload>>;

    /// A persistent connection to `endpoint` was lost.
    async fn on_peer_disconnected(&self, _endpoint: &str) {}
}

/// Handle to send frames through one persistent connection
#[derive(Clone)]
pub(crate) struct ConnectionHandle {
    pub addr: SocketAddr,
    tx: mpsc::Sender<Vec<u8>>,
}

impl ConnectionHandle {
    pub async fn send(&self, frame: Vec<u8>) -> Result<()> {
        self.tx.send(frame).await.map_err(|_| {
            ClusterError::Network(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "connection writer closed",
            ))
        })
    }
}

struct ConnectionPool {
    connections: HashMap<SocketAddr, ConnectionHandle>,
}

impl ConnectionPool {
    fn new() -> Self {
        Self {
            connections: HashMap::new(),
        }
    }

    fn get(&self, addr: &SocketAddr) -> Option<ConnectionHandle> {
        self.connections.get(addr).cloned()
    }

    fn insert(&mut self, handle: ConnectionHandle) {
        self.connections.insert(handle.addr, handle);
    }

    /// Register an inbound connection's writer for bidirectional reuse; an
    /// existing connection to the same peer wins.
    fn add_incoming(&mut self, handle: ConnectionHandle) -> bool {
        if self.connections.contains_key(&handle.addr) {
            return false;
        }
        self.connections.insert(handle.addr, handle);
        true
    }

    fn remove(&mut self, addr: &SocketAddr) {
        self.connections.remove(addr);
    }

    fn clear(&mut self) {
        self.connections.clear();
    }
}

/// Correlates RPC-style requests with their replies
struct CorrelationTracker {
    next: AtomicU32,
    pending: DashMap<u32, oneshot::Sender<Envelope>>,
}

impl CorrelationTracker {
    fn new() -> Self {
        Self {
            next: AtomicU32::new(1),
            pending: DashMap::new(),
        }
    }

    fn allocate(&self, tx: oneshot::Sender<Envelope>) -> u32 {
        let mut id = self.next.fetch_add(1, Ordering::Relaxed);
        while id == 0 || self.pending.contains_key(&id) {
            id = self.next.fetch_add(1, Ordering::Relaxed);
        }
        self.pending.insert(id, tx);
        id
    }

    fn complete(&self, id: u32, envelope: Envelope) -> bool {
        if let Some((_, tx)) = self.pending.remove(&id) {
            let _ = tx.send(envelope);
            true
        } else {
            false
        }
    }

    fn cancel(&self, id: u32) {
        self.pending.remove(&id);
    }
}

/// Node-to-node channel: a TCP listener plus a pool of persistent
/// connections, with duplicate suppression and order restoration applied to
/// everything it delivers upward.
pub struct NodeChannel {
    pub bind_addr: SocketAddr,
    local_endpoint: String,
    max_message_size: usize,
    max_retries: usize,
    connect_timeout: Duration,
    listener: parking_lot::Mutex<Option<TcpListener>>,
    pool: tokio::sync::Mutex<ConnectionPool>,
    correlation: CorrelationTracker,
    suppressor: Option<Arc<DuplicateSuppressor>>,
    ordering: Option<OrderingFilter>,
    sequences: parking_lot::Mutex<HashMap<Vec<u8>, u64>>,
    handler: tokio::sync::RwLock<Option<Arc<dyn ChannelHandler>>>,
    shutdown: AtomicBool,
    accept_handle: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl NodeChannel {
    /// Bind the listener, trying the preferred port first and then scanning a
    /// port range when it is taken.
    pub async fn bind(
        advertised_host: &str,
        config: &ClusterConfig,
        suppressor: Option<Arc<DuplicateSuppressor>>,
    ) -> Result<Arc<Self>> {
        let mut candidates = Vec::new();
        if let Some(port) = config.local_port {
            candidates.push(port);
        }
        for offset in 0..config.port_scan_retries {
            candidates.push(config.port_scan_start.wrapping_add(offset));
        }

        let mut listener = None;
        let mut last_err: Option<io::Error> = None;
        for port in candidates {
            match TcpListener::bind(("0.0.0.0", port)).await {
                Ok(bound) => {
                    listener = Some(bound);
                    break;
                }
                Err(err) => {
                    debug!(port, error = %err, "listen port unavailable, scanning on");
                    last_err = Some(err);
                    tokio::time::sleep(PORT_SCAN_BACKOFF).await;
                }
            }
        }
        let listener = match listener {
            Some(listener) => listener,
            None => {
                return Err(ClusterError::Network(last_err.unwrap_or_else(|| {
                    io::Error::new(io::ErrorKind::AddrInUse, "no listen port available")
                })))
            }
        };

        let bind_addr = listener.local_addr()?;
        let local_endpoint = format!("{}:{}", advertised_host, bind_addr.port());
        info!(bind_addr = %bind_addr, endpoint = %local_endpoint, "channel listener bound");

        Ok(Arc::new(Self {
            bind_addr,
            local_endpoint,
            max_message_size: config.max_message_size,
            max_retries: config.max_retries,
            connect_timeout: config.connect_timeout,
            listener: parking_lot::Mutex::new(Some(listener)),
            pool: tokio::sync::Mutex::new(ConnectionPool::new()),
            correlation: CorrelationTracker::new(),
            suppressor,
            ordering: config.preserve_order.then(OrderingFilter::new),
            sequences: parking_lot::Mutex::new(HashMap::new()),
            handler: tokio::sync::RwLock::new(None),
            shutdown: AtomicBool::new(false),
            accept_handle: parking_lot::Mutex::new(None),
        }))
    }

    /// Advertised `host:port` of this node's listener.
    pub fn local_endpoint(&self) -> &str {
        &self.local_endpoint
    }

    pub async fn set_handler(&self, handler: Arc<dyn ChannelHandler>) {
        *self.handler.write().await = Some(handler);
    }

    /// Start accepting inbound connections. The handler should be installed
    /// first or early frames are dropped.
    pub fn start(self: &Arc<Self>) {
        let listener = match self.listener.lock().take() {
            Some(listener) => listener,
            None => return,
        };
        let channel = Arc::clone(self);
        let handle = tokio::spawn(async move {
            channel.accept_loop(listener).await;
        });
        *self.accept_handle.lock() = Some(handle);
    }

    #[instrument(skip(self, listener), fields(bind_addr = %self.bind_addr))]
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        info!("channel accept loop started");
        loop {
            match listener.accept().await {
                Ok((stream, conn_addr)) => {
                    if self.shutdown.load(Ordering::Acquire) {
                        break;
                    }
                    let _ = stream.set_nodelay(true);
                    let channel = Arc::clone(&self);
                    tokio::spawn(async move {
                        channel.handle_incoming(stream, conn_addr).await;
                    });
                }
                Err(err) => {
                    if self.shutdown.load(Ordering::Acquire) {
                        break;
                    }
                    error!(error = %err, "failed to accept connection");
                }
            }
        }
        info!("channel accept loop stopped");
    }

    /// Drive one inbound connection: identify the sender from its first
    /// frame, register the writer for bidirectional reuse, then pump frames.
    async fn handle_incoming(self: Arc<Self>, stream: TcpStream, conn_addr: SocketAddr) {
        let (mut reader, writer) = stream.into_split();
        let tx = spawn_writer(writer, conn_addr);

        let first = match read_frame(&mut reader, self.max_message_size).await {
            Ok(envelope) => envelope,
            Err(err) => {
                debug!(peer = %conn_addr, error = %err, "failed to read initial frame");
                return;
            }
        };

        let sender_endpoint = first.sender.clone();
        let sender_addr = resolve_endpoint(&sender_endpoint).await.ok();
        if let Some(addr) = sender_addr {
            let registered = {
                let mut pool = self.pool.lock().await;
                pool.add_incoming(ConnectionHandle { addr, tx })
            };
            if registered {
                debug!(peer = %sender_endpoint, conn = %conn_addr, "registered inbound connection for reuse");
            }
        }

        self.process_envelope(first).await;

        loop {
            match read_frame(&mut reader, self.max_message_size).await {
                Ok(envelope) => self.process_envelope(envelope).await,
                Err(ClusterError::Network(err)) if err.kind() == io::ErrorKind::UnexpectedEof => {
                    debug!(peer = %sender_endpoint, "connection closed by peer");
                    break;
                }
                Err(err) => {
                    debug!(peer = %sender_endpoint, error = %err, "connection read failed");
                    break;
                }
            }
        }

        if let Some(addr) = sender_addr {
            self.pool.lock().await.remove(&addr);
        }
        self.notify_disconnect(&sender_endpoint).await;
    }

    /// Get or establish the persistent connection to a peer's listening
    /// endpoint.
    fn connection<'a>(
        self: &'a Arc<Self>,
        endpoint: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<ConnectionHandle>> + Send + 'a>> {
        // Boxed to break the `Send`-inference cycle: this future spawns
        // `outbound_read_loop`, which can transitively call back here.
        Box::pin(async move {
            let addr = resolve_endpoint(endpoint).await?;
            if let Some(handle) = self.pool.lock().await.get(&addr) {
                return Ok(handle);
            }

            let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
                .await
                .map_err(|_| ClusterError::Timeout)??;
            let _ = stream.set_nodelay(true);
            let (reader, writer) = stream.into_split();
            let tx = spawn_writer(writer, addr);
            let handle = ConnectionHandle { addr, tx };

            {
                let mut pool = self.pool.lock().await;
                // A concurrent task may have connected first; keep its connection.
                if let Some(existing) = pool.get(&addr) {
                    return Ok(existing);
                }
                pool.insert(handle.clone());
            }

            let channel = Arc::clone(self);
            let endpoint = endpoint.to_string();
            tokio::spawn(async move {
                channel.outbound_read_loop(reader, addr, &endpoint).await;
            });

            Ok(handle)
        })
    }

    async fn outbound_read_loop(
        self: Arc<Self>,
        mut reader: OwnedReadHalf,
        addr: SocketAddr,
        endpoint: &str,
    ) {
        loop {
            match read_frame(&mut reader, self.max_message_size).await {
                Ok(envelope) => self.process_envelope(envelope).await,
                Err(err) => {
                    debug!(peer = %endpoint, error = %err, "outbound connection closed");
                    break;
                }
            }
        }
        self.pool.lock().await.remove(&addr);
        self.notify_disconnect(endpoint).await;
    }

    /// Allocate the next delivery sequence for ordered sends within a domain.
    pub fn next_sequence(&self, domain: &[u8]) -> u64 {
        let mut sequences = self.sequences.lock();
        let counter = sequences.entry(domain.to_vec()).or_insert(0);
        *counter += 1;
        *counter
    }

    fn seal(&self, envelope: &mut Envelope) {
        if envelope.sender.is_empty() {
            envelope.sender = self.local_endpoint.clone();
        }
        if envelope.has_option(flags::PRESERVE_ORDER)
            && envelope.sequence == 0
            && !envelope.has_option(flags::REPLY)
        {
            envelope.sequence = self.next_sequence(&envelope.domain);
        }
    }

    /// Fire-and-forget delivery over the reliable channel: transient network
    /// failures are retried up to the configured limit; serialization failure
    /// surfaces immediately without touching the network.
    pub async fn send_to_endpoint(
        self: &Arc<Self>,
        endpoint: &str,
        mut envelope: Envelope,
    ) -> Result<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(ClusterError::Shutdown);
        }
        self.seal(&mut envelope);
        let frame = wire::encode_frame(&envelope, self.max_message_size)?;

        let attempts = self.max_retries.max(1);
        let mut last_err = None;
        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(RETRY_BACKOFF).await;
            }
            match self.connection(endpoint).await {
                Ok(conn) => match conn.send(frame.clone()).await {
                    Ok(()) => return Ok(()),
                    Err(err) => {
                        self.pool.lock().await.remove(&conn.addr);
                        last_err = Some(err);
                    }
                },
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or_else(|| ClusterError::PeerUnreachable(endpoint.to_string())))
    }

    /// Send a correlated request and await its reply.
    ///
    /// `Ok(None)` means the peer did not answer within the timeout; callers
    /// treat that as "no reply yet" and apply their own retry policy.
    pub async fn request(
        self: &Arc<Self>,
        endpoint: &str,
        mut envelope: Envelope,
        timeout: Duration,
    ) -> Result<Option<Envelope>> {
        let (tx, rx) = oneshot::channel();
        let correlation = self.correlation.allocate(tx);
        envelope.correlation = correlation;
        envelope.options |= flags::SYNC_ACK;

        if let Err(err) = self.send_to_endpoint(endpoint, envelope).await {
            self.correlation.cancel(correlation);
            return Err(err);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(Some(reply)),
            Ok(Err(_)) => Err(ClusterError::Shutdown),
            Err(_) => {
                self.correlation.cancel(correlation);
                Ok(None)
            }
        }
    }

    /// Loop an envelope back through the local delivery pipeline.
    pub async fn deliver_local(self: &Arc<Self>, mut envelope: Envelope) {
        self.seal(&mut envelope);
        self.process_envelope(envelope).await;
    }

    /// Inbound pipeline: correlation completion, then duplicate suppression,
    /// then order restoration, then dispatch.
    pub(crate) async fn process_envelope(self: &Arc<Self>, envelope: Envelope) {
        if envelope.is_reply() && envelope.correlation != 0 {
            if !self.correlation.complete(envelope.correlation, envelope) {
                // Reply arrived after its request timed out; nothing to do.
                debug!("dropping reply for unknown correlation");
            }
            return;
        }

        if envelope.has_option(flags::AT_MOST_ONCE) {
            if let Some(suppressor) = &self.suppressor {
                if !suppressor.should_process(&envelope.message_id()) {
                    debug!(
                        message_id = %envelope.message_id(),
                        sender = %envelope.sender,
                        "discarding duplicate message"
                    );
                    return;
                }
            }
        }

        let deliverable = match &self.ordering {
            Some(filter) => filter.submit(envelope),
            None => vec![envelope],
        };
        for envelope in deliverable {
            self.dispatch(envelope).await;
        }
    }

    async fn dispatch(self: &Arc<Self>, envelope: Envelope) {
        let correlation = envelope.correlation;
        let reply_to = envelope.sender.clone();
        let domain = envelope.domain.clone();

        let handler = self.handler.read().await.clone();
        let Some(handler) = handler else {
            debug!("no channel handler installed, dropping envelope");
            return;
        };

        match handler.on_envelope(envelope).await {
            Ok(reply) => {
                if correlation != 0 {
                    let payload = reply.unwrap_or(Payload::Ack);
                    let mut out = Envelope::new(domain, flags::REPLY, payload);
                    out.correlation = correlation;
                    if let Err(err) = self.send_to_endpoint(&reply_to, out).await {
                        warn!(peer = %reply_to, error = %err, "failed to send reply");
                    }
                }
            }
            Err(err) => {
                warn!(sender = %reply_to, error = %err, "handler rejected envelope");
            }
        }
    }

    async fn notify_disconnect(&self, endpoint: &str) {
        if self.shutdown.load(Ordering::Acquire) {
            return;
        }
        let handler = self.handler.read().await.clone();
        if let Some(handler) = handler {
            handler.on_peer_disconnected(endpoint).await;
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Stop accepting, drop all pooled connections, release the handler.
    pub async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.accept_handle.lock().take() {
            handle.abort();
        }
        self.pool.lock().await.clear();
        *self.handler.write().await = None;
        info!(endpoint = %self.local_endpoint, "channel shut down");
    }
}

/// Spawn the writer task owning one connection's write half.
fn spawn_writer(mut writer: OwnedWriteHalf, addr: SocketAddr) -> mpsc::Sender<Vec<u8>> {
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(WRITER_QUEUE_DEPTH);
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(err) = writer.write_all(&frame).await {
                debug!(peer = %addr, error = %err, "connection write failed");
                break;
            }
        }
    });
    tx
}

async fn read_frame(reader: &mut OwnedReadHalf, max_size: usize) -> Result<Envelope> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > max_size {
        return Err(ClusterError::MessageTooLarge {
            size: len,
            max: max_size,
        });
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await?;
    wire::decode_body(&data)
}

/// Resolve a `host:port` endpoint, going through DNS when needed.
pub(crate) async fn resolve_endpoint(endpoint: &str) -> Result<SocketAddr> {
    if let Ok(addr) = endpoint.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let mut addrs = tokio::net::lookup_host(endpoint).await?;
    addrs
        .next()
        .ok_or_else(|| ClusterError::PeerUnreachable(endpoint.to_string()))
}

/// TCP-level reachability probe used by the WKA bootstrap.
pub(crate) async fn probe_endpoint(endpoint: &str, timeout: Duration) -> bool {
    let Ok(addr) = resolve_endpoint(endpoint).await else {
        return false;
    };
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tracing_test::traced_test;

    fn test_config() -> ClusterConfig {
        ClusterConfig {
            local_port: Some(0),
            max_retries: 2,
            connect_timeout: Duration::from_millis(500),
            ..Default::default()
        }
    }

    struct EchoHandler {
        delivered: AtomicUsize,
    }

    #[async_trait]
    impl ChannelHandler for EchoHandler {
        async fn on_envelope(&self, envelope: Envelope) -> Result<Option<Payload>> {
            self.delivered.fetch_add(1, Ordering::SeqCst);
            match envelope.payload {
                Payload::Command { command } => Ok(Some(Payload::Response { response: command })),
                _ => Ok(None),
            }
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn test_request_reply_round_trip() -> Result<()> {
        let receiver = NodeChannel::bind("127.0.0.1", &test_config(), None).await?;
        let handler = Arc::new(EchoHandler {
            delivered: AtomicUsize::new(0),
        });
        receiver.set_handler(handler.clone()).await;
        receiver.start();

        let sender = NodeChannel::bind("127.0.0.1", &test_config(), None).await?;
        sender.start();

        let envelope = Envelope::new(
            b"grp1".to_vec(),
            0,
            Payload::Command {
                command: b"hello".to_vec(),
            },
        );
        let reply = sender
            .request(
                receiver.local_endpoint(),
                envelope,
                Duration::from_secs(5),
            )
            .await?
            .expect("reply within timeout");

        match reply.payload {
            Payload::Response { response } => assert_eq!(response, b"hello"),
            other => panic!("unexpected reply payload: {other:?}"),
        }
        assert_eq!(handler.delivered.load(Ordering::SeqCst), 1);

        sender.shutdown().await;
        receiver.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_request_times_out_as_no_reply() -> Result<()> {
        struct SilentHandler;

        #[async_trait]
        impl ChannelHandler for SilentHandler {
            async fn on_envelope(&self, _envelope: Envelope) -> Result<Option<Payload>> {
                // Swallow without replying; the requester must see a timeout.
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(None)
            }
        }

        let receiver = NodeChannel::bind("127.0.0.1", &test_config(), None).await?;
        receiver.set_handler(Arc::new(SilentHandler)).await;
        receiver.start();

        let sender = NodeChannel::bind("127.0.0.1", &test_config(), None).await?;
        sender.start();

        let envelope = Envelope::new(b"grp1".to_vec(), 0, Payload::Ack);
        let reply = sender
            .request(
                receiver.local_endpoint(),
                envelope,
                Duration::from_millis(200),
            )
            .await?;
        assert!(reply.is_none());

        sender.shutdown().await;
        receiver.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_at_most_once_pipeline_discards_duplicates() -> Result<()> {
        let suppressor = Arc::new(DuplicateSuppressor::new(
            Duration::from_secs(300),
            10_000,
        ));
        let channel =
            NodeChannel::bind("127.0.0.1", &test_config(), Some(suppressor)).await?;
        let handler = Arc::new(EchoHandler {
            delivered: AtomicUsize::new(0),
        });
        channel.set_handler(handler.clone()).await;

        let envelope = Envelope::new(
            b"grp1".to_vec(),
            flags::AT_MOST_ONCE,
            Payload::Command {
                command: b"once".to_vec(),
            },
        );
        channel.deliver_local(envelope.clone()).await;
        channel.deliver_local(envelope).await;

        assert_eq!(handler.delivered.load(Ordering::SeqCst), 1);
        channel.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_fails_after_retries() -> Result<()> {
        let sender = NodeChannel::bind("127.0.0.1", &test_config(), None).await?;
        sender.start();

        let envelope = Envelope::new(b"grp1".to_vec(), 0, Payload::Ack);
        let err = sender
            .send_to_endpoint("127.0.0.1:1", envelope)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClusterError::Network(_) | ClusterError::Timeout | ClusterError::PeerUnreachable(_)
        ));

        sender.shutdown().await;
        Ok(())
    }
}
