//! TCP socket transport.
//!
//! One physical connection carries every concurrent call a client issues:
//! requests are framed by [`JsonCodec`] and multiplexed by correlation id.
//! Each connection is confined to its own reader and writer tasks; all
//! cross-task traffic flows through channels, so no connection state is
//! shared mutably.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use ntex_bytes::BytesMut;
use ntex_codec::Decoder;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};

use stratus_codec::JsonCodec;
use stratus_core::{
    CallStream, CodecError, ConnectionState, HandlerRegistry, PacketId, ReconnectDecision,
    RequestPacket, ResponsePacket, RetryState, StratusError, TcpClientConfig, TcpServerConfig,
    TransportError,
};

use crate::dispatch::{Dispatcher, DisposalMode, ReplyPublisher};
use crate::mux::Multiplexer;

struct Outbound {
    value: Value,
    ack: oneshot::Sender<Result<(), StratusError>>,
}

#[derive(Clone)]
struct Conn {
    outbound: mpsc::UnboundedSender<Outbound>,
    alive: Arc<AtomicBool>,
}

impl Conn {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

struct ClientInner {
    config: TcpClientConfig,
    mux: Arc<Multiplexer>,
    conn: tokio::sync::Mutex<Option<Conn>>,
    retry: parking_lot::Mutex<RetryState>,
    closed: AtomicBool,
}

/// TCP client multiplexing calls over a single reconnecting connection.
#[derive(Clone)]
pub struct TcpClient {
    inner: Arc<ClientInner>,
}

impl TcpClient {
    /// Create a client; no connection is opened until the first call or
    /// an explicit [`connect`](Self::connect).
    #[must_use]
    pub fn new(config: TcpClientConfig) -> Self {
        let retry = RetryState::new(config.retry);
        Self {
            inner: Arc::new(ClientInner {
                config,
                mux: Arc::new(Multiplexer::new()),
                conn: tokio::sync::Mutex::new(None),
                retry: parking_lot::Mutex::new(retry),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Open the connection if it is not already open.
    ///
    /// Idempotent: a second call while connected or connecting coalesces
    /// onto the same physical connection instead of opening another.
    pub async fn connect(&self) -> Result<(), StratusError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected.into());
        }

        let mut guard = self.inner.conn.lock().await;
        if guard.as_ref().is_some_and(Conn::is_alive) {
            return Ok(());
        }

        let conn = ClientInner::establish(&self.inner).await?;
        *guard = Some(conn);
        self.inner.retry.lock().on_connected();
        Ok(())
    }

    /// Send a request and return its (lazy, cancellable) result stream.
    ///
    /// Dropping the stream before the terminal packet cancels the call:
    /// its routing entry is removed and later responses for the id are
    /// dropped silently.
    pub async fn call(
        &self,
        pattern: impl Into<Value>,
        data: Value,
    ) -> Result<CallStream, StratusError> {
        self.connect().await?;

        let id = PacketId::random();
        let stream = self.inner.mux.register(&id, None);
        let packet = RequestPacket::request(pattern, data, id.clone());

        if let Err(error) = self.send(to_wire(&packet)?).await {
            self.inner.mux.remove(id.as_str());
            return Err(error);
        }
        Ok(stream.with_timeout(self.inner.config.request_timeout))
    }

    /// Publish a fire-and-forget event. Completes when the frame has been
    /// handed to the socket; no response ever arrives.
    pub async fn emit(&self, pattern: impl Into<Value>, data: Value) -> Result<(), StratusError> {
        self.connect().await?;
        self.send(to_wire(&RequestPacket::event(pattern, data))?)
            .await
    }

    /// Close the connection explicitly. Outstanding calls fail and no
    /// reconnect is attempted.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let conn = self.inner.conn.lock().await.take();
        drop(conn);
        self.inner
            .mux
            .fail_all(&TransportError::ConnectionClosed);
    }

    /// Number of calls awaiting responses.
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.inner.mux.pending_count()
    }

    /// Current lifecycle state of the connection.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        if self.inner.closed.load(Ordering::SeqCst) {
            return ConnectionState::Closing;
        }
        match self.inner.conn.try_lock() {
            Ok(guard) => match guard.as_ref() {
                Some(conn) if conn.is_alive() => ConnectionState::Connected,
                _ => ConnectionState::Disconnected,
            },
            Err(_) => ConnectionState::Connecting,
        }
    }

    async fn send(&self, value: Value) -> Result<(), StratusError> {
        let conn = self.inner.conn.lock().await.clone();
        let Some(conn) = conn else {
            return Err(TransportError::NotConnected.into());
        };

        let (ack, ack_rx) = oneshot::channel();
        conn.outbound
            .send(Outbound { value, ack })
            .map_err(|_| TransportError::ConnectionClosed)?;
        ack_rx
            .await
            .map_err(|_| TransportError::ConnectionClosed)?
    }
}

impl ClientInner {
    async fn establish(inner: &Arc<Self>) -> Result<Conn, StratusError> {
        let addr = format!("{}:{}", inner.config.host, inner.config.port);
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("{addr}: {e}")))?;
        let _ = stream.set_nodelay(true);
        tracing::debug!(%addr, "connection established");

        let (read_half, write_half) = stream.into_split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let alive = Arc::new(AtomicBool::new(true));

        tokio::spawn(write_loop(
            write_half,
            outbound_rx,
            inner.config.max_frame_size,
        ));
        tokio::spawn(Self::read_loop(
            Arc::clone(inner),
            read_half,
            Arc::clone(&alive),
        ));

        Ok(Conn { outbound, alive })
    }

    async fn read_loop(inner: Arc<Self>, mut read_half: OwnedReadHalf, alive: Arc<AtomicBool>) {
        let codec = JsonCodec::with_max_frame_size(inner.config.max_frame_size);
        let mut buf = BytesMut::with_capacity(4096);
        let mut chunk = vec![0u8; 8192];

        'conn: loop {
            loop {
                match codec.decode(&mut buf) {
                    Ok(Some(value)) => match serde_json::from_value::<ResponsePacket>(value) {
                        Ok(packet) => inner.mux.dispatch(packet),
                        Err(error) => {
                            tracing::debug!(%error, "ignoring message that is not a response")
                        }
                    },
                    Ok(None) => break,
                    Err(error) => {
                        tracing::error!(%error, "protocol violation, terminating connection");
                        break 'conn;
                    }
                }
            }

            match read_half.read(&mut chunk).await {
                Ok(0) => {
                    tracing::debug!("connection closed by peer");
                    break;
                }
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(error) => {
                    tracing::debug!(%error, "read failed");
                    break;
                }
            }
        }

        alive.store(false, Ordering::SeqCst);
        inner.mux.fail_all(&TransportError::ConnectionClosed);
        if !inner.closed.load(Ordering::SeqCst) {
            Self::schedule_reconnect(inner);
        }
    }

    /// Reconnect after an unexpected close, within the policy's budget.
    fn schedule_reconnect(inner: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                let decision = inner.retry.lock().on_disconnect();
                match decision {
                    ReconnectDecision::GiveUp => {
                        tracing::warn!("not reconnecting: retry budget exhausted or disabled");
                        break;
                    }
                    ReconnectDecision::Retry { attempt, delay } => {
                        tokio::time::sleep(delay).await;
                        if inner.closed.load(Ordering::SeqCst) {
                            break;
                        }
                        let mut guard = inner.conn.lock().await;
                        if guard.as_ref().is_some_and(Conn::is_alive) {
                            break;
                        }
                        match Self::establish(&inner).await {
                            Ok(conn) => {
                                *guard = Some(conn);
                                inner.retry.lock().on_connected();
                                tracing::info!(attempt, "reconnected");
                                break;
                            }
                            Err(error) => {
                                tracing::warn!(attempt, %error, "reconnect attempt failed");
                            }
                        }
                    }
                }
            }
        });
    }
}

async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    max_frame_size: usize,
) {
    let codec = JsonCodec::with_max_frame_size(max_frame_size);
    while let Some(out) = rx.recv().await {
        let result = match codec.encode_value(&out.value) {
            Ok(frame) => write_half
                .write_all(&frame)
                .await
                .map_err(|e| StratusError::Transport(e.into())),
            Err(error) => Err(error.into()),
        };
        let failed = matches!(result, Err(StratusError::Transport(_)));
        let _ = out.ack.send(result);
        if failed {
            break;
        }
    }
}

fn to_wire(packet: &RequestPacket) -> Result<Value, StratusError> {
    serde_json::to_value(packet)
        .map_err(|e| StratusError::Codec(CodecError::Serialize(e.to_string())))
}

/// TCP server: accepts framed connections and dispatches each inbound
/// packet against the handler registry.
pub struct TcpServer {
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    max_frame_size: usize,
}

impl TcpServer {
    /// Bind the listening socket. Port `0` picks an ephemeral port, which
    /// [`local_addr`](Self::local_addr) reports.
    pub async fn bind(
        config: TcpServerConfig,
        registry: Arc<HandlerRegistry>,
    ) -> Result<Self, StratusError> {
        let listener = TcpListener::bind((config.host.as_str(), config.port))
            .await
            .map_err(|e| StratusError::Transport(e.into()))?;
        Ok(Self {
            listener,
            dispatcher: Arc::new(Dispatcher::new(registry, DisposalMode::Folded)),
            max_frame_size: config.max_frame_size,
        })
    }

    /// The address the server is listening on.
    pub fn local_addr(&self) -> Result<SocketAddr, StratusError> {
        self.listener
            .local_addr()
            .map_err(|e| StratusError::Transport(e.into()))
    }

    /// Accept connections until the task is dropped.
    pub async fn run(self) {
        loop {
            match self.listener.accept().await {
                Ok((socket, peer)) => {
                    tracing::debug!(%peer, "connection established");
                    let _ = socket.set_nodelay(true);
                    tokio::spawn(handle_connection(
                        socket,
                        Arc::clone(&self.dispatcher),
                        self.max_frame_size,
                    ));
                }
                Err(error) => {
                    tracing::warn!(%error, "accept failed");
                }
            }
        }
    }
}

struct SocketReply {
    tx: mpsc::UnboundedSender<ResponsePacket>,
}

#[async_trait]
impl ReplyPublisher for SocketReply {
    async fn publish(&self, packet: ResponsePacket) -> Result<(), StratusError> {
        self.tx
            .send(packet)
            .map_err(|_| TransportError::ConnectionClosed.into())
    }
}

async fn handle_connection(socket: TcpStream, dispatcher: Arc<Dispatcher>, max_frame_size: usize) {
    let (mut read_half, mut write_half) = socket.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ResponsePacket>();

    // single writer per connection; handler tasks funnel through it
    tokio::spawn(async move {
        let codec = JsonCodec::with_max_frame_size(max_frame_size);
        while let Some(packet) = rx.recv().await {
            let frame = match serde_json::to_value(&packet).map(|v| codec.encode_value(&v)) {
                Ok(Ok(frame)) => frame,
                Ok(Err(error)) => {
                    tracing::error!(%error, "failed to encode response");
                    continue;
                }
                Err(error) => {
                    tracing::error!(%error, "failed to serialize response");
                    continue;
                }
            };
            if write_half.write_all(&frame).await.is_err() {
                break;
            }
        }
    });

    let reply = Arc::new(SocketReply { tx });
    let codec = JsonCodec::with_max_frame_size(max_frame_size);
    let mut buf = BytesMut::with_capacity(4096);
    let mut chunk = vec![0u8; 8192];

    'conn: loop {
        loop {
            match codec.decode(&mut buf) {
                Ok(Some(value)) => match serde_json::from_value::<RequestPacket>(value) {
                    Ok(packet) => {
                        let dispatcher = Arc::clone(&dispatcher);
                        let reply = Arc::clone(&reply);
                        tokio::spawn(async move {
                            dispatcher.handle(packet, reply.as_ref()).await;
                        });
                    }
                    Err(error) => tracing::debug!(%error, "ignoring malformed packet"),
                },
                Ok(None) => break,
                Err(error) => {
                    tracing::error!(%error, "protocol violation, terminating connection");
                    break 'conn;
                }
            }
        }

        match read_half.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(error) => {
                tracing::debug!(%error, "read failed");
                break;
            }
        }
    }
    tracing::debug!("connection closed");
}
