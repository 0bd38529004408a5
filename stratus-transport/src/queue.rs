//! Durable queue transport.
//!
//! Requests are published to a named queue; each client consumes a
//! private reply queue and stamps every request with `reply_to` and
//! `correlation_id` properties. The server publishes each response packet
//! to the delivery's `reply_to`, echoing the correlation id, and
//! acknowledges the delivery once handling finishes. The prefetch count
//! bounds unacknowledged deliveries in flight.
//!
//! The adapter is written against the [`QueueDriver`] seam;
//! [`MemoryQueue`] is the in-process reference driver.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, Semaphore};

use stratus_core::{
    CallStream, CodecError, ConnectionState, HandlerRegistry, PacketId, QueueConfig,
    ReconnectDecision, RequestPacket, ResponsePacket, RetryState, StratusError, TransportError,
};

use crate::dispatch::{Dispatcher, DisposalMode, ReplyPublisher};
use crate::mux::Multiplexer;

/// Broker properties attached to one published message.
#[derive(Debug, Clone, Default)]
pub struct DeliveryProps {
    /// Queue the consumer should publish responses to.
    pub reply_to: Option<String>,
    /// Correlation id linking responses back to the request.
    pub correlation_id: Option<String>,
}

/// One message taken from a queue.
///
/// Dropping an unacknowledged delivery releases its prefetch slot as if
/// it had been acknowledged.
pub struct Delivery {
    /// Raw payload bytes.
    pub payload: Vec<u8>,
    /// Properties stamped by the publisher.
    pub props: DeliveryProps,
    ack: Option<Box<dyn FnOnce() + Send>>,
}

impl Delivery {
    /// Build a delivery with an acknowledgement hook.
    #[must_use]
    pub fn new(payload: Vec<u8>, props: DeliveryProps, ack: Option<Box<dyn FnOnce() + Send>>) -> Self {
        Self { payload, props, ack }
    }

    /// Acknowledge the delivery, freeing its prefetch slot.
    pub fn ack(&mut self) {
        if let Some(ack) = self.ack.take() {
            ack();
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("props", &self.props)
            .field("payload_len", &self.payload.len())
            .finish_non_exhaustive()
    }
}

/// Driver seam over a durable queue broker library.
#[async_trait]
pub trait QueueDriver: Send + Sync {
    /// Open a connection to the broker.
    async fn connect(&self, url: &str) -> Result<Arc<dyn QueueConnection>, TransportError>;
}

/// One open broker connection.
#[async_trait]
pub trait QueueConnection: Send + Sync {
    /// Ensure a queue exists.
    async fn declare(&self, queue: &str) -> Result<(), TransportError>;

    /// Start consuming a queue with at most `prefetch` unacknowledged
    /// deliveries in flight. The stream ending signals connection loss.
    async fn consume(
        &self,
        queue: &str,
        prefetch: u16,
    ) -> Result<mpsc::UnboundedReceiver<Delivery>, TransportError>;

    /// Publish a payload to a queue.
    async fn publish(
        &self,
        queue: &str,
        payload: Vec<u8>,
        props: DeliveryProps,
    ) -> Result<(), TransportError>;

    /// Close the connection.
    async fn close(&self);
}

#[derive(Clone)]
struct QueueConn {
    conn: Arc<dyn QueueConnection>,
    alive: Arc<AtomicBool>,
}

struct QueueClientInner {
    config: QueueConfig,
    driver: Arc<dyn QueueDriver>,
    mux: Arc<Multiplexer>,
    conn: tokio::sync::Mutex<Option<QueueConn>>,
    reply_queue: String,
    retry: parking_lot::Mutex<RetryState>,
    closed: AtomicBool,
}

/// Client over a durable queue.
#[derive(Clone)]
pub struct QueueClient {
    inner: Arc<QueueClientInner>,
}

impl QueueClient {
    /// Create a client over the given driver. Each client owns a private
    /// reply queue derived from the request queue name.
    #[must_use]
    pub fn new(config: QueueConfig, driver: Arc<dyn QueueDriver>) -> Self {
        let retry = RetryState::new(config.retry);
        let reply_queue = format!("{}.reply.{}", config.queue, PacketId::random());
        Self {
            inner: Arc::new(QueueClientInner {
                config,
                driver,
                mux: Arc::new(Multiplexer::new()),
                conn: tokio::sync::Mutex::new(None),
                reply_queue,
                retry: parking_lot::Mutex::new(retry),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// The private reply queue this client consumes.
    #[must_use]
    pub fn reply_queue(&self) -> &str {
        &self.inner.reply_queue
    }

    /// Open the connection and reply-queue consumer (idempotent).
    pub async fn connect(&self) -> Result<(), StratusError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected.into());
        }

        let mut guard = self.inner.conn.lock().await;
        if guard
            .as_ref()
            .is_some_and(|c| c.alive.load(Ordering::SeqCst))
        {
            return Ok(());
        }

        let conn = QueueClientInner::establish(&self.inner).await?;
        *guard = Some(conn);
        self.inner.retry.lock().on_connected();
        Ok(())
    }

    /// Send a request and return its result stream. Responses are routed
    /// by the broker-level correlation id.
    pub async fn call(
        &self,
        pattern: impl Into<Value>,
        data: Value,
    ) -> Result<CallStream, StratusError> {
        self.connect().await?;

        let id = PacketId::random();
        let stream = self.inner.mux.register(&id, None);
        let packet = RequestPacket::request(pattern, data, id.clone());
        let props = DeliveryProps {
            reply_to: Some(self.inner.reply_queue.clone()),
            correlation_id: Some(id.as_str().to_string()),
        };

        if let Err(error) = self.publish(&packet, props).await {
            self.inner.mux.remove(id.as_str());
            return Err(error);
        }
        Ok(stream.with_timeout(self.inner.config.request_timeout))
    }

    /// Publish a fire-and-forget event to the request queue.
    pub async fn emit(&self, pattern: impl Into<Value>, data: Value) -> Result<(), StratusError> {
        self.connect().await?;
        self.publish(&RequestPacket::event(pattern, data), DeliveryProps::default())
            .await
    }

    /// Close the connection explicitly; no reconnect follows.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let conn = self.inner.conn.lock().await.take();
        if let Some(conn) = conn {
            conn.conn.close().await;
        }
        self.inner.mux.fail_all(&TransportError::ConnectionClosed);
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
                Some(conn) if conn.alive.load(Ordering::SeqCst) => ConnectionState::Connected,
                _ => ConnectionState::Disconnected,
            },
            Err(_) => ConnectionState::Connecting,
        }
    }

    async fn publish(&self, packet: &RequestPacket, props: DeliveryProps) -> Result<(), StratusError> {
        let payload = serde_json::to_vec(packet)
            .map_err(|e| StratusError::Codec(CodecError::Serialize(e.to_string())))?;
        let conn = self
            .inner
            .conn
            .lock()
            .await
            .clone()
            .ok_or(TransportError::NotConnected)?;
        conn.conn
            .publish(&self.inner.config.queue, payload, props)
            .await
            .map_err(StratusError::from)
    }
}

impl QueueClientInner {
    async fn establish(inner: &Arc<Self>) -> Result<QueueConn, StratusError> {
        let conn = inner
            .driver
            .connect(&inner.config.url)
            .await
            .map_err(StratusError::from)?;
        conn.declare(&inner.reply_queue).await?;
        let deliveries = conn
            .consume(&inner.reply_queue, inner.config.prefetch)
            .await?;
        tracing::debug!(
            url = %inner.config.url,
            reply_queue = %inner.reply_queue,
            "queue connection established"
        );

        let alive = Arc::new(AtomicBool::new(true));
        let conn = QueueConn { conn, alive };
        tokio::spawn(Self::inbound_loop(Arc::clone(inner), conn.clone(), deliveries));
        Ok(conn)
    }

    async fn inbound_loop(
        inner: Arc<Self>,
        conn: QueueConn,
        mut deliveries: mpsc::UnboundedReceiver<Delivery>,
    ) {
        while let Some(mut delivery) = deliveries.recv().await {
            match serde_json::from_slice::<ResponsePacket>(&delivery.payload) {
                Ok(mut packet) => {
                    // the broker-assigned correlation id is authoritative
                    if let Some(correlation) = &delivery.props.correlation_id {
                        packet.id = PacketId::from(correlation.as_str());
                    }
                    inner.mux.dispatch(packet);
                }
                Err(error) => tracing::debug!(%error, "ignoring malformed reply"),
            }
            delivery.ack();
        }

        conn.alive.store(false, Ordering::SeqCst);
        inner.mux.fail_all(&TransportError::ConnectionClosed);
        if !inner.closed.load(Ordering::SeqCst) {
            tracing::debug!("queue connection lost");
            Self::schedule_reconnect(inner);
        }
    }

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
                        if guard
                            .as_ref()
                            .is_some_and(|c| c.alive.load(Ordering::SeqCst))
                        {
                            break;
                        }
                        match Self::establish(&inner).await {
                            Ok(conn) => {
                                *guard = Some(conn);
                                inner.retry.lock().on_connected();
                                tracing::info!(attempt, "reconnected to queue broker");
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

/// Server consuming a named request queue.
pub struct QueueServer {
    config: QueueConfig,
    driver: Arc<dyn QueueDriver>,
    dispatcher: Arc<Dispatcher>,
    ready: tokio::sync::watch::Sender<bool>,
}

impl QueueServer {
    /// Create a server over the given driver and registry.
    #[must_use]
    pub fn new(
        config: QueueConfig,
        driver: Arc<dyn QueueDriver>,
        registry: Arc<HandlerRegistry>,
    ) -> Self {
        let (ready, _) = tokio::sync::watch::channel(false);
        Self {
            config,
            driver,
            dispatcher: Arc::new(Dispatcher::new(registry, DisposalMode::Marker)),
            ready,
        }
    }

    /// Observe when the server is consuming its request queue.
    #[must_use]
    pub fn ready(&self) -> tokio::sync::watch::Receiver<bool> {
        self.ready.subscribe()
    }

    /// Serve until the connection is lost beyond the retry budget.
    pub async fn run(self) -> Result<(), StratusError> {
        let mut retry = RetryState::new(self.config.retry);

        loop {
            let conn = match self.driver.connect(&self.config.url).await {
                Ok(conn) => conn,
                Err(error) => match retry.on_disconnect() {
                    ReconnectDecision::Retry { attempt, delay } => {
                        tracing::warn!(attempt, %error, "queue connect failed, retrying");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    ReconnectDecision::GiveUp => return Err(error.into()),
                },
            };
            retry.on_connected();

            conn.declare(&self.config.queue).await?;
            let mut deliveries = conn.consume(&self.config.queue, self.config.prefetch).await?;
            let _ = self.ready.send(true);
            tracing::info!(queue = %self.config.queue, "consuming request queue");

            while let Some(mut delivery) = deliveries.recv().await {
                match serde_json::from_slice::<RequestPacket>(&delivery.payload) {
                    Ok(packet) => {
                        let dispatcher = Arc::clone(&self.dispatcher);
                        let reply = QueueReply {
                            conn: Arc::clone(&conn),
                            reply_to: delivery.props.reply_to.clone(),
                            correlation_id: delivery.props.correlation_id.clone(),
                        };
                        tokio::spawn(async move {
                            dispatcher.handle(packet, &reply).await;
                            // ack once handling (and its response stream) is done
                            delivery.ack();
                        });
                    }
                    Err(error) => {
                        tracing::debug!(%error, "discarding malformed packet");
                        delivery.ack();
                    }
                }
            }

            let _ = self.ready.send(false);
            match retry.on_disconnect() {
                ReconnectDecision::Retry { attempt, delay } => {
                    tracing::warn!(attempt, "queue connection lost, reconnecting");
                    tokio::time::sleep(delay).await;
                }
                ReconnectDecision::GiveUp => {
                    return Err(TransportError::ConnectionClosed.into());
                }
            }
        }
    }
}

struct QueueReply {
    conn: Arc<dyn QueueConnection>,
    reply_to: Option<String>,
    correlation_id: Option<String>,
}

#[async_trait]
impl ReplyPublisher for QueueReply {
    async fn publish(&self, packet: ResponsePacket) -> Result<(), StratusError> {
        let Some(reply_to) = &self.reply_to else {
            tracing::warn!(call = %packet.id, "request carries no reply_to, dropping response");
            return Ok(());
        };
        let payload = serde_json::to_vec(&packet)
            .map_err(|e| StratusError::Codec(CodecError::Serialize(e.to_string())))?;
        let props = DeliveryProps {
            reply_to: None,
            correlation_id: self.correlation_id.clone(),
        };
        self.conn
            .publish(reply_to, payload, props)
            .await
            .map_err(StratusError::from)
    }
}

// ---------------------------------------------------------------------------
// In-process reference driver
// ---------------------------------------------------------------------------

struct MemoryQueueState {
    tx: mpsc::UnboundedSender<(Vec<u8>, DeliveryProps)>,
    rx: Option<mpsc::UnboundedReceiver<(Vec<u8>, DeliveryProps)>>,
}

#[derive(Default)]
struct MemoryQueueInner {
    queues: parking_lot::Mutex<HashMap<String, MemoryQueueState>>,
}

/// In-process queue broker used as the reference [`QueueDriver`] and in
/// tests. Queues are single-consumer; publishing declares implicitly.
#[derive(Clone, Default)]
pub struct MemoryQueue {
    inner: Arc<MemoryQueueInner>,
}

impl MemoryQueue {
    /// Create an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn declare_locked(
        queues: &mut HashMap<String, MemoryQueueState>,
        queue: &str,
    ) {
        queues.entry(queue.to_string()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            MemoryQueueState { tx, rx: Some(rx) }
        });
    }
}

#[async_trait]
impl QueueDriver for MemoryQueue {
    async fn connect(&self, _url: &str) -> Result<Arc<dyn QueueConnection>, TransportError> {
        Ok(Arc::new(MemoryQueueConnection {
            inner: Arc::clone(&self.inner),
        }))
    }
}

struct MemoryQueueConnection {
    inner: Arc<MemoryQueueInner>,
}

#[async_trait]
impl QueueConnection for MemoryQueueConnection {
    async fn declare(&self, queue: &str) -> Result<(), TransportError> {
        let mut queues = self.inner.queues.lock();
        MemoryQueue::declare_locked(&mut queues, queue);
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        prefetch: u16,
    ) -> Result<mpsc::UnboundedReceiver<Delivery>, TransportError> {
        let mut backlog = {
            let mut queues = self.inner.queues.lock();
            MemoryQueue::declare_locked(&mut queues, queue);
            let state = queues
                .get_mut(queue)
                .ok_or(TransportError::ConnectionClosed)?;
            state
                .rx
                .take()
                .ok_or_else(|| TransportError::Protocol(format!("queue {queue} already consumed")))?
        };

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let window = Arc::new(Semaphore::new(prefetch.max(1) as usize));
        tokio::spawn(async move {
            loop {
                let Ok(permit) = Arc::clone(&window).acquire_owned().await else {
                    break;
                };
                let Some((payload, props)) = backlog.recv().await else {
                    break;
                };
                let ack: Box<dyn FnOnce() + Send> = Box::new(move || drop(permit));
                if out_tx
                    .send(Delivery::new(payload, props, Some(ack)))
                    .is_err()
                {
                    break;
                }
            }
        });
        Ok(out_rx)
    }

    async fn publish(
        &self,
        queue: &str,
        payload: Vec<u8>,
        props: DeliveryProps,
    ) -> Result<(), TransportError> {
        let mut queues = self.inner.queues.lock();
        MemoryQueue::declare_locked(&mut queues, queue);
        let state = queues.get(queue).ok_or(TransportError::ConnectionClosed)?;
        state
            .tx
            .send((payload, props))
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    fn sum_registry() -> Arc<HandlerRegistry> {
        let mut registry = HandlerRegistry::new();
        registry.on_request("sum", |data: Value| async move {
            let a = data["a"].as_i64().unwrap_or(0);
            let b = data["b"].as_i64().unwrap_or(0);
            Ok(json!(a + b))
        });
        registry.on_request_stream("count", |data: Value| {
            let n = data.as_u64().unwrap_or(0);
            futures::stream::iter((1..=n).map(|i| Ok(json!(i))))
        });
        Arc::new(registry)
    }

    async fn start_server(queue: &MemoryQueue, registry: Arc<HandlerRegistry>) {
        let server = QueueServer::new(QueueConfig::new(), Arc::new(queue.clone()), registry);
        let mut ready = server.ready();
        tokio::spawn(server.run());
        ready.wait_for(|up| *up).await.unwrap();
    }

    #[tokio::test]
    async fn test_request_reply_over_queue() {
        let queue = MemoryQueue::new();
        start_server(&queue, sum_registry()).await;

        let client = QueueClient::new(QueueConfig::new(), Arc::new(queue.clone()));
        let mut stream = client.call("sum", json!({"a": 20, "b": 22})).await.unwrap();

        assert_eq!(stream.next().await.unwrap().unwrap(), json!(42));
        assert!(stream.next().await.is_none());
        assert_eq!(client.pending_calls(), 0);
        client.close().await;
    }

    #[tokio::test]
    async fn test_streaming_over_queue() {
        let queue = MemoryQueue::new();
        start_server(&queue, sum_registry()).await;

        let client = QueueClient::new(QueueConfig::new(), Arc::new(queue.clone()));
        let stream = client.call("count", json!(3)).await.unwrap();
        let values: Vec<_> = stream.map(|item| item.unwrap()).collect().await;

        assert_eq!(values, vec![json!(1), json!(2), json!(3)]);
        client.close().await;
    }

    #[tokio::test]
    async fn test_two_clients_have_distinct_reply_queues() {
        let queue = MemoryQueue::new();
        start_server(&queue, sum_registry()).await;

        let a = QueueClient::new(QueueConfig::new(), Arc::new(queue.clone()));
        let b = QueueClient::new(QueueConfig::new(), Arc::new(queue.clone()));
        assert_ne!(a.reply_queue(), b.reply_queue());

        let mut resp_a = a.call("sum", json!({"a": 1, "b": 0})).await.unwrap();
        let mut resp_b = b.call("sum", json!({"a": 2, "b": 0})).await.unwrap();

        assert_eq!(resp_a.next().await.unwrap().unwrap(), json!(1));
        assert_eq!(resp_b.next().await.unwrap().unwrap(), json!(2));
        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn test_events_are_consumed_without_reply() {
        let queue = MemoryQueue::new();
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();

        let mut registry = HandlerRegistry::new();
        registry.on_event("job_done", move |data: Value| {
            let seen_tx = seen_tx.clone();
            async move {
                let _ = seen_tx.send(data);
                Ok(())
            }
        });
        start_server(&queue, Arc::new(registry)).await;

        let client = QueueClient::new(QueueConfig::new(), Arc::new(queue.clone()));
        client.emit("job_done", json!({"job": 9})).await.unwrap();

        assert_eq!(seen_rx.recv().await.unwrap(), json!({"job": 9}));
        assert_eq!(client.pending_calls(), 0);
        client.close().await;
    }

    #[tokio::test]
    async fn test_prefetch_window_recycles() {
        let queue = MemoryQueue::new();
        start_server(
            &queue,
            sum_registry(),
        )
        .await;

        // prefetch of 1 on the client's reply consumer still drains all
        // responses because every delivery is acknowledged
        let client = QueueClient::new(
            QueueConfig::new().prefetch(1),
            Arc::new(queue.clone()),
        );
        for i in 0..3 {
            let mut stream = client.call("sum", json!({"a": i, "b": 1})).await.unwrap();
            assert_eq!(stream.next().await.unwrap().unwrap(), json!(i + 1));
        }
        client.close().await;
    }

    #[tokio::test]
    async fn test_no_handler_over_queue() {
        let queue = MemoryQueue::new();
        start_server(&queue, sum_registry()).await;

        let client = QueueClient::new(QueueConfig::new(), Arc::new(queue.clone()));
        let mut stream = client.call("missing", json!(null)).await.unwrap();

        assert!(matches!(
            stream.next().await,
            Some(Err(StratusError::Remote(err))) if err == json!(stratus_core::NO_MESSAGE_HANDLER)
        ));
        client.close().await;
    }
}
