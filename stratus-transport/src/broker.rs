//! Pub/sub broker transport.
//!
//! Requests are published on the pattern's channel and answered on the
//! derived reply channel `<pattern>.reply`; the correlation id inside the
//! packet disambiguates calls sharing one reply channel. Reply-channel
//! subscriptions are reference-counted per channel name: they are
//! released only when the last outstanding call using the channel
//! finishes or is cancelled.
//!
//! The adapter is written against the [`PubSubDriver`] seam;
//! [`MemoryBroker`] is the in-process reference driver.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;

use stratus_core::{
    canonical_key, BrokerConfig, CallStream, CodecError, ConnectionState, HandlerRegistry,
    PacketId, ReconnectDecision, RequestPacket, ResponsePacket, RetryState, StratusError,
    TransportError,
};

use crate::dispatch::{Dispatcher, DisposalMode, ReplyPublisher};
use crate::mux::Multiplexer;

/// Derive the reply channel for a canonical pattern key.
///
/// This naming is part of the wire contract between independently
/// deployed client and server processes.
#[must_use]
pub fn reply_channel(pattern_key: &str) -> String {
    format!("{pattern_key}.reply")
}

/// One message delivered by the broker.
#[derive(Debug, Clone)]
pub struct BrokerMessage {
    /// Concrete topic the message was published on.
    pub topic: String,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
}

/// Driver seam over a pub/sub broker library.
#[async_trait]
pub trait PubSubDriver: Send + Sync {
    /// Open a connection; returns the command handle and the inbound
    /// message stream. The stream ending signals connection loss.
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Arc<dyn PubSubConnection>, mpsc::UnboundedReceiver<BrokerMessage>), TransportError>;
}

/// Command half of one broker connection.
#[async_trait]
pub trait PubSubConnection: Send + Sync {
    /// Publish a payload on a topic.
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: u8) -> Result<(), TransportError>;

    /// Subscribe to a topic filter (wildcards allowed). Subscribing to an
    /// already-subscribed filter is a no-op.
    async fn subscribe(&self, filter: &str, qos: u8) -> Result<(), TransportError>;

    /// Drop a subscription.
    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError>;

    /// Close the connection.
    async fn close(&self);
}

#[derive(Clone)]
struct BrokerConn {
    conn: Arc<dyn PubSubConnection>,
    alive: Arc<AtomicBool>,
}

struct BrokerClientInner {
    config: BrokerConfig,
    driver: Arc<dyn PubSubDriver>,
    mux: Arc<Multiplexer>,
    conn: tokio::sync::Mutex<Option<BrokerConn>>,
    /// Reply channel name -> number of outstanding calls using it.
    subs: DashMap<String, usize>,
    retry: parking_lot::Mutex<RetryState>,
    closed: AtomicBool,
}

/// Client over a pub/sub broker.
#[derive(Clone)]
pub struct BrokerClient {
    inner: Arc<BrokerClientInner>,
}

impl BrokerClient {
    /// Create a client over the given driver. Nothing connects until the
    /// first call or an explicit [`connect`](Self::connect).
    #[must_use]
    pub fn new(config: BrokerConfig, driver: Arc<dyn PubSubDriver>) -> Self {
        let retry = RetryState::new(config.retry);
        Self {
            inner: Arc::new(BrokerClientInner {
                config,
                driver,
                mux: Arc::new(Multiplexer::new()),
                conn: tokio::sync::Mutex::new(None),
                subs: DashMap::new(),
                retry: parking_lot::Mutex::new(retry),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Open the broker connection if it is not already open (idempotent).
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

        let conn = BrokerClientInner::establish(&self.inner).await?;
        *guard = Some(conn);
        self.inner.retry.lock().on_connected();
        Ok(())
    }

    /// Send a request and return its result stream.
    ///
    /// The reply-channel subscription is established before the request
    /// is published (sub-then-publish handshake) and shared with other
    /// outstanding calls on the same pattern.
    pub async fn call(
        &self,
        pattern: impl Into<Value>,
        data: Value,
    ) -> Result<CallStream, StratusError> {
        self.connect().await?;

        let pattern = pattern.into();
        let key = canonical_key(&pattern);
        let reply = reply_channel(&key);

        self.acquire_subscription(&reply).await?;

        let id = PacketId::random();
        let release: stratus_core::ReleaseHook = {
            let inner = Arc::clone(&self.inner);
            let reply = reply.clone();
            Box::new(move || BrokerClientInner::release_subscription(&inner, &reply))
        };
        let stream = self.inner.mux.register(&id, Some(release));

        let packet = RequestPacket::request(pattern, data, id.clone());
        if let Err(error) = self.publish_packet(&key, &packet).await {
            // removal runs the release hook, dropping the refcount we took
            self.inner.mux.remove(id.as_str());
            return Err(error);
        }
        Ok(stream.with_timeout(self.inner.config.request_timeout))
    }

    /// Publish a fire-and-forget event on the pattern's channel.
    pub async fn emit(&self, pattern: impl Into<Value>, data: Value) -> Result<(), StratusError> {
        self.connect().await?;
        let pattern = pattern.into();
        let key = canonical_key(&pattern);
        self.publish_packet(&key, &RequestPacket::event(pattern, data))
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

    async fn publish_packet(&self, topic: &str, packet: &RequestPacket) -> Result<(), StratusError> {
        let payload = serde_json::to_vec(packet)
            .map_err(|e| StratusError::Codec(CodecError::Serialize(e.to_string())))?;
        let conn = self.current_conn().await?;
        conn.conn
            .publish(topic, payload, self.inner.config.qos)
            .await
            .map_err(StratusError::from)
    }

    async fn current_conn(&self) -> Result<BrokerConn, StratusError> {
        self.inner
            .conn
            .lock()
            .await
            .clone()
            .ok_or_else(|| TransportError::NotConnected.into())
    }

    async fn acquire_subscription(&self, channel: &str) -> Result<(), StratusError> {
        {
            let mut count = self.inner.subs.entry(channel.to_string()).or_insert(0);
            *count += 1;
        }

        // the driver treats repeat subscriptions as no-ops, so awaiting
        // here gives every call the sub-then-publish ordering guarantee
        let conn = self.current_conn().await?;
        if let Err(error) = conn
            .conn
            .subscribe(channel, self.inner.config.qos)
            .await
        {
            BrokerClientInner::release_subscription(&self.inner, channel);
            return Err(TransportError::SubscribeFailed(error.to_string()).into());
        }
        Ok(())
    }
}

impl BrokerClientInner {
    async fn establish(inner: &Arc<Self>) -> Result<BrokerConn, StratusError> {
        let (conn, rx) = inner
            .driver
            .connect(&inner.config.url)
            .await
            .map_err(StratusError::from)?;
        tracing::debug!(url = %inner.config.url, "broker connection established");

        let alive = Arc::new(AtomicBool::new(true));
        let conn = BrokerConn { conn, alive };
        tokio::spawn(Self::inbound_loop(Arc::clone(inner), conn.clone(), rx));
        Ok(conn)
    }

    async fn inbound_loop(
        inner: Arc<Self>,
        conn: BrokerConn,
        mut rx: mpsc::UnboundedReceiver<BrokerMessage>,
    ) {
        while let Some(msg) = rx.recv().await {
            match serde_json::from_slice::<ResponsePacket>(&msg.payload) {
                Ok(packet) => inner.mux.dispatch(packet),
                Err(error) => {
                    tracing::debug!(topic = %msg.topic, %error, "ignoring malformed reply")
                }
            }
        }

        conn.alive.store(false, Ordering::SeqCst);
        inner.mux.fail_all(&TransportError::ConnectionClosed);
        if !inner.closed.load(Ordering::SeqCst) {
            tracing::debug!("broker connection lost");
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
                                // restore subscriptions still referenced by live calls
                                let channels: Vec<String> =
                                    inner.subs.iter().map(|e| e.key().clone()).collect();
                                for channel in channels {
                                    if let Err(error) =
                                        conn.conn.subscribe(&channel, inner.config.qos).await
                                    {
                                        tracing::warn!(%channel, %error, "resubscribe failed");
                                    }
                                }
                                *guard = Some(conn);
                                inner.retry.lock().on_connected();
                                tracing::info!(attempt, "reconnected to broker");
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

    /// Drop one reference on a reply-channel subscription, releasing the
    /// driver-side subscription when the count reaches zero.
    fn release_subscription(inner: &Arc<Self>, channel: &str) {
        let mut last = false;
        if let Some(mut count) = inner.subs.get_mut(channel) {
            *count = count.saturating_sub(1);
            last = *count == 0;
        }
        if !last {
            return;
        }
        inner.subs.remove_if(channel, |_, count| *count == 0);

        let inner = Arc::clone(inner);
        let channel = channel.to_string();
        tokio::spawn(async move {
            let conn = inner.conn.lock().await.clone();
            if let Some(conn) = conn {
                if let Err(error) = conn.conn.unsubscribe(&channel).await {
                    tracing::debug!(%channel, %error, "unsubscribe failed");
                }
            }
        });
    }
}

/// Server over a pub/sub broker: subscribes to every registered pattern
/// and streams responses back on the derived reply channels.
pub struct BrokerServer {
    config: BrokerConfig,
    driver: Arc<dyn PubSubDriver>,
    dispatcher: Arc<Dispatcher>,
    ready: tokio::sync::watch::Sender<bool>,
}

impl BrokerServer {
    /// Create a server over the given driver and registry.
    #[must_use]
    pub fn new(
        config: BrokerConfig,
        driver: Arc<dyn PubSubDriver>,
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

    /// Observe when the server has an active connection with all pattern
    /// subscriptions in place.
    #[must_use]
    pub fn ready(&self) -> tokio::sync::watch::Receiver<bool> {
        self.ready.subscribe()
    }

    /// Serve until the connection is lost beyond the retry budget.
    pub async fn run(self) -> Result<(), StratusError> {
        let mut retry = RetryState::new(self.config.retry);

        loop {
            let (conn, mut rx) = match self.driver.connect(&self.config.url).await {
                Ok(pair) => pair,
                Err(error) => match retry.on_disconnect() {
                    ReconnectDecision::Retry { attempt, delay } => {
                        tracing::warn!(attempt, %error, "broker connect failed, retrying");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    ReconnectDecision::GiveUp => return Err(error.into()),
                },
            };
            retry.on_connected();

            for (key, _kind) in self.dispatcher.registry().patterns() {
                conn.subscribe(key, self.config.qos)
                    .await
                    .map_err(|e| TransportError::SubscribeFailed(e.to_string()))?;
            }
            let _ = self.ready.send(true);
            tracing::info!(url = %self.config.url, "listening on broker");

            while let Some(msg) = rx.recv().await {
                match serde_json::from_slice::<RequestPacket>(&msg.payload) {
                    Ok(packet) => {
                        let dispatcher = Arc::clone(&self.dispatcher);
                        let reply = BrokerReply {
                            conn: Arc::clone(&conn),
                            channel: reply_channel(&canonical_key(&packet.pattern)),
                            qos: self.config.qos,
                        };
                        tokio::spawn(async move {
                            dispatcher.handle(packet, &reply).await;
                        });
                    }
                    Err(error) => {
                        tracing::debug!(topic = %msg.topic, %error, "ignoring malformed packet")
                    }
                }
            }

            let _ = self.ready.send(false);
            match retry.on_disconnect() {
                ReconnectDecision::Retry { attempt, delay } => {
                    tracing::warn!(attempt, "broker connection lost, reconnecting");
                    tokio::time::sleep(delay).await;
                }
                ReconnectDecision::GiveUp => {
                    return Err(TransportError::ConnectionClosed.into());
                }
            }
        }
    }
}

struct BrokerReply {
    conn: Arc<dyn PubSubConnection>,
    channel: String,
    qos: u8,
}

#[async_trait]
impl ReplyPublisher for BrokerReply {
    async fn publish(&self, packet: ResponsePacket) -> Result<(), StratusError> {
        let payload = serde_json::to_vec(&packet)
            .map_err(|e| StratusError::Codec(CodecError::Serialize(e.to_string())))?;
        self.conn
            .publish(&self.channel, payload, self.qos)
            .await
            .map_err(StratusError::from)
    }
}

// ---------------------------------------------------------------------------
// In-process reference driver
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryBrokerInner {
    sessions: parking_lot::Mutex<HashMap<u64, MemorySession>>,
    next_id: AtomicU64,
}

struct MemorySession {
    filters: HashSet<String>,
    tx: mpsc::UnboundedSender<BrokerMessage>,
}

/// In-process broker with topic wildcard support, used as the reference
/// [`PubSubDriver`] and in tests.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<MemoryBrokerInner>,
}

impl MemoryBroker {
    /// Create an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Check whether any session subscribes to exactly this filter.
    #[must_use]
    pub fn has_subscription(&self, filter: &str) -> bool {
        self.inner
            .sessions
            .lock()
            .values()
            .any(|s| s.filters.contains(filter))
    }
}

struct MemoryConnection {
    broker: Arc<MemoryBrokerInner>,
    session: u64,
}

#[async_trait]
impl PubSubDriver for MemoryBroker {
    async fn connect(
        &self,
        _url: &str,
    ) -> Result<(Arc<dyn PubSubConnection>, mpsc::UnboundedReceiver<BrokerMessage>), TransportError>
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.sessions.lock().insert(
            session,
            MemorySession {
                filters: HashSet::new(),
                tx,
            },
        );
        let conn = MemoryConnection {
            broker: Arc::clone(&self.inner),
            session,
        };
        Ok((Arc::new(conn), rx))
    }
}

#[async_trait]
impl PubSubConnection for MemoryConnection {
    async fn publish(&self, topic: &str, payload: Vec<u8>, _qos: u8) -> Result<(), TransportError> {
        let sessions = self.broker.sessions.lock();
        for session in sessions.values() {
            if session
                .filters
                .iter()
                .any(|f| stratus_core::topic_matches(f, topic))
            {
                let _ = session.tx.send(BrokerMessage {
                    topic: topic.to_string(),
                    payload: payload.clone(),
                });
            }
        }
        Ok(())
    }

    async fn subscribe(&self, filter: &str, _qos: u8) -> Result<(), TransportError> {
        let mut sessions = self.broker.sessions.lock();
        let session = sessions
            .get_mut(&self.session)
            .ok_or(TransportError::ConnectionClosed)?;
        session.filters.insert(filter.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError> {
        let mut sessions = self.broker.sessions.lock();
        let session = sessions
            .get_mut(&self.session)
            .ok_or(TransportError::ConnectionClosed)?;
        session.filters.remove(filter);
        Ok(())
    }

    async fn close(&self) {
        self.broker.sessions.lock().remove(&self.session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;
    use stratus_core::RetryPolicy;

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

    async fn start_server(broker: &MemoryBroker, registry: Arc<HandlerRegistry>) {
        let server = BrokerServer::new(BrokerConfig::new(), Arc::new(broker.clone()), registry);
        let mut ready = server.ready();
        tokio::spawn(server.run());
        ready.wait_for(|up| *up).await.unwrap();
    }

    #[tokio::test]
    async fn test_request_reply_over_broker() {
        let broker = MemoryBroker::new();
        start_server(&broker, sum_registry()).await;

        let client = BrokerClient::new(BrokerConfig::new(), Arc::new(broker.clone()));
        let mut stream = client.call("sum", json!({"a": 4, "b": 5})).await.unwrap();

        assert_eq!(stream.next().await.unwrap().unwrap(), json!(9));
        assert!(stream.next().await.is_none());
        client.close().await;
    }

    #[tokio::test]
    async fn test_streaming_uses_explicit_disposal() {
        let broker = MemoryBroker::new();
        start_server(&broker, sum_registry()).await;

        let client = BrokerClient::new(BrokerConfig::new(), Arc::new(broker.clone()));
        let stream = client.call("count", json!(3)).await.unwrap();
        let values: Vec<_> = stream.map(|item| item.unwrap()).collect().await;

        assert_eq!(values, vec![json!(1), json!(2), json!(3)]);
        client.close().await;
    }

    #[tokio::test]
    async fn test_reply_subscription_refcounted() {
        let broker = MemoryBroker::new();

        let mut registry = HandlerRegistry::new();
        registry.on_request("hold", |_| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(json!(null))
        });
        start_server(&broker, Arc::new(registry)).await;

        let client = BrokerClient::new(BrokerConfig::new(), Arc::new(broker.clone()));
        let first = client.call("hold", json!(1)).await.unwrap();
        let second = client.call("hold", json!(2)).await.unwrap();
        assert!(broker.has_subscription("hold.reply"));

        // one of two live calls gone: the shared subscription survives
        first.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(broker.has_subscription("hold.reply"));

        // last call gone: the subscription is released
        second.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!broker.has_subscription("hold.reply"));
        client.close().await;
    }

    #[tokio::test]
    async fn test_wildcard_event_routing() {
        let broker = MemoryBroker::new();
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();

        let mut registry = HandlerRegistry::new();
        registry.on_event("sensors/+/temp", move |data: Value| {
            let seen_tx = seen_tx.clone();
            async move {
                let _ = seen_tx.send(data);
                Ok(())
            }
        });
        start_server(&broker, Arc::new(registry)).await;

        let client = BrokerClient::new(BrokerConfig::new(), Arc::new(broker.clone()));
        client
            .emit("sensors/kitchen/temp", json!(21.5))
            .await
            .unwrap();

        assert_eq!(seen_rx.recv().await.unwrap(), json!(21.5));
        assert_eq!(client.pending_calls(), 0);
        client.close().await;
    }

    #[tokio::test]
    async fn test_no_handler_over_broker() {
        let broker = MemoryBroker::new();
        start_server(&broker, sum_registry()).await;

        let client = BrokerClient::new(BrokerConfig::new(), Arc::new(broker.clone()));
        let mut stream = client.call("missing", json!(null)).await.unwrap();

        assert!(matches!(
            stream.next().await,
            Some(Err(StratusError::Remote(err))) if err == json!(stratus_core::NO_MESSAGE_HANDLER)
        ));
        client.close().await;
    }

    /// Driver whose connections always fail, counting the attempts.
    struct FailingDriver {
        attempts: Arc<AtomicU32>,
    }

    #[async_trait]
    impl PubSubDriver for FailingDriver {
        async fn connect(
            &self,
            _url: &str,
        ) -> Result<
            (Arc<dyn PubSubConnection>, mpsc::UnboundedReceiver<BrokerMessage>),
            TransportError,
        > {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::ConnectionFailed("refused".into()))
        }
    }

    #[tokio::test]
    async fn test_retry_budget_is_exact() {
        let attempts = Arc::new(AtomicU32::new(0));
        let driver = FailingDriver {
            attempts: Arc::clone(&attempts),
        };
        let server = BrokerServer::new(
            BrokerConfig::new().retry(RetryPolicy::new().attempts(3).delay(Duration::ZERO)),
            Arc::new(driver),
            Arc::new(HandlerRegistry::new()),
        );

        let result = server.run().await;
        assert!(result.is_err());
        // one initial connect plus exactly three scheduled retries
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }
}
