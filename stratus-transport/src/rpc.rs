//! RPC transport with native streaming calls.
//!
//! The native library boundary hands us a hierarchical service descriptor
//! tree; it is flattened exactly once at startup into fully-qualified
//! `(name, descriptor)` pairs. Each native call is a duplex pair of frame
//! streams plus a cancellation signal: server-streaming methods pump the
//! handler's output into the native call until completion or cancellation,
//! duplex methods additionally adapt the inbound native stream into a
//! push-based input stream for the handler. Cancellation on either side is
//! a clean termination, never an application error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Notify};

use stratus_core::{
    call_channel, canonical_key, CallStream, HandlerOutput, HandlerRegistry, MessageHandler,
    RpcClientConfig, StratusError, TransportError, NO_MESSAGE_HANDLER,
};

/// Streaming shape of one method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    /// Method name within its service.
    pub name: String,
    /// Whether the caller sends a request stream.
    pub client_streaming: bool,
    /// Whether the method responds with a stream.
    pub server_streaming: bool,
}

impl MethodDescriptor {
    /// A request/response method.
    #[must_use]
    pub fn unary(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            client_streaming: false,
            server_streaming: false,
        }
    }

    /// A method responding with a stream.
    #[must_use]
    pub fn server_streaming(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            client_streaming: false,
            server_streaming: true,
        }
    }

    /// A bidirectional streaming method.
    #[must_use]
    pub fn duplex(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            client_streaming: true,
            server_streaming: true,
        }
    }
}

/// One service with its methods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    /// Methods exposed by the service.
    pub methods: Vec<MethodDescriptor>,
}

/// Node of the descriptor tree returned by the external proto loader.
#[derive(Debug, Clone)]
pub enum DescriptorNode {
    /// A namespace grouping nested nodes by name.
    Namespace(Vec<(String, DescriptorNode)>),
    /// A service leaf.
    Service(ServiceDescriptor),
}

/// Flatten a descriptor tree into `(fully-qualified name, service)` pairs.
///
/// Namespace traversal happens once at startup, never per call.
#[must_use]
pub fn flatten_services(root: &DescriptorNode) -> Vec<(String, ServiceDescriptor)> {
    let mut out = Vec::new();
    let mut path = Vec::new();
    walk(root, &mut path, &mut out);
    out
}

fn walk<'a>(
    node: &'a DescriptorNode,
    path: &mut Vec<&'a str>,
    out: &mut Vec<(String, ServiceDescriptor)>,
) {
    match node {
        DescriptorNode::Service(service) => out.push((path.join("."), service.clone())),
        DescriptorNode::Namespace(children) => {
            for (name, child) in children {
                path.push(name);
                walk(child, path, out);
                path.pop();
            }
        }
    }
}

#[derive(Default)]
struct CancelInner {
    flag: AtomicBool,
    notify: Notify,
}

/// Cooperative cancellation signal shared by both ends of a native call.
#[derive(Clone, Default)]
pub struct CancelSignal {
    inner: Arc<CancelInner>,
}

impl CancelSignal {
    /// Create an untriggered signal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Trigger cancellation; idempotent.
    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Check without waiting.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Wait until cancellation is triggered.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.inner.flag.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

/// Write half of a native call.
#[async_trait]
pub trait CallWriter: Send {
    /// Send one frame.
    async fn send(&mut self, value: Value) -> Result<(), TransportError>;

    /// Terminate the call with an error frame.
    async fn fail(&mut self, err: Value) -> Result<(), TransportError>;

    /// Terminate the call normally.
    async fn finish(&mut self) -> Result<(), TransportError>;
}

/// One native call handle: inbound frames, outbound writer, cancellation.
///
/// The call handle itself is the multiplexing key; no correlation ids are
/// needed on this transport.
pub struct NativeCall {
    /// Fully-qualified `service/method` name.
    pub method: String,
    /// Frames arriving from the peer; `Err` carries a remote failure and
    /// the channel closing marks the end of the peer's stream.
    pub inbound: mpsc::UnboundedReceiver<Result<Value, Value>>,
    /// Frames going to the peer.
    pub outbound: Box<dyn CallWriter>,
    /// Cancellation shared with the peer.
    pub cancel: CancelSignal,
}

/// Handler for duplex methods: consumes the inbound stream, produces the
/// outbound one.
pub type DuplexHandler =
    Arc<dyn Fn(BoxStream<'static, Value>) -> BoxStream<'static, Result<Value, Value>> + Send + Sync>;

enum MethodBinding {
    Unary(MessageHandler),
    ServerStreaming(MessageHandler),
    Duplex(DuplexHandler),
}

/// Server routing native calls to handlers by flattened method name.
pub struct RpcServer {
    methods: HashMap<String, MethodBinding>,
}

impl RpcServer {
    /// Bind every unary and server-streaming method of the descriptor tree
    /// against the registry. Handlers are looked up under the structured
    /// pattern `{method, service}`; methods with a request stream are
    /// attached separately via [`bind_duplex`](Self::bind_duplex).
    #[must_use]
    pub fn bind(root: &DescriptorNode, registry: &HandlerRegistry) -> Self {
        let mut methods = HashMap::new();
        for (service_name, service) in flatten_services(root) {
            for method in &service.methods {
                let full = format!("{service_name}/{}", method.name);
                if method.client_streaming {
                    continue;
                }
                let key = canonical_key(&json!({
                    "method": method.name,
                    "service": service_name,
                }));
                match registry.get_request(&key) {
                    Some(entry) => {
                        let handler = Arc::clone(&entry.handler);
                        let binding = if method.server_streaming {
                            MethodBinding::ServerStreaming(handler)
                        } else {
                            MethodBinding::Unary(handler)
                        };
                        methods.insert(full, binding);
                    }
                    None => {
                        tracing::warn!(method = %full, "no handler registered for rpc method");
                    }
                }
            }
        }
        Self { methods }
    }

    /// Attach a duplex handler under `service/method`.
    pub fn bind_duplex<F, S>(&mut self, service: &str, method: &str, handler: F) -> &mut Self
    where
        F: Fn(BoxStream<'static, Value>) -> S + Send + Sync + 'static,
        S: futures::Stream<Item = Result<Value, Value>> + Send + 'static,
    {
        let handler: DuplexHandler = Arc::new(move |input| handler(input).boxed());
        self.methods.insert(
            format!("{service}/{method}"),
            MethodBinding::Duplex(handler),
        );
        self
    }

    /// Names of all bound methods.
    pub fn methods(&self) -> impl Iterator<Item = &str> + '_ {
        self.methods.keys().map(String::as_str)
    }

    /// Serve one native call to completion.
    pub async fn serve(&self, call: NativeCall) {
        let NativeCall {
            method,
            mut inbound,
            mut outbound,
            cancel,
        } = call;

        let Some(binding) = self.methods.get(&method) else {
            tracing::warn!(%method, "no handler bound for rpc method");
            let _ = outbound.fail(Value::String(NO_MESSAGE_HANDLER.into())).await;
            return;
        };

        match binding {
            MethodBinding::Unary(handler) => {
                let Some(request) = read_request(&mut inbound).await else {
                    return;
                };
                match handler(request).await {
                    Err(err) => {
                        let _ = outbound.fail(err).await;
                    }
                    Ok(HandlerOutput::Value(value)) => {
                        if outbound.send(value).await.is_ok() {
                            let _ = outbound.finish().await;
                        }
                    }
                    Ok(HandlerOutput::Stream(mut stream)) => match stream.next().await {
                        Some(Ok(value)) => {
                            if outbound.send(value).await.is_ok() {
                                let _ = outbound.finish().await;
                            }
                        }
                        Some(Err(err)) => {
                            let _ = outbound.fail(err).await;
                        }
                        None => {
                            let _ = outbound.finish().await;
                        }
                    },
                }
            }
            MethodBinding::ServerStreaming(handler) => {
                let Some(request) = read_request(&mut inbound).await else {
                    return;
                };
                match handler(request).await {
                    Err(err) => {
                        let _ = outbound.fail(err).await;
                    }
                    Ok(HandlerOutput::Value(value)) => {
                        if outbound.send(value).await.is_ok() {
                            let _ = outbound.finish().await;
                        }
                    }
                    Ok(HandlerOutput::Stream(stream)) => {
                        pump_outbound(&method, stream, &mut outbound, &cancel).await;
                    }
                }
            }
            MethodBinding::Duplex(handler) => {
                let (in_tx, in_rx) = mpsc::unbounded_channel::<Value>();
                let inbound_cancel = cancel.clone();
                let inbound_pump = tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            biased;
                            () = inbound_cancel.cancelled() => break,
                            item = inbound.recv() => match item {
                                Some(Ok(value)) => {
                                    if in_tx.send(value).is_err() {
                                        break;
                                    }
                                }
                                Some(Err(_)) | None => break,
                            },
                        }
                    }
                });

                let input = futures::stream::unfold(in_rx, |mut rx| async move {
                    rx.recv().await.map(|value| (value, rx))
                })
                .boxed();
                let output = handler(input);
                pump_outbound(&method, output, &mut outbound, &cancel).await;
                inbound_pump.abort();
            }
        }
    }
}

/// Forward a handler's output stream to the native call, honoring the
/// cancellation signal by stopping the pump early.
async fn pump_outbound(
    method: &str,
    mut stream: BoxStream<'static, Result<Value, Value>>,
    outbound: &mut Box<dyn CallWriter>,
    cancel: &CancelSignal,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                tracing::debug!(%method, "call cancelled, stopping stream pump");
                return;
            }
            item = stream.next() => match item {
                Some(Ok(value)) => {
                    if outbound.send(value).await.is_err() {
                        return;
                    }
                }
                Some(Err(err)) => {
                    let _ = outbound.fail(err).await;
                    return;
                }
                None => {
                    let _ = outbound.finish().await;
                    return;
                }
            },
        }
    }
}

async fn read_request(
    inbound: &mut mpsc::UnboundedReceiver<Result<Value, Value>>,
) -> Option<Value> {
    match inbound.recv().await {
        Some(Ok(value)) => Some(value),
        Some(Err(_)) | None => None,
    }
}

/// Driver seam opening native calls toward a remote server.
#[async_trait]
pub trait RpcChannel: Send + Sync {
    /// Start a call to the given `service/method`.
    async fn start_call(&self, method: &str) -> Result<NativeCall, TransportError>;
}

/// Client over a native streaming-RPC channel.
pub struct RpcClient {
    config: RpcClientConfig,
    methods: HashMap<String, MethodDescriptor>,
    channel: Arc<dyn RpcChannel>,
}

impl RpcClient {
    /// Create a client; the descriptor tree is flattened once here.
    #[must_use]
    pub fn new(
        config: RpcClientConfig,
        root: &DescriptorNode,
        channel: Arc<dyn RpcChannel>,
    ) -> Self {
        let mut methods = HashMap::new();
        for (service_name, service) in flatten_services(root) {
            for method in service.methods {
                methods.insert(format!("{service_name}/{}", method.name), method);
            }
        }
        Self {
            config,
            methods,
            channel,
        }
    }

    /// Call a unary or server-streaming method.
    ///
    /// Dropping the returned stream cancels the native call.
    pub async fn call(
        &self,
        service: &str,
        method: &str,
        payload: Value,
    ) -> Result<CallStream, StratusError> {
        let full = self.lookup(service, method)?;
        let mut call = self.channel.start_call(&full).await?;
        call.outbound.send(payload).await?;
        call.outbound.finish().await?;
        Ok(self.adapt(call))
    }

    /// Call a client-streaming or duplex method with an input stream.
    pub async fn call_streaming(
        &self,
        service: &str,
        method: &str,
        input: impl futures::Stream<Item = Value> + Send + 'static,
    ) -> Result<CallStream, StratusError> {
        let full = self.lookup(service, method)?;
        let call = self.channel.start_call(&full).await?;

        let NativeCall {
            method: full,
            inbound,
            mut outbound,
            cancel,
        } = call;
        let pump_cancel = cancel.clone();
        let mut input = Box::pin(input);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = pump_cancel.cancelled() => break,
                    item = input.next() => match item {
                        Some(value) => {
                            if outbound.send(value).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            let _ = outbound.finish().await;
                            break;
                        }
                    },
                }
            }
        });

        Ok(self.adapt_parts(full, inbound, cancel))
    }

    fn lookup(&self, service: &str, method: &str) -> Result<String, StratusError> {
        let full = format!("{service}/{method}");
        if !self.methods.contains_key(&full) {
            return Err(TransportError::Protocol(format!("unknown method {full}")).into());
        }
        Ok(full)
    }

    fn adapt(&self, call: NativeCall) -> CallStream {
        let NativeCall {
            method,
            inbound,
            outbound,
            cancel,
        } = call;
        drop(outbound);
        self.adapt_parts(method, inbound, cancel)
    }

    fn adapt_parts(
        &self,
        method: String,
        mut inbound: mpsc::UnboundedReceiver<Result<Value, Value>>,
        cancel: CancelSignal,
    ) -> CallStream {
        let release_cancel = cancel.clone();
        let (sink, stream) = call_channel(Some(Box::new(move || release_cancel.cancel())));

        tokio::spawn(async move {
            while let Some(item) = inbound.recv().await {
                match item {
                    Ok(value) => sink.value(value),
                    Err(err) => {
                        sink.error(StratusError::Remote(err));
                        return;
                    }
                }
            }
            tracing::trace!(%method, "native call finished");
            sink.complete();
        });

        stream.with_timeout(self.config.request_timeout)
    }
}

// ---------------------------------------------------------------------------
// In-process reference driver
// ---------------------------------------------------------------------------

struct ChannelWriter {
    tx: Option<mpsc::UnboundedSender<Result<Value, Value>>>,
}

#[async_trait]
impl CallWriter for ChannelWriter {
    async fn send(&mut self, value: Value) -> Result<(), TransportError> {
        match &self.tx {
            Some(tx) => tx
                .send(Ok(value))
                .map_err(|_| TransportError::ConnectionClosed),
            None => Err(TransportError::ConnectionClosed),
        }
    }

    async fn fail(&mut self, err: Value) -> Result<(), TransportError> {
        let tx = self.tx.take().ok_or(TransportError::ConnectionClosed)?;
        tx.send(Err(err)).map_err(|_| TransportError::ConnectionClosed)
    }

    async fn finish(&mut self) -> Result<(), TransportError> {
        self.tx.take();
        Ok(())
    }
}

/// In-process channel pairing a client with an [`RpcServer`]; each call
/// spawns a server task wired up over native frame channels.
pub struct MemoryRpcLink {
    server: Arc<RpcServer>,
}

impl MemoryRpcLink {
    /// Link calls to the given server.
    #[must_use]
    pub fn new(server: Arc<RpcServer>) -> Self {
        Self { server }
    }
}

#[async_trait]
impl RpcChannel for MemoryRpcLink {
    async fn start_call(&self, method: &str) -> Result<NativeCall, TransportError> {
        let (client_tx, server_rx) = mpsc::unbounded_channel();
        let (server_tx, client_rx) = mpsc::unbounded_channel();
        let cancel = CancelSignal::new();

        let server_call = NativeCall {
            method: method.to_string(),
            inbound: server_rx,
            outbound: Box::new(ChannelWriter {
                tx: Some(server_tx),
            }),
            cancel: cancel.clone(),
        };
        let server = Arc::clone(&self.server);
        tokio::spawn(async move {
            server.serve(server_call).await;
        });

        Ok(NativeCall {
            method: method.to_string(),
            inbound: client_rx,
            outbound: Box::new(ChannelWriter {
                tx: Some(client_tx),
            }),
            cancel,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::sync::atomic::AtomicU64;
    use std::time::Duration;

    fn math_tree() -> DescriptorNode {
        DescriptorNode::Namespace(vec![(
            "math".into(),
            DescriptorNode::Namespace(vec![
                (
                    "Calculator".into(),
                    DescriptorNode::Service(ServiceDescriptor {
                        methods: vec![
                            MethodDescriptor::unary("Add"),
                            MethodDescriptor::server_streaming("CountTo"),
                            MethodDescriptor::duplex("RunningSum"),
                        ],
                    }),
                ),
                (
                    "Rng".into(),
                    DescriptorNode::Service(ServiceDescriptor {
                        methods: vec![MethodDescriptor::unary("Next")],
                    }),
                ),
            ]),
        )])
    }

    fn math_registry() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry.on_request(
            json!({"service": "math.Calculator", "method": "Add"}),
            |data: Value| async move {
                let a = data["a"].as_i64().unwrap_or(0);
                let b = data["b"].as_i64().unwrap_or(0);
                Ok(json!(a + b))
            },
        );
        registry.on_request_stream(
            json!({"service": "math.Calculator", "method": "CountTo"}),
            |data: Value| {
                let n = data.as_u64().unwrap_or(0);
                futures::stream::iter((1..=n).map(|i| Ok(json!(i))))
            },
        );
        registry.on_request(
            json!({"service": "math.Rng", "method": "Next"}),
            |_| async { Ok(json!(4)) },
        );
        registry
    }

    fn client_for(server: RpcServer) -> RpcClient {
        RpcClient::new(
            RpcClientConfig::new(),
            &math_tree(),
            Arc::new(MemoryRpcLink::new(Arc::new(server))),
        )
    }

    #[test]
    fn test_flattening_traverses_namespaces() {
        let flat = flatten_services(&math_tree());
        let names: Vec<&str> = flat.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["math.Calculator", "math.Rng"]);
        assert_eq!(flat[0].1.methods.len(), 3);
    }

    #[tokio::test]
    async fn test_unary_call() {
        let server = RpcServer::bind(&math_tree(), &math_registry());
        let client = client_for(server);

        let mut stream = client
            .call("math.Calculator", "Add", json!({"a": 19, "b": 23}))
            .await
            .unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), json!(42));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_server_streaming() {
        let server = RpcServer::bind(&math_tree(), &math_registry());
        let client = client_for(server);

        let stream = client
            .call("math.Calculator", "CountTo", json!(4))
            .await
            .unwrap();
        let values: Vec<_> = stream.map(|item| item.unwrap()).collect().await;
        assert_eq!(values, vec![json!(1), json!(2), json!(3), json!(4)]);
    }

    #[tokio::test]
    async fn test_cancellation_stops_server_pump() {
        let emitted = Arc::new(AtomicU64::new(0));
        let mut registry = HandlerRegistry::new();
        let emitted_in_handler = Arc::clone(&emitted);
        registry.on_request_stream(
            json!({"service": "math.Calculator", "method": "CountTo"}),
            move |_| {
                let emitted = Arc::clone(&emitted_in_handler);
                futures::stream::unfold(0u64, move |i| {
                    let emitted = Arc::clone(&emitted);
                    async move {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        emitted.fetch_add(1, Ordering::SeqCst);
                        Some((Ok(json!(i)), i + 1))
                    }
                })
            },
        );
        let server = RpcServer::bind(&math_tree(), &registry);
        let client = client_for(server);

        let mut stream = client
            .call("math.Calculator", "CountTo", json!(null))
            .await
            .unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), json!(0));
        drop(stream);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let after_cancel = emitted.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(emitted.load(Ordering::SeqCst), after_cancel);
    }

    #[tokio::test]
    async fn test_duplex_running_sum() {
        let mut server = RpcServer::bind(&math_tree(), &math_registry());
        server.bind_duplex("math.Calculator", "RunningSum", |input| {
            input.scan(0i64, |acc, value: Value| {
                *acc += value.as_i64().unwrap_or(0);
                futures::future::ready(Some(Ok(json!(*acc))))
            })
        });
        let client = client_for(server);

        let stream = client
            .call_streaming(
                "math.Calculator",
                "RunningSum",
                futures::stream::iter(vec![json!(1), json!(2), json!(3)]),
            )
            .await
            .unwrap();
        let values: Vec<_> = stream.map(|item| item.unwrap()).collect().await;
        assert_eq!(values, vec![json!(1), json!(3), json!(6)]);
    }

    #[tokio::test]
    async fn test_unbound_method_fails_with_handler_error() {
        // Rng/Next is in the tree but absent from this registry
        let server = RpcServer::bind(&math_tree(), &HandlerRegistry::new());
        let client = client_for(server);

        let mut stream = client
            .call("math.Rng", "Next", json!(null))
            .await
            .unwrap();
        assert!(matches!(
            stream.next().await,
            Some(Err(StratusError::Remote(err))) if err == json!(NO_MESSAGE_HANDLER)
        ));
    }

    #[tokio::test]
    async fn test_unknown_method_rejected_locally() {
        let server = RpcServer::bind(&math_tree(), &math_registry());
        let client = client_for(server);

        let result = client.call("math.Missing", "Nope", json!(null)).await;
        assert!(matches!(
            result,
            Err(StratusError::Transport(TransportError::Protocol(_)))
        ));
    }

    #[tokio::test]
    async fn test_handler_error_surfaces_as_remote() {
        let mut registry = HandlerRegistry::new();
        registry.on_request(
            json!({"service": "math.Rng", "method": "Next"}),
            |_| async { Err(json!("rng exhausted")) },
        );
        let server = RpcServer::bind(&math_tree(), &registry);
        let client = client_for(server);

        let mut stream = client.call("math.Rng", "Next", json!(null)).await.unwrap();
        assert!(matches!(
            stream.next().await,
            Some(Err(StratusError::Remote(err))) if err == json!("rng exhausted")
        ));
    }
}
