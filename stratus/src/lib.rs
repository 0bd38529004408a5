//! # Stratus
//!
//! Transport-agnostic messaging framework: request/response and
//! fire-and-forget calls multiplexed over interchangeable wire transports.
//!
//! Stratus provides:
//! - **Length-prefixed JSON framing** for raw socket transports
//! - **Call correlation**: many in-flight calls multiplexed over one
//!   connection, with streaming (multi-value) responses and cancellation
//! - **Pattern dispatch**: an explicit handler registry keyed by string or
//!   structured patterns, with topic wildcards for events
//! - **Interchangeable transports**: TCP sockets, pub/sub brokers, durable
//!   queues, and native streaming RPC behind one lifecycle and retry
//!   contract
//!
//! ## Quick Start
//!
//! ```rust
//! use stratus::{HandlerRegistry, RetryPolicy, TcpClientConfig};
//! use serde_json::{json, Value};
//!
//! // Handlers are registered explicitly at startup
//! let mut registry = HandlerRegistry::new();
//! registry.on_request("sum", |data: Value| async move {
//!     let a = data["a"].as_i64().unwrap_or(0);
//!     let b = data["b"].as_i64().unwrap_or(0);
//!     Ok(json!(a + b))
//! });
//! assert_eq!(registry.len(), 1);
//!
//! // Transports are configured with typed records
//! let config = TcpClientConfig::new()
//!     .address("127.0.0.1", 4000)
//!     .retry(RetryPolicy::new().attempts(3));
//! assert_eq!(config.retry.attempts, 3);
//! ```
//!
//! ## Architecture
//!
//! Stratus is composed of several crates:
//!
//! - [`stratus-core`](stratus_core) - packets, patterns, registry, result
//!   streams, retry policy, configuration
//! - [`stratus-codec`](stratus_codec) - the socket frame codec
//! - [`stratus-transport`](stratus_transport) - correlation, dispatch, and
//!   the transport adapters with their driver seams

// Re-export core types
pub use stratus_core::{
    call_channel, canonical_key, topic_matches, BrokerConfig, CallEvent, CallSink, CallStream,
    CodecError, ConnectionState, HandlerEntry, HandlerKind, HandlerOutput, HandlerRegistry,
    HandlerResult, MessageHandler, PacketId, QueueConfig, ReconnectDecision, ReleaseHook,
    RequestPacket, ResponsePacket, RetryPolicy, RetryState, RpcClientConfig, StratusError,
    TcpClientConfig, TcpServerConfig, TransportError, NO_MESSAGE_HANDLER, STATUS_ERROR,
};

// Re-export codec
pub use stratus_codec::JsonCodec;

// Re-export transports
pub use stratus_transport::{
    flatten_services, reply_channel, BrokerClient, BrokerMessage, BrokerServer, CallWriter,
    CancelSignal, Delivery, DeliveryProps, DescriptorNode, Dispatcher, DisposalMode, DuplexHandler,
    MemoryBroker, MemoryQueue, MemoryRpcLink, MethodDescriptor, Multiplexer, NativeCall,
    PubSubConnection, PubSubDriver, QueueClient, QueueConnection, QueueDriver, QueueServer,
    ReplyPublisher, RpcChannel, RpcClient, RpcServer, ServiceDescriptor, TcpClient, TcpServer,
};

/// Prelude module for convenient imports.
///
/// ```rust
/// use stratus::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        BrokerClient, BrokerServer, HandlerRegistry, QueueClient, QueueServer, RetryPolicy,
        RpcClient, RpcServer, StratusError, TcpClient, TcpClientConfig, TcpServer,
        TcpServerConfig,
    };
}

/// Version information.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
