//! # stratus-transport
//!
//! Transport adapters for the Stratus messaging framework.
//!
//! This crate provides:
//! - `Multiplexer` - client-side request/response correlation
//! - `Dispatcher` - server-side pattern dispatch
//! - `TcpClient` / `TcpServer` - framed socket transport
//! - `BrokerClient` / `BrokerServer` - pub/sub transport over a
//!   [`PubSubDriver`], with `MemoryBroker` as the in-process driver
//! - `QueueClient` / `QueueServer` - durable queue transport over a
//!   [`QueueDriver`], with `MemoryQueue` as the in-process driver
//! - `RpcClient` / `RpcServer` - streaming RPC over an [`RpcChannel`],
//!   with `MemoryRpcLink` as the in-process driver
//!
//! ## Architecture Note
//!
//! The correlation and dispatch engines are composed into each adapter
//! rather than inherited: every client owns a `Multiplexer`, every server
//! owns a `Dispatcher`, and the adapters only translate between packets
//! and their driver's wire operations. Connection state is confined to
//! the tasks of the owning adapter; all cross-task traffic is message
//! passing.

mod broker;
mod dispatch;
mod mux;
mod queue;
mod rpc;
mod tcp;

pub use broker::{
    reply_channel, BrokerClient, BrokerMessage, BrokerServer, MemoryBroker, PubSubConnection,
    PubSubDriver,
};
pub use dispatch::{Dispatcher, DisposalMode, ReplyPublisher};
pub use mux::Multiplexer;
pub use queue::{
    Delivery, DeliveryProps, MemoryQueue, QueueClient, QueueConnection, QueueDriver, QueueServer,
};
pub use rpc::{
    flatten_services, CallWriter, CancelSignal, DescriptorNode, DuplexHandler, MemoryRpcLink,
    MethodDescriptor, NativeCall, RpcChannel, RpcClient, RpcServer, ServiceDescriptor,
};
pub use tcp::{TcpClient, TcpServer};
