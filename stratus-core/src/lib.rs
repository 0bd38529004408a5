//! # stratus-core
//!
//! Core types for the Stratus messaging framework.
//!
//! This crate provides:
//! - Message envelope types (`RequestPacket`, `ResponsePacket`, `PacketId`)
//! - Pattern canonicalization and topic wildcard matching
//! - The server-side handler registry
//! - Cancellable call result streams (`CallSink` / `CallStream`)
//! - The shared reconnect policy (`RetryPolicy`, `RetryState`)
//! - Typed per-transport configuration records
//! - Error types (`StratusError`, `TransportError`, `CodecError`)

mod config;
mod error;
mod packet;
mod pattern;
mod registry;
mod retry;
mod stream;

pub use config::{
    BrokerConfig, QueueConfig, RpcClientConfig, TcpClientConfig, TcpServerConfig,
    DEFAULT_MAX_FRAME_SIZE,
};
pub use error::{CodecError, StratusError, TransportError};
pub use packet::{PacketId, RequestPacket, ResponsePacket, NO_MESSAGE_HANDLER, STATUS_ERROR};
pub use pattern::{canonical_key, topic_matches};
pub use registry::{
    HandlerEntry, HandlerKind, HandlerOutput, HandlerRegistry, HandlerResult, MessageHandler,
};
pub use retry::{ConnectionState, ReconnectDecision, RetryPolicy, RetryState};
pub use stream::{call_channel, CallEvent, CallSink, CallStream, ReleaseHook};
