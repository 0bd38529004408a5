//! Server-side pattern dispatch.
//!
//! Turns inbound request packets into handler invocations and adapts
//! whatever a handler returns (a value, a deferred value, or a
//! multi-value stream) into a uniform sequence of response packets on the
//! call's reply channel. Handler failures are data on the wire, never a
//! server crash; only a missing handler or an I/O failure are conditions
//! of the engine itself.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;

use stratus_core::{
    canonical_key, HandlerOutput, HandlerRegistry, PacketId, RequestPacket, ResponsePacket,
    StratusError,
};

/// How stream completion is signalled to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisposalMode {
    /// Fold the disposal flag into the final packet (socket transport:
    /// one terminal packet, no separate marker frame).
    Folded,
    /// Send a standalone `{id, isDisposed}` marker after the last value
    /// (pub/sub and queue transports, which have no stream-end signal).
    Marker,
}

/// Where response packets for one call are published.
///
/// Implementations derive the reply channel deterministically from the
/// inbound pattern/channel and, where one physical connection multiplexes
/// many logical topics, from the correlation id as well.
#[async_trait]
pub trait ReplyPublisher: Send + Sync {
    /// Publish one response packet.
    async fn publish(&self, packet: ResponsePacket) -> Result<(), StratusError>;
}

/// Looks up handlers by pattern and streams their results back.
pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
    disposal: DisposalMode,
}

impl Dispatcher {
    /// Create a dispatcher over a registry.
    #[must_use]
    pub fn new(registry: Arc<HandlerRegistry>, disposal: DisposalMode) -> Self {
        Self { registry, disposal }
    }

    /// The registry this dispatcher serves.
    #[must_use]
    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Handle one inbound packet: an event when it has no id, a call
    /// otherwise.
    pub async fn handle(&self, packet: RequestPacket, reply: &dyn ReplyPublisher) {
        let key = canonical_key(&packet.pattern);
        match packet.id {
            None => self.handle_event(&key, packet.data).await,
            Some(id) => self.handle_request(&key, id, packet.data, reply).await,
        }
    }

    /// Events are one-way: no response is ever sent, even when no handler
    /// exists.
    async fn handle_event(&self, topic: &str, data: Value) {
        let Some(entry) = self.registry.match_event(topic) else {
            tracing::debug!(%topic, "no handler registered for event, dropping");
            return;
        };

        match (entry.handler)(data).await {
            Ok(HandlerOutput::Value(_)) => {}
            Ok(HandlerOutput::Stream(stream)) => {
                // drain for side effects; event results are discarded
                let mut stream = stream;
                while let Some(item) = stream.next().await {
                    if let Err(err) = item {
                        tracing::error!(%topic, ?err, "event handler stream failed");
                        return;
                    }
                }
            }
            Err(err) => tracing::error!(%topic, ?err, "event handler failed"),
        }
    }

    async fn handle_request(
        &self,
        key: &str,
        id: PacketId,
        data: Value,
        reply: &dyn ReplyPublisher,
    ) {
        let Some(entry) = self.registry.get_request(key) else {
            tracing::warn!(pattern = %key, call = %id, "no handler registered for request");
            self.publish(reply, ResponsePacket::no_handler(id)).await;
            return;
        };

        match (entry.handler)(data).await {
            Err(err) => self.publish(reply, ResponsePacket::error(id, err)).await,
            Ok(HandlerOutput::Value(value)) => match self.disposal {
                DisposalMode::Folded => {
                    self.publish(reply, ResponsePacket::terminal_value(id, value))
                        .await;
                }
                DisposalMode::Marker => {
                    self.publish(reply, ResponsePacket::value(id.clone(), value))
                        .await;
                    self.publish(reply, ResponsePacket::disposed(id)).await;
                }
            },
            Ok(HandlerOutput::Stream(stream)) => {
                self.pump_stream(id, stream, reply).await;
            }
        }
    }

    /// Forward every stream item as a response packet, then terminate the
    /// call according to the disposal mode.
    async fn pump_stream(
        &self,
        id: PacketId,
        mut stream: BoxStream<'static, Result<Value, Value>>,
        reply: &dyn ReplyPublisher,
    ) {
        match self.disposal {
            DisposalMode::Marker => {
                while let Some(item) = stream.next().await {
                    match item {
                        Ok(value) => {
                            self.publish(reply, ResponsePacket::value(id.clone(), value))
                                .await;
                        }
                        Err(err) => {
                            self.publish(reply, ResponsePacket::error(id, err)).await;
                            return;
                        }
                    }
                }
                self.publish(reply, ResponsePacket::disposed(id)).await;
            }
            DisposalMode::Folded => {
                // hold one value back so the last can carry the disposal flag
                let mut held: Option<Value> = None;
                while let Some(item) = stream.next().await {
                    match item {
                        Ok(value) => {
                            if let Some(prev) = held.replace(value) {
                                self.publish(reply, ResponsePacket::value(id.clone(), prev))
                                    .await;
                            }
                        }
                        Err(err) => {
                            if let Some(prev) = held.take() {
                                self.publish(reply, ResponsePacket::value(id.clone(), prev))
                                    .await;
                            }
                            self.publish(reply, ResponsePacket::error(id, err)).await;
                            return;
                        }
                    }
                }
                match held {
                    Some(last) => {
                        self.publish(reply, ResponsePacket::terminal_value(id, last))
                            .await;
                    }
                    None => self.publish(reply, ResponsePacket::disposed(id)).await,
                }
            }
        }
    }

    async fn publish(&self, reply: &dyn ReplyPublisher, packet: ResponsePacket) {
        let call = packet.id.clone();
        if let Err(error) = reply.publish(packet).await {
            tracing::error!(%call, %error, "failed to publish response");
        }
    }
}
