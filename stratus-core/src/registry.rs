//! Server-side handler registry.
//!
//! Maps a canonical pattern key to a handler function plus its kind
//! (request vs. event) and transport-specific extras. The registry is
//! built once at server startup with explicit registration calls and is
//! read-only afterwards.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use serde_json::Value;

use crate::pattern::{canonical_key, topic_matches};

/// What a handler produced for one invocation.
///
/// The dispatch engine coerces either shape into a uniform stream of
/// outbound response packets; the handler future itself covers the
/// deferred-value case.
pub enum HandlerOutput {
    /// A single response value.
    Value(Value),
    /// A multi-value response stream; `Err` items carry handler error
    /// payloads and terminate the stream.
    Stream(BoxStream<'static, Result<Value, Value>>),
}

/// Result of invoking a handler. The error payload is data on the wire,
/// never a server-side defect.
pub type HandlerResult = Result<HandlerOutput, Value>;

/// A registered handler function.
pub type MessageHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Whether an entry answers requests or consumes one-way events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// Request/response: every invocation streams packets back.
    Request,
    /// Fire-and-forget: no response is ever produced.
    Event,
}

/// One registry entry.
#[derive(Clone)]
pub struct HandlerEntry {
    /// The handler function.
    pub handler: MessageHandler,
    /// Request or event.
    pub kind: HandlerKind,
    /// Transport-specific extras (e.g. a quality-of-service level).
    pub extras: HashMap<String, Value>,
}

impl std::fmt::Debug for HandlerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerEntry")
            .field("kind", &self.kind)
            .field("extras", &self.extras)
            .finish_non_exhaustive()
    }
}

/// Pattern-keyed handler table, built once at startup.
#[derive(Default)]
pub struct HandlerRegistry {
    entries: HashMap<String, HandlerEntry>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a raw handler entry under a pattern.
    pub fn register(
        &mut self,
        pattern: impl Into<Value>,
        kind: HandlerKind,
        handler: MessageHandler,
    ) -> &mut Self {
        self.register_with_extras(pattern, kind, handler, HashMap::new())
    }

    /// Register a raw handler entry with transport-specific extras.
    pub fn register_with_extras(
        &mut self,
        pattern: impl Into<Value>,
        kind: HandlerKind,
        handler: MessageHandler,
        extras: HashMap<String, Value>,
    ) -> &mut Self {
        let key = canonical_key(&pattern.into());
        self.entries.insert(
            key,
            HandlerEntry {
                handler,
                kind,
                extras,
            },
        );
        self
    }

    /// Register a request handler returning a single (possibly deferred)
    /// value.
    pub fn on_request<F, Fut>(&mut self, pattern: impl Into<Value>, handler: F) -> &mut Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, Value>> + Send + 'static,
    {
        let handler: MessageHandler = Arc::new(move |data| {
            let fut = handler(data);
            async move { fut.await.map(HandlerOutput::Value) }.boxed()
        });
        self.register(pattern, HandlerKind::Request, handler)
    }

    /// Register a request handler producing a multi-value response stream.
    pub fn on_request_stream<F, S>(&mut self, pattern: impl Into<Value>, handler: F) -> &mut Self
    where
        F: Fn(Value) -> S + Send + Sync + 'static,
        S: futures::Stream<Item = Result<Value, Value>> + Send + 'static,
    {
        let handler: MessageHandler = Arc::new(move |data| {
            let stream = handler(data).boxed();
            async move { Ok(HandlerOutput::Stream(stream)) }.boxed()
        });
        self.register(pattern, HandlerKind::Request, handler)
    }

    /// Register a one-way event handler. The pattern may contain topic
    /// wildcards (`+`, `#`) on topic-based transports.
    pub fn on_event<F, Fut>(&mut self, pattern: impl Into<Value>, handler: F) -> &mut Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Value>> + Send + 'static,
    {
        let handler: MessageHandler = Arc::new(move |data| {
            let fut = handler(data);
            async move { fut.await.map(|()| HandlerOutput::Value(Value::Null)) }.boxed()
        });
        self.register(pattern, HandlerKind::Event, handler)
    }

    /// Look up an entry by exact canonical key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&HandlerEntry> {
        self.entries.get(key)
    }

    /// Look up a request handler by exact canonical key.
    #[must_use]
    pub fn get_request(&self, key: &str) -> Option<&HandlerEntry> {
        self.entries
            .get(key)
            .filter(|entry| entry.kind == HandlerKind::Request)
    }

    /// Look up an event handler for a concrete topic, honoring wildcard
    /// registrations. Exact matches win over wildcard matches.
    #[must_use]
    pub fn match_event(&self, topic: &str) -> Option<&HandlerEntry> {
        if let Some(entry) = self.entries.get(topic) {
            if entry.kind == HandlerKind::Event {
                return Some(entry);
            }
        }
        self.entries
            .iter()
            .filter(|(_, entry)| entry.kind == HandlerKind::Event)
            .find(|(filter, _)| topic_matches(filter, topic))
            .map(|(_, entry)| entry)
    }

    /// Iterate over all registered `(key, kind)` pairs, e.g. to set up
    /// transport subscriptions at server startup.
    pub fn patterns(&self) -> impl Iterator<Item = (&str, HandlerKind)> + '_ {
        self.entries
            .iter()
            .map(|(key, entry)| (key.as_str(), entry.kind))
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("patterns", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_request_handler_roundtrip() {
        let mut registry = HandlerRegistry::new();
        registry.on_request("sum", |data: Value| async move {
            let a = data["a"].as_i64().unwrap_or(0);
            let b = data["b"].as_i64().unwrap_or(0);
            Ok(json!(a + b))
        });

        let entry = registry.get_request("sum").unwrap();
        let output = (entry.handler)(json!({"a": 1, "b": 2})).await.unwrap();
        match output {
            HandlerOutput::Value(v) => assert_eq!(v, json!(3)),
            HandlerOutput::Stream(_) => panic!("expected single value"),
        }
    }

    #[tokio::test]
    async fn test_stream_handler() {
        let mut registry = HandlerRegistry::new();
        registry.on_request_stream("count", |data: Value| {
            let n = data.as_u64().unwrap_or(0);
            futures::stream::iter((1..=n).map(|i| Ok(json!(i))))
        });

        let entry = registry.get_request("count").unwrap();
        let output = (entry.handler)(json!(3)).await.unwrap();
        match output {
            HandlerOutput::Stream(stream) => {
                let items: Vec<_> = stream.collect().await;
                assert_eq!(items.len(), 3);
            }
            HandlerOutput::Value(_) => panic!("expected stream"),
        }
    }

    #[test]
    fn test_structured_patterns_canonicalized() {
        let mut registry = HandlerRegistry::new();
        registry.on_request(json!({"service": "math", "method": "sum"}), |_| async {
            Ok(Value::Null)
        });

        let key = canonical_key(&json!({"method": "sum", "service": "math"}));
        assert!(registry.get_request(&key).is_some());
    }

    #[test]
    fn test_event_wildcard_lookup() {
        let mut registry = HandlerRegistry::new();
        registry.on_event("sensors/+/temp", |_| async { Ok(()) });

        assert!(registry.match_event("sensors/kitchen/temp").is_some());
        assert!(registry.match_event("sensors/kitchen/hum").is_none());
    }

    #[test]
    fn test_request_not_matched_as_event() {
        let mut registry = HandlerRegistry::new();
        registry.on_request("sum", |_| async { Ok(Value::Null) });

        assert!(registry.match_event("sum").is_none());
        assert!(registry.get_request("sum").is_some());
    }
}
