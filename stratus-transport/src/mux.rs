//! Request/response multiplexing for concurrent calls.
//!
//! The multiplexer owns the client-side routing map from correlation id to
//! pending call. Entries are created at call time and removed exactly
//! once: on a terminal packet, on cancellation, or on fatal connection
//! error. Responses for unknown ids are dropped silently; they belong to
//! already-cancelled or unknown calls, which is not an error.

use dashmap::DashMap;

use stratus_core::{
    call_channel, CallSink, CallStream, PacketId, ReleaseHook, ResponsePacket, StratusError,
    TransportError,
};

struct CallSlot {
    sink: CallSink,
    /// Runs exactly once when the entry is removed; adapters use this to
    /// release per-call subscription resources.
    on_release: Option<ReleaseHook>,
}

/// Correlates inbound response packets with outstanding calls.
///
/// Many concurrent calls share one connection; each gets a unique id and
/// its own FIFO event channel, so values for one id are delivered in wire
/// arrival order and never cross over to another call.
#[derive(Default)]
pub struct Multiplexer {
    pending: DashMap<String, CallSlot>,
}

impl Multiplexer {
    /// Create a new multiplexer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending call and return its result stream.
    ///
    /// `on_release` runs exactly once when the routing entry is removed,
    /// whether through a terminal packet, cancellation (stream drop), or
    /// connection failure.
    pub fn register(
        self: &std::sync::Arc<Self>,
        id: &PacketId,
        on_release: Option<ReleaseHook>,
    ) -> CallStream {
        let mux = std::sync::Arc::clone(self);
        let release_id = id.as_str().to_string();
        let (sink, stream) = call_channel(Some(Box::new(move || {
            mux.remove(&release_id);
        })));

        self.pending
            .insert(id.as_str().to_string(), CallSlot { sink, on_release });
        stream
    }

    /// Remove a routing entry, running its release hook.
    ///
    /// Removing a non-existent id is a no-op; returns whether an entry
    /// existed.
    pub fn remove(&self, id: &str) -> bool {
        match self.pending.remove(id) {
            Some((_, mut slot)) => {
                if let Some(release) = slot.on_release.take() {
                    release();
                }
                true
            }
            None => false,
        }
    }

    /// Route one inbound response packet to its pending call.
    ///
    /// Terminal packets (error or disposal) remove the entry; plain values
    /// keep it alive for further streaming replies.
    pub fn dispatch(&self, packet: ResponsePacket) {
        let id = packet.id.as_str().to_string();

        if packet.is_terminal() {
            let Some((_, mut slot)) = self.pending.remove(&id) else {
                tracing::trace!(%id, "dropping terminal packet for unknown id");
                return;
            };
            match packet.err {
                Some(err) => slot.sink.error(StratusError::Remote(err)),
                None => {
                    if let Some(value) = packet.response {
                        slot.sink.value(value);
                    }
                    slot.sink.complete();
                }
            }
            if let Some(release) = slot.on_release.take() {
                release();
            }
            return;
        }

        match self.pending.get(&id) {
            Some(slot) => {
                if let Some(value) = packet.response {
                    slot.sink.value(value);
                }
            }
            None => tracing::trace!(%id, "dropping response for unknown id"),
        }
    }

    /// Fail every outstanding call, e.g. on fatal connection error.
    pub fn fail_all(&self, error: &TransportError) {
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, mut slot)) = self.pending.remove(&id) {
                slot.sink.error(StratusError::Transport(error.clone()));
                if let Some(release) = slot.on_release.take() {
                    release();
                }
            }
        }
    }

    /// Number of outstanding calls.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Check if there are any outstanding calls.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}
