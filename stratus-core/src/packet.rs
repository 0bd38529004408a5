//! Message envelope types.
//!
//! These types define the JSON wire format exchanged between clients and
//! servers. Field names (`pattern`, `data`, `id`, `err`, `response`,
//! `isDisposed`, `status`) are part of the wire contract and must not change.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Canonical error payload for a request whose pattern has no handler.
pub const NO_MESSAGE_HANDLER: &str = "NO_MESSAGE_HANDLER";

/// Status value carried on error responses.
pub const STATUS_ERROR: &str = "error";

/// Caller-generated correlation token linking a request to its responses.
///
/// Ids are 128-bit random values rendered as hex, which makes collisions
/// within a connection's lifetime practically impossible.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PacketId(String);

impl PacketId {
    /// Generate a fresh random id.
    #[must_use]
    pub fn random() -> Self {
        Self(format!("{:032x}", rand::random::<u128>()))
    }

    /// View the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for PacketId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for PacketId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for PacketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Inbound message envelope: a call (with `id`) or an event (without).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestPacket {
    /// Addressable name of the target handler.
    #[serde(default)]
    pub pattern: Value,

    /// Application payload.
    #[serde(default)]
    pub data: Value,

    /// Correlation id; absent for fire-and-forget events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<PacketId>,
}

impl RequestPacket {
    /// Create a request packet expecting one or more responses.
    #[must_use]
    pub fn request(pattern: impl Into<Value>, data: Value, id: PacketId) -> Self {
        Self {
            pattern: pattern.into(),
            data,
            id: Some(id),
        }
    }

    /// Create a one-way event packet. No response is ever sent for events.
    #[must_use]
    pub fn event(pattern: impl Into<Value>, data: Value) -> Self {
        Self {
            pattern: pattern.into(),
            data,
            id: None,
        }
    }

    /// Check whether this packet is a fire-and-forget event.
    #[must_use]
    pub fn is_event(&self) -> bool {
        self.id.is_none()
    }
}

/// Outbound response envelope for a single correlation id.
///
/// `is_disposed == Some(true)` is a terminal marker: no further packets for
/// this id will arrive. A terminal packet may still carry a final `response`
/// value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResponsePacket {
    /// Correlation id of the originating call.
    pub id: PacketId,

    /// Error payload; terminal when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub err: Option<Value>,

    /// One value of the (possibly multi-value) result stream.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,

    /// Terminal marker: no further packets will arrive for this id.
    #[serde(rename = "isDisposed", skip_serializing_if = "Option::is_none")]
    pub is_disposed: Option<bool>,

    /// Status discriminator, `"error"` on error responses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl ResponsePacket {
    /// One value of a result stream; more packets may follow.
    #[must_use]
    pub fn value(id: PacketId, response: Value) -> Self {
        Self {
            id,
            response: Some(response),
            ..Self::default()
        }
    }

    /// A final value with the disposal flag folded in.
    #[must_use]
    pub fn terminal_value(id: PacketId, response: Value) -> Self {
        Self {
            id,
            response: Some(response),
            is_disposed: Some(true),
            ..Self::default()
        }
    }

    /// A standalone terminal marker with no value.
    #[must_use]
    pub fn disposed(id: PacketId) -> Self {
        Self {
            id,
            is_disposed: Some(true),
            ..Self::default()
        }
    }

    /// A terminal error response.
    #[must_use]
    pub fn error(id: PacketId, err: Value) -> Self {
        Self {
            id,
            err: Some(err),
            status: Some(STATUS_ERROR.to_string()),
            ..Self::default()
        }
    }

    /// The terminal response for a request no handler answers.
    #[must_use]
    pub fn no_handler(id: PacketId) -> Self {
        Self::error(id, Value::String(NO_MESSAGE_HANDLER.to_string()))
    }

    /// Check whether this packet terminates its result stream.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.err.is_some() || self.is_disposed == Some(true)
    }
}
