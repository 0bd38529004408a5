//! # stratus-codec
//!
//! Length-prefixed JSON frame codec for the Stratus socket transport.
//!
//! ## Frame Format
//!
//! ```text
//! +-----------------------+---+----------------------+
//! | length (ASCII digits) | # | JSON payload (UTF-8) |
//! +-----------------------+---+----------------------+
//! ```
//!
//! The length counts UTF-16 code units of the JSON text and the payload
//! follows the `#` delimiter immediately; frames are concatenated with no
//! separator. This format is a wire contract with independently deployed
//! peers and must be reproduced byte-for-byte.

mod frame;

pub use frame::JsonCodec;

// Re-export for convenience
pub use stratus_core::DEFAULT_MAX_FRAME_SIZE;
