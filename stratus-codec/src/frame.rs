//! Length-prefixed JSON frame codec.
//!
//! Wire format: `<decimal-ASCII-length>'#'<UTF-8 JSON payload>`, repeated
//! with no separator between frames. The length counts UTF-16 code units
//! of the JSON text (the unit the original wire peers measure), which for
//! ASCII payloads equals the byte count.
//!
//! Decoding tolerates arbitrary chunking: frames may arrive split at any
//! byte boundary, including inside a multi-byte character, and several
//! frames may arrive in one chunk. Both failure modes (a length prefix
//! that is not a non-negative integer, and a complete frame that is not
//! valid JSON) are fatal to the connection; the owning transport adapter
//! surfaces the error and terminates the socket.

use std::cell::RefCell;

use ntex_bytes::{BufMut, BytesMut};
use ntex_codec::{Decoder, Encoder};
use serde_json::Value;

use stratus_core::{CodecError, DEFAULT_MAX_FRAME_SIZE};

/// Frame delimiter between the length prefix and the payload.
const DELIMITER: char = '#';

/// Longest accepted length prefix; anything longer cannot address a frame
/// below any sane size limit.
const MAX_PREFIX_DIGITS: usize = 10;

#[derive(Debug, Default)]
struct DecodeState {
    /// Trailing bytes of an incomplete UTF-8 code point from the previous
    /// chunk.
    pending: Vec<u8>,
    /// Decoded text accumulated so far.
    text: String,
    /// UTF-16 length of `text`, maintained incrementally.
    units: usize,
    /// Payload length parsed from the current frame's prefix, if known.
    expected: Option<usize>,
}

impl DecodeState {
    fn push(&mut self, s: &str) {
        self.text.push_str(s);
        self.units += s.encode_utf16().count();
    }

    /// Split off and return the first `byte_end` bytes of the buffer,
    /// accounting for `units` UTF-16 code units.
    fn take_prefix(&mut self, byte_end: usize, units: usize) -> String {
        let rest = self.text.split_off(byte_end);
        let prefix = std::mem::replace(&mut self.text, rest);
        self.units -= units;
        prefix
    }

    fn reset(&mut self) {
        self.pending.clear();
        self.text.clear();
        self.units = 0;
        self.expected = None;
    }
}

/// Codec turning a byte stream into discrete JSON messages and back.
///
/// Implements the `ntex_codec` traits over `BytesMut` the way the
/// framework's other codecs do; decode state lives behind a `RefCell`
/// because each connection task owns its codec exclusively.
#[derive(Debug)]
pub struct JsonCodec {
    max_frame_size: usize,
    state: RefCell<DecodeState>,
}

impl JsonCodec {
    /// Create a codec with the default maximum frame size.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a codec with a custom maximum frame size.
    #[must_use]
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            max_frame_size,
            state: RefCell::new(DecodeState::default()),
        }
    }

    /// Get the maximum frame size.
    #[must_use]
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Encode a message into a fresh buffer.
    pub fn encode_value(&self, value: &Value) -> Result<BytesMut, CodecError> {
        let json = serde_json::to_string(value).map_err(|e| CodecError::Serialize(e.to_string()))?;
        let units = json.encode_utf16().count();
        if units > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                size: units,
                max: self.max_frame_size,
            });
        }

        let prefix = units.to_string();
        let mut dst = BytesMut::with_capacity(prefix.len() + 1 + json.len());
        dst.put_slice(prefix.as_bytes());
        dst.put_u8(DELIMITER as u8);
        dst.put_slice(json.as_bytes());
        Ok(dst)
    }

    /// Absorb raw bytes into the decode buffer, handling code points split
    /// across chunk boundaries.
    fn ingest(&self, state: &mut DecodeState, bytes: &[u8]) -> Result<(), CodecError> {
        let owned;
        let work: &[u8] = if state.pending.is_empty() {
            bytes
        } else {
            state.pending.extend_from_slice(bytes);
            owned = std::mem::take(&mut state.pending);
            &owned
        };

        match std::str::from_utf8(work) {
            Ok(s) => state.push(s),
            Err(e) if e.error_len().is_none() => {
                // chunk ends inside a code point; buffer the tail
                let valid = e.valid_up_to();
                state.push(std::str::from_utf8(&work[..valid]).unwrap_or(""));
                state.pending = work[valid..].to_vec();
            }
            Err(_) => {
                return Err(CodecError::InvalidPayload(
                    "stream is not valid UTF-8".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Parse the length prefix once the delimiter is visible, or fail fast
    /// when the accumulated prefix can no longer be a valid length.
    fn parse_prefix(&self, state: &mut DecodeState) -> Result<bool, CodecError> {
        match state.text.find(DELIMITER) {
            Some(hash) => {
                let header = state.take_prefix(hash + 1, hash + 1);
                let prefix = &header[..hash];
                if prefix.is_empty() || !prefix.bytes().all(|b| b.is_ascii_digit()) {
                    let detail = format!("{prefix:?} is not a non-negative integer");
                    state.reset();
                    return Err(CodecError::CorruptedLength(detail));
                }
                let length: usize = prefix.parse().map_err(|_| {
                    let detail = format!("{prefix:?} overflows");
                    state.reset();
                    CodecError::CorruptedLength(detail)
                })?;
                if length > self.max_frame_size {
                    state.reset();
                    return Err(CodecError::FrameTooLarge {
                        size: length,
                        max: self.max_frame_size,
                    });
                }
                state.expected = Some(length);
                Ok(true)
            }
            None => {
                // nothing but digits may precede the delimiter
                if !state.text.bytes().all(|b| b.is_ascii_digit())
                    || state.text.len() > MAX_PREFIX_DIGITS
                {
                    let detail = format!("{:?} is not a non-negative integer", state.text);
                    state.reset();
                    return Err(CodecError::CorruptedLength(detail));
                }
                Ok(false)
            }
        }
    }

    /// Find the byte offset where the payload of `expected` UTF-16 units
    /// ends, if the buffer holds that much text.
    fn payload_end(state: &DecodeState, expected: usize) -> Result<Option<usize>, CodecError> {
        if state.units < expected {
            return Ok(None);
        }
        if expected == 0 {
            return Ok(Some(0));
        }
        let mut units = 0;
        for (idx, ch) in state.text.char_indices() {
            units += ch.len_utf16();
            if units == expected {
                return Ok(Some(idx + ch.len_utf8()));
            }
            if units > expected {
                return Err(CodecError::CorruptedLength(
                    "length splits a surrogate pair".to_string(),
                ));
            }
        }
        Ok(None)
    }
}

impl Default for JsonCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for JsonCodec {
    type Item = Value;
    type Error = CodecError;

    fn decode(&self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let mut state = self.state.borrow_mut();

        if !src.is_empty() {
            let chunk = src.split_to(src.len());
            self.ingest(&mut state, &chunk)?;
        }

        if state.expected.is_none() && !self.parse_prefix(&mut state)? {
            return Ok(None);
        }

        // expected is always set past this point
        let Some(expected) = state.expected else {
            return Ok(None);
        };
        let Some(byte_end) = Self::payload_end(&state, expected)? else {
            return Ok(None);
        };

        let payload = state.take_prefix(byte_end, expected);
        state.expected = None;

        let value: Value = serde_json::from_str(&payload)
            .map_err(|e| CodecError::InvalidPayload(e.to_string()))?;
        Ok(Some(value))
    }
}

impl Encoder for JsonCodec {
    type Item = Value;
    type Error = CodecError;

    fn encode(&self, item: Self::Item, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let frame = self.encode_value(&item)?;
        dst.extend_from_slice(&frame);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode_all(codec: &JsonCodec, buf: &mut BytesMut) -> Vec<Value> {
        let mut out = Vec::new();
        while let Some(value) = codec.decode(buf).unwrap() {
            out.push(value);
        }
        out
    }

    #[test]
    fn test_encode_wire_format() {
        let codec = JsonCodec::new();
        let frame = codec.encode_value(&json!({"pattern": "sum"})).unwrap();
        assert_eq!(&frame[..], b"17#{\"pattern\":\"sum\"}" as &[u8]);
    }

    #[test]
    fn test_roundtrip() {
        let codec = JsonCodec::new();
        let value = json!({"id": "7", "response": [1, 2, 3]});

        let mut buf = codec.encode_value(&value).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, value);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_split_at_every_byte_boundary() {
        let value = json!({"text": "héllo ✓ 🚀 ß", "n": 42});

        let frame = JsonCodec::new().encode_value(&value).unwrap();
        for split in 0..=frame.len() {
            let codec = JsonCodec::new();
            let mut buf = BytesMut::new();

            buf.extend_from_slice(&frame[..split]);
            let mut got = decode_all(&codec, &mut buf);
            buf.extend_from_slice(&frame[split..]);
            got.extend(decode_all(&codec, &mut buf));

            assert_eq!(got, vec![value.clone()], "failed at split {split}");
        }
    }

    #[test]
    fn test_byte_by_byte() {
        let value = json!({"emoji": "𝄞🎼", "ok": true});
        let frame = JsonCodec::new().encode_value(&value).unwrap();

        let codec = JsonCodec::new();
        let mut out = Vec::new();
        for byte in frame.iter() {
            let mut buf = BytesMut::new();
            buf.extend_from_slice(&[*byte]);
            out.extend(decode_all(&codec, &mut buf));
        }
        assert_eq!(out, vec![value]);
    }

    #[test]
    fn test_multiple_frames_in_one_chunk() {
        let codec = JsonCodec::new();
        let mut buf = BytesMut::new();
        for i in 0..3 {
            let frame = codec.encode_value(&json!({"seq": i})).unwrap();
            buf.extend_from_slice(&frame);
        }

        let got = decode_all(&codec, &mut buf);
        assert_eq!(got, vec![json!({"seq": 0}), json!({"seq": 1}), json!({"seq": 2})]);
    }

    #[test]
    fn test_corrupted_length_is_fatal() {
        let codec = JsonCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"12a#{}");

        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::CorruptedLength(_))
        ));
    }

    #[test]
    fn test_garbage_without_delimiter_detected_early() {
        let codec = JsonCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"hello there");

        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::CorruptedLength(_))
        ));
    }

    #[test]
    fn test_invalid_payload_is_distinct() {
        let codec = JsonCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"5#{oops");

        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let codec = JsonCodec::with_max_frame_size(16);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"1000#");

        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::FrameTooLarge { size: 1000, max: 16 })
        ));
    }

    #[test]
    fn test_utf16_length_prefix() {
        // "🚀" is one 4-byte code point but two UTF-16 units
        let codec = JsonCodec::new();
        let frame = codec.encode_value(&json!("🚀")).unwrap();
        // JSON text is "\"🚀\"": 2 quotes + 2 units
        assert!(frame.starts_with(b"4#"));

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&frame);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), json!("🚀"));
    }

    #[test]
    fn test_partial_then_rest() {
        let codec = JsonCodec::new();
        let frame = codec.encode_value(&json!({"a": 1})).unwrap();
        let mut buf = BytesMut::new();

        buf.extend_from_slice(&frame[..3]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&frame[3..]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), json!({"a": 1}));
    }
}
