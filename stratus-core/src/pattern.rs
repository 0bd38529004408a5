//! Pattern keys and topic matching.
//!
//! A pattern is the addressable name of a handler. It is either an opaque
//! string or a structured JSON value; structured patterns are canonicalized
//! to a stable string (objects serialized with sorted keys, recursively)
//! before being used as a registry or routing key, so `{a:1,b:2}` and
//! `{b:2,a:1}` address the same handler.

use serde_json::Value;

/// Canonicalize a pattern value into its registry key form.
///
/// Top-level strings are used verbatim; everything else is rendered as
/// canonical JSON with object keys sorted at every level.
#[must_use]
pub fn canonical_key(pattern: &Value) -> String {
    match pattern {
        Value::String(s) => s.clone(),
        other => {
            let mut out = String::new();
            write_canonical(other, &mut out);
            out
        }
    }
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // object keys are plain strings, always serializable
                out.push_str(&serde_json::to_string(key).expect("string key"));
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&serde_json::to_string(scalar).expect("scalar")),
    }
}

/// Match a topic name against a subscription filter.
///
/// Filters use `/`-separated segments with two wildcards: `+` matches
/// exactly one segment and a trailing `#` matches the remainder of the
/// topic, including zero segments. Used by topic-based transports to route
/// events; request patterns are always matched exactly.
#[must_use]
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if filter == topic {
        return true;
    }

    let mut filter_segs = filter.split('/');
    let mut topic_segs = topic.split('/');

    loop {
        match (filter_segs.next(), topic_segs.next()) {
            // trailing "#" swallows the rest of the topic, including nothing
            (Some("#"), _) => return filter_segs.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
