//! Folding streamed completion deltas into one JSON document
//!
//! A streamed chat completion arrives as a series of partial objects. The
//! [`Merger`] folds them into a single accumulator using two field-name
//! conventions:
//!
//! - *stream fields* (`content`, `arguments`) carry text fragments that are
//!   concatenated in arrival order;
//! - *index fields* (`index`) mark array elements as positional, so
//!   `choices[n]` and `tool_calls[n]` deltas land in the same slot.
//!
//! Everything else follows "last non-empty value wins".

use serde_json::{Map, Value};

/// How far past the end of an array a positional element may land
pub const MAX_INDEX_GAP: usize = 1024;

/// Merger configured for OpenAI-style chat completion chunks
pub const CHAT_COMPLETION: Merger = Merger {
    stream_fields: &["content", "arguments"],
    index_fields: &["index"],
};

#[derive(Debug, Clone, Copy)]
pub struct Merger {
    pub stream_fields: &'static [&'static str],
    pub index_fields: &'static [&'static str],
}

impl Merger {
    /// Merge `src` into `dst` in place
    pub fn merge_object(&self, dst: &mut Map<String, Value>, src: Map<String, Value>) {
        for (key, value) in src {
            match value {
                Value::Object(obj) => match dst.get_mut(&key) {
                    Some(Value::Object(existing)) => self.merge_object(existing, obj),
                    _ => {
                        dst.insert(key, Value::Object(obj));
                    }
                },
                Value::Array(arr) => match dst.get_mut(&key) {
                    Some(Value::Array(existing)) => self.merge_array(existing, arr),
                    _ => {
                        dst.insert(key, Value::Array(arr));
                    }
                },
                Value::String(s) if self.is_stream_field(&key) => match dst.get_mut(&key) {
                    Some(Value::String(existing)) => existing.push_str(&s),
                    _ => {
                        dst.insert(key, Value::String(s));
                    }
                },
                Value::String(s) => {
                    if !s.is_empty() {
                        dst.insert(key, Value::String(s));
                    }
                }
                Value::Null => {}
                other => {
                    dst.insert(key, other);
                }
            }
        }
    }

    /// Merge the elements of `src` into `dst`
    ///
    /// Objects carrying an index field are merged into `dst[index]`, padding
    /// with empty objects as needed. Elements without one are appended.
    /// Objects whose index is not a non-negative integer, or lies more than
    /// [`MAX_INDEX_GAP`] past the end of `dst`, are dropped.
    pub fn merge_array(&self, dst: &mut Vec<Value>, src: Vec<Value>) {
        for value in src {
            let obj = match value {
                Value::Object(obj) => obj,
                other => {
                    dst.push(other);
                    continue;
                }
            };

            let index = match self.find_index(&obj) {
                Some(Value::Number(n)) => match n.as_u64().and_then(|i| usize::try_from(i).ok()) {
                    Some(i) if i <= dst.len().saturating_add(MAX_INDEX_GAP) => i,
                    _ => continue,
                },
                Some(_) | None => {
                    dst.push(Value::Object(obj));
                    continue;
                }
            };

            if dst.len() <= index {
                dst.resize_with(index + 1, || Value::Object(Map::new()));
            }
            match &mut dst[index] {
                Value::Object(slot) => self.merge_object(slot, obj),
                slot => *slot = Value::Object(obj),
            }
        }
    }

    fn find_index<'a>(&self, obj: &'a Map<String, Value>) -> Option<&'a Value> {
        self.index_fields.iter().find_map(|f| obj.get(*f))
    }

    fn is_stream_field(&self, key: &str) -> bool {
        self.stream_fields.contains(&key)
    }
}

/// Merge a whole `text/event-stream` body into one completion object
///
/// Used when reading stored responses back. Lines that are not `data:`
/// payloads, the `[DONE]` sentinel, and payloads that are not JSON objects are
/// skipped.
pub fn merge_event_stream(body: &str) -> Map<String, Value> {
    let mut merged = Map::new();
    for line in body.lines() {
        let Some(payload) = crate::proxy::sse::parse_sse_data_line(line.trim_end_matches('\r')) else {
            continue;
        };
        if payload == "[DONE]" {
            continue;
        }
        if let Ok(Value::Object(chunk)) = serde_json::from_str::<Value>(payload) {
            CHAT_COMPLETION.merge_object(&mut merged, chunk);
        }
    }
    merged
}
