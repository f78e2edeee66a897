//! Rewriting non-streaming chat requests into streaming ones
//!
//! With `force_stream` on, every chat completion is sent upstream with
//! `stream: true` and `include_usage`, so repeat detection and TTFT work for
//! clients that asked for a plain JSON response. The proxy collapses the
//! stream back into one object for them.

use serde_json::{Map, Value};

const STREAM_OPTIONS: &[u8] = br#""stream":true,"stream_options":{"include_usage":true},"#;

/// Outcome of inspecting a chat request body
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct StreamIntent {
    /// The client itself asked for `stream: true`
    pub client_wants_stream: bool,
    /// Replacement body, when the request had to be rewritten
    pub rewritten: Option<Vec<u8>>,
}

/// Inspect `body` and, unless the client already streams, turn streaming on
///
/// Bodies that are not JSON objects pass through untouched.
pub(crate) fn force_stream(body: &[u8]) -> StreamIntent {
    let Ok(Value::Object(object)) = serde_json::from_slice::<Value>(body) else {
        return StreamIntent {
            client_wants_stream: false,
            rewritten: None,
        };
    };

    let client_wants_stream = object.get("stream") == Some(&Value::Bool(true));
    if client_wants_stream {
        return StreamIntent {
            client_wants_stream,
            rewritten: None,
        };
    }

    let rewritten = if object.contains_key("stream") {
        set_stream_fields(object)
    } else {
        match splice_stream_fields(body) {
            Some(spliced) => Some(spliced),
            None => set_stream_fields(object),
        }
    };

    StreamIntent {
        client_wants_stream,
        rewritten,
    }
}

/// Insert the stream fields right after the opening brace
///
/// Returns `None` when the result would not be valid JSON (e.g. for `{}`).
fn splice_stream_fields(body: &[u8]) -> Option<Vec<u8>> {
    let brace = body.iter().position(|b| !b.is_ascii_whitespace())?;
    if body[brace] != b'{' {
        return None;
    }

    let mut spliced = Vec::with_capacity(body.len() + STREAM_OPTIONS.len());
    spliced.push(b'{');
    spliced.extend_from_slice(STREAM_OPTIONS);
    spliced.extend_from_slice(&body[brace + 1..]);

    serde_json::from_slice::<serde::de::IgnoredAny>(&spliced)
        .is_ok()
        .then_some(spliced)
}

fn set_stream_fields(mut object: Map<String, Value>) -> Option<Vec<u8>> {
    object.insert("stream".into(), Value::Bool(true));
    let options = object
        .entry("stream_options")
        .or_insert_with(|| Value::Object(Map::new()));
    if !options.is_object() {
        *options = Value::Object(Map::new());
    }
    if let Value::Object(options) = options {
        options.insert("include_usage".into(), Value::Bool(true));
    }
    serde_json::to_vec(&Value::Object(object)).ok()
}
