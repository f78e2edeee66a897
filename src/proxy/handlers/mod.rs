//! Request and response handlers for the proxy
//!
//! This module contains the main request handler (`proxy_handler`) and
//! response handlers for streaming (SSE) and buffered responses.

mod buffered;
mod request;
mod streaming;

pub use request::proxy_handler;

use serde::Deserialize;

use super::record::Usage;

const MAX_TOKENS_HINT: &str = "it seems that your max_tokens value is too small";
const REPEAT_WARNING: &str =
    "it appears that there is an issue with content repeating in the current response";

/// Warning for a choice that stopped at `max_tokens`
fn length_warning(completion_tokens: Option<i64>) -> String {
    match completion_tokens {
        Some(n) => format!("{}, please set a value greater than {}", MAX_TOKENS_HINT, n),
        None => format!("{}, please set a larger value", MAX_TOKENS_HINT),
    }
}

/// A chat completion, or one chunk of a streamed one
///
/// Only the fields the proxy inspects are decoded.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(super) struct Completion {
    pub id: String,
    pub created: i64,
    pub model: String,
    pub object: String,
    pub choices: Vec<Choice>,
    pub usage: Option<Usage>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(super) struct Choice {
    pub index: u32,
    pub delta: Option<Message>,
    pub finish_reason: Option<String>,
    pub usage: Option<Usage>,
}

impl Choice {
    fn finished_by_length(&self) -> bool {
        self.finish_reason.as_deref() == Some("length")
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(super) struct Message {
    pub content: Option<String>,
    pub tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(super) struct ToolCall {
    pub function: Option<FunctionCall>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(super) struct FunctionCall {
    pub arguments: Option<String>,
}

impl Message {
    fn content(&self) -> &str {
        self.content.as_deref().unwrap_or_default()
    }

    /// Whether this delta carries generated tokens
    fn has_stream_token(&self) -> bool {
        !self.content().is_empty()
            || self
                .tool_calls
                .iter()
                .flatten()
                .filter_map(|call| call.function.as_ref())
                .any(|f| f.arguments.as_deref().is_some_and(|a| !a.is_empty()))
    }
}
