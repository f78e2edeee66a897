//! Automatic context caching
//!
//! Long conversations resend the same prefix on every turn. With auto-cache
//! enabled the proxy hashes that prefix (tool definitions, then each message in
//! order) and keeps a rolling digest. Once the hashed prefix is larger than the
//! configured threshold, every message boundary yields a checkpoint. The last
//! checkpoint is looked up in storage to reuse a server-side context cache, or
//! a new cache is created and recorded under it.

pub mod client;

pub use client::{Cache, CachingClient, RawCacheBody};

use std::sync::Arc;

use serde::Deserialize;

use crate::pool::{Pool, Pooled, Recycle};

const FNV128_OFFSET: u128 = 0x6c62272e07bb014262b821756295c58d;
const FNV128_PRIME: u128 = 0x0000000001000000000000000000013b;

/// 128-bit FNV-1 hasher
#[derive(Debug, Clone, Copy)]
pub struct Fnv128 {
    state: u128,
}

impl Default for Fnv128 {
    fn default() -> Self {
        Self {
            state: FNV128_OFFSET,
        }
    }
}

impl Fnv128 {
    pub fn write(&mut self, bytes: &[u8]) {
        for b in bytes {
            self.state = self.state.wrapping_mul(FNV128_PRIME);
            self.state ^= u128::from(*b);
        }
    }

    /// Lowercase hex digest of everything written so far
    pub fn hex(&self) -> String {
        format!("{:032x}", self.state)
    }
}

impl Recycle for Fnv128 {
    fn recycle(&mut self) {
        self.state = FNV128_OFFSET;
    }
}

/// Pools used while computing checkpoints
#[derive(Clone)]
pub struct HashPools {
    pub hashers: Arc<Pool<Fnv128>>,
    pub lists: Arc<Pool<Vec<String>>>,
}

impl HashPools {
    pub fn new(max_idle: usize) -> Self {
        Self {
            hashers: Pool::new(max_idle),
            lists: Pool::new(max_idle),
        }
    }
}

/// The parts of a chat message that take part in prefix hashing
#[derive(Debug, Default, Deserialize)]
pub struct CacheMessage {
    #[serde(default)]
    pub role: String,
    #[serde(default, deserialize_with = "text_or_default")]
    pub content: String,
    #[serde(default)]
    pub tool_calls: Option<Vec<CacheToolCall>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CacheToolCall {
    #[serde(default)]
    pub function: Option<CacheFunction>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CacheFunction {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

/// Accept `null` and non-string content (e.g. multimodal parts) as empty text
fn text_or_default<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::String(s) => s,
        _ => String::new(),
    })
}

/// The messages of a chat completion request, as far as hashing needs them
#[derive(Debug, Default, Deserialize)]
pub struct CacheRequest {
    #[serde(default)]
    pub messages: Vec<CacheMessage>,
}

/// Hash a credential so it can be stored without the key itself
pub fn hash_key(pools: &HashPools, key: &str) -> String {
    let mut hasher = pools.hashers.checkout();
    hasher.write(key.as_bytes());
    hasher.hex()
}

/// Rolling prefix checkpoints for a conversation
///
/// Returns the checkpoint digests in message order together with the total
/// number of hashed bytes. A checkpoint is recorded after each message once the
/// running byte count exceeds `min_bytes`.
pub fn compute_checkpoints(
    pools: &HashPools,
    min_bytes: usize,
    tools: &[u8],
    messages: &[CacheMessage],
) -> (Pooled<Vec<String>>, usize) {
    let mut hasher = pools.hashers.checkout();
    let mut checkpoints = pools.lists.checkout();

    let tools = minify_json(tools);
    hasher.write(&tools);
    let mut n_bytes = tools.len();

    for message in messages {
        let mut feed = |bytes: &[u8]| {
            hasher.write(bytes);
            n_bytes += bytes.len();
        };
        feed(message.role.as_bytes());
        feed(message.content.as_bytes());
        for call in message.tool_calls.iter().flatten() {
            if let Some(function) = &call.function {
                feed(function.name.as_bytes());
                feed(function.arguments.as_bytes());
            }
        }
        if n_bytes > min_bytes {
            checkpoints.push(hasher.hex());
        }
    }

    (checkpoints, n_bytes)
}

/// Strip insignificant whitespace from a JSON document
///
/// Whitespace inside string literals is kept. Input that is not JSON is
/// processed the same way, byte by byte.
pub fn minify_json(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut in_string = false;
    let mut escaped = false;
    for &b in input {
        if in_string {
            out.push(b);
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b' ' | b'\t' | b'\n' | b'\r' => {}
            b'"' => {
                in_string = true;
                out.push(b);
            }
            _ => out.push(b),
        }
    }
    out
}
