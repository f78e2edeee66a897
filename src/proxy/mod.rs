// Proxy module - HTTP server that forwards requests to the chat-completion API
//
// Every request is forwarded as-is (apart from credential and encoding
// headers). Chat completions are additionally inspected: streamed responses
// are merged, checked for degenerate repetition and optionally collapsed for
// clients that did not ask for a stream. Each exchange is logged and stored.

mod error;
mod force_stream;
mod handlers;
mod helpers;
pub(crate) mod record;
mod server;
pub(crate) mod sse;
mod state;

#[cfg(test)]
mod tests;

pub use server::start_proxy;
pub use state::{AutoCacheSettings, ProxySettings};
