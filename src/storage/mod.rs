//! Durable storage for captured exchanges and context-cache mappings
//!
//! Everything lives in one SQLite file (WAL mode) behind the [`Persistence`]
//! trait. The trait is synchronous; async callers go through
//! `tokio::task::spawn_blocking`.
//!
//! Two tables:
//!
//! - `moonshot_requests`: one row per proxied exchange
//! - `moonshot_caches`: prefix hash → upstream context cache id, scoped by a
//!   hash of the credential that created it

mod model;
mod sqlite;

pub use model::{format_json, ExportedRequest, NewRequest, StoredRequest, CHAT_COMPLETIONS_SUFFIX};
pub use sqlite::SqliteStore;

use anyhow::Result;

/// How a single stored request is looked up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestLookup {
    /// Row id
    Id(i64),
    /// Completion id (`chatcmpl-...`)
    CompletionId(String),
    /// Upstream `Msh-Request-Id`
    RequestId(String),
}

/// Filters for [`Persistence::list_requests`]
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    /// Maximum number of rows; `None` means unlimited
    pub limit: Option<u64>,
    /// Only `/chat/completions` requests
    pub chat_only: bool,
    /// Raw SQL boolean expressions over the table's columns, AND-ed together
    pub predicates: Vec<String>,
}

pub trait Persistence: Send + Sync {
    /// Insert one exchange and return its row id
    fn insert_request(&self, request: &NewRequest) -> Result<i64>;

    /// Newest first; event-stream bodies come back merged into one object
    fn list_requests(&self, filter: &ListFilter) -> Result<Vec<StoredRequest>>;

    fn get_request(&self, lookup: &RequestLookup) -> Result<Option<StoredRequest>>;

    /// Delete requests created before `before` (`YYYY-MM-DD HH:MM:SS`)
    fn cleanup(&self, before: &str) -> Result<usize>;

    /// Find a cache for the longest matching checkpoint
    ///
    /// `hashes` is ordered shortest prefix first. Only caches that covered at
    /// least `min_bytes` bytes and belong to `key_hash` qualify.
    fn get_cache_by_hash_list(
        &self,
        hashes: &[String],
        min_bytes: usize,
        key_hash: &str,
    ) -> Result<Option<String>>;

    fn set_cache(
        &self,
        cache_id: &str,
        hash: &str,
        n_bytes: usize,
        key_hash: &str,
        now: &str,
    ) -> Result<()>;

    /// Mark a cache as used at `now`
    fn touch_cache(&self, cache_id: &str, now: &str) -> Result<()>;

    /// Drop cache mappings for `key_hash` unused since `before`
    fn remove_inactive_caches(&self, key_hash: &str, before: &str) -> Result<usize>;
}

/// Local time formatted the way the tables store it
pub fn local_datetime(time: chrono::DateTime<chrono::Local>) -> String {
    time.format("%Y-%m-%d %H:%M:%S").to_string()
}

pub fn now_local() -> String {
    local_datetime(chrono::Local::now())
}
