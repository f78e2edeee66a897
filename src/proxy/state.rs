//! Proxy state types and shared coordination structures

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::caching::{CachingClient, HashPools};
use crate::detector::{DetectorMap, RepeatSettings, SuffixAutomaton};
use crate::pool::{Pool, DEFAULT_MAX_IDLE};
use crate::storage::Persistence;

// ─────────────────────────────────────────────────────────────────────────────
// Settings
// ─────────────────────────────────────────────────────────────────────────────

/// Runtime settings of one proxy instance
#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// Upstream base URL, without a trailing slash
    pub endpoint: String,
    /// Replaces the client's credential when set
    pub key: Option<String>,
    /// Repeat detection on streamed responses, when enabled
    pub detect_repeat: Option<RepeatSettings>,
    /// Stream every chat completion upstream, collapsing for clients that did not ask
    pub force_stream: bool,
    /// Automatic context caching, when enabled
    pub auto_cache: Option<AutoCacheSettings>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoCacheSettings {
    /// Conversations shorter than this are not cached
    pub min_bytes: usize,
    pub ttl: Duration,
    /// Cache mappings unused for this long are pruned
    pub cleanup: Duration,
}

// ─────────────────────────────────────────────────────────────────────────────
// Pools
// ─────────────────────────────────────────────────────────────────────────────

/// Object pools shared by all requests
#[derive(Clone)]
pub struct ProxyPools {
    pub automata: Arc<Pool<SuffixAutomaton>>,
    pub detectors: Arc<Pool<DetectorMap>>,
    pub completions: Arc<Pool<Map<String, Value>>>,
    pub hashes: HashPools,
}

impl ProxyPools {
    pub fn new(max_idle: usize) -> Self {
        Self {
            automata: Pool::new(max_idle),
            detectors: Pool::new(max_idle),
            completions: Pool::new(max_idle),
            hashes: HashPools::new(max_idle),
        }
    }
}

impl Default for ProxyPools {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_IDLE)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Proxy State
// ─────────────────────────────────────────────────────────────────────────────

/// Shared state for the proxy server
#[derive(Clone)]
pub struct ProxyState {
    /// HTTP client for forwarding requests
    pub(super) client: reqwest::Client,
    pub(super) settings: Arc<ProxySettings>,
    pub(super) pools: ProxyPools,
    /// Where finished exchanges and cache mappings go
    pub(super) store: Arc<dyn Persistence>,
    /// Context-cache API client, sharing `client`
    pub(super) caching: CachingClient,
    /// Serializes exchange log blocks so they never interleave
    pub(super) log_lock: Arc<Mutex<()>>,
    /// Background persistence and cache maintenance, drained at shutdown
    pub(super) tracker: TaskTracker,
    /// Cancelled once the shutdown grace period has run out
    pub(super) shutdown: CancellationToken,
}

impl ProxyState {
    pub fn new(
        client: reqwest::Client,
        settings: ProxySettings,
        store: Arc<dyn Persistence>,
        tracker: TaskTracker,
    ) -> Self {
        let caching = CachingClient::new(client.clone(), settings.endpoint.clone());
        Self {
            client,
            settings: Arc::new(settings),
            pools: ProxyPools::default(),
            store,
            caching,
            log_lock: Arc::new(Mutex::new(())),
            tracker,
            shutdown: CancellationToken::new(),
        }
    }
}
