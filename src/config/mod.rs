//! Configuration for the proxy and the inspection commands
//!
//! Configuration is loaded in order of precedence:
//! 1. Command-line flags (applied by the CLI on top of the loaded config)
//! 2. Environment variables (`MOONPALACE_ENDPOINT`, `MOONPALACE_KEY`)
//! 3. Config file (~/.moonpalace/config.toml)
//! 4. Built-in defaults

use serde::Deserialize;
use std::path::PathBuf;

// ─────────────────────────────────────────────────────────────────────────────
// Submodules
// ─────────────────────────────────────────────────────────────────────────────

mod logging;
mod serialization;
mod start;


pub use logging::{FileLogging, LogRotation, LoggingConfig};
pub use start::{AutoCacheConfig, DetectRepeatConfig, FileAutoCache, FileDetectRepeat, FileStart, StartConfig};

use crate::proxy::ProxySettings;

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub const DEFAULT_ENDPOINT: &str = "https://api.moonshot.cn";

const ENV_ENDPOINT: &str = "MOONPALACE_ENDPOINT";
const ENV_KEY: &str = "MOONPALACE_KEY";

/// `~/.moonpalace`, or `./.moonpalace` when there is no home directory
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".moonpalace")
}

// ─────────────────────────────────────────────────────────────────────────────
// Application Configuration
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Upstream base URL, without a trailing slash
    pub endpoint: String,
    /// SQLite file holding captured requests and cache mappings
    pub db_path: PathBuf,
    pub start: StartConfig,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            db_path: data_dir().join("moonpalace.sqlite"),
            start: StartConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// File Configuration (deserialization layer)
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileConfig {
    pub endpoint: Option<String>,
    pub db_path: Option<String>,

    /// Optional [start] section
    pub start: Option<FileStart>,

    /// Optional [logging] section
    pub logging: Option<FileLogging>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration Loading
// ─────────────────────────────────────────────────────────────────────────────

/// Upstream base URL with surrounding whitespace and trailing slashes removed
pub fn normalize_endpoint(endpoint: &str) -> String {
    endpoint.trim().trim_end_matches('/').to_string()
}

impl Config {
    /// ~/.moonpalace/config.toml
    pub fn config_path() -> PathBuf {
        data_dir().join("config.toml")
    }

    /// Load the config file if it exists
    ///
    /// A file that exists but cannot be read or parsed is fatal: the process
    /// exits with a message pointing at the file.
    fn load_file_config() -> FileConfig {
        let path = Self::config_path();

        let error = match std::fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => return config,
                Err(e) => ("Failed to parse configuration file", e.to_string()),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return FileConfig::default(),
            Err(e) => ("Cannot read configuration file", e.to_string()),
        };

        eprintln!("\n╔══════════════════════════════════════════════════════════════╗");
        eprintln!("║  CONFIG ERROR - {:<45}║", error.0);
        eprintln!("╚══════════════════════════════════════════════════════════════╝\n");
        eprintln!("  File: {}\n", path.display());
        eprintln!("  Error: {}\n", error.1);
        eprintln!("  To reset, delete the file and run moonpalace again.\n");
        std::process::exit(1);
    }

    /// Load configuration: env vars > file > defaults
    pub fn from_env() -> Self {
        Self::from_sources(Self::load_file_config(), |name| std::env::var(name).ok())
    }

    /// Merge a parsed file with environment lookups
    pub(crate) fn from_sources(file: FileConfig, env: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let endpoint = env(ENV_ENDPOINT)
            .filter(|v| !v.trim().is_empty())
            .or(file.endpoint)
            .map(|v| normalize_endpoint(&v))
            .unwrap_or(defaults.endpoint);

        let db_path = file.db_path.map(PathBuf::from).unwrap_or(defaults.db_path);

        Self {
            endpoint,
            db_path,
            start: StartConfig::from_file(file.start, env(ENV_KEY)),
            logging: LoggingConfig::from_file(file.logging),
        }
    }

    /// What the proxy server needs from the configuration
    pub fn proxy_settings(&self) -> ProxySettings {
        ProxySettings {
            endpoint: self.endpoint.clone(),
            key: self.start.key.clone(),
            detect_repeat: self.start.detect_repeat.settings(),
            force_stream: self.start.force_stream,
            auto_cache: self.start.auto_cache.settings(),
        }
    }
}
