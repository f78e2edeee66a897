//! `[start]` section: proxy server behaviour
//!
//! Zero values in the file mean "use the default", so a half-filled section
//! never disables a feature by accident.

use std::time::Duration;

use serde::Deserialize;

use crate::detector::RepeatSettings;
use crate::proxy::AutoCacheSettings;

pub const DEFAULT_PORT: u16 = 9988;
pub const DEFAULT_REPEAT_THRESHOLD: f64 = 0.5;
pub const DEFAULT_REPEAT_MIN_LENGTH: u32 = 100;
pub const DEFAULT_CACHE_MIN_BYTES: usize = 4096;
pub const DEFAULT_CACHE_TTL: u64 = 60;
pub const DEFAULT_CACHE_CLEANUP: u64 = 86400;

fn nonzero<T: Default + PartialEq>(value: Option<T>, default: T) -> T {
    match value {
        Some(v) if v != T::default() => v,
        _ => default,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Repeat detection
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct DetectRepeatConfig {
    pub enabled: bool,
    /// Repeatness below this aborts the stream (0, 1]
    pub threshold: f64,
    /// Characters seen before the ratio is trusted
    pub min_length: u32,
}

impl Default for DetectRepeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: DEFAULT_REPEAT_THRESHOLD,
            min_length: DEFAULT_REPEAT_MIN_LENGTH,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct FileDetectRepeat {
    pub enabled: Option<bool>,
    pub threshold: Option<f64>,
    pub min_length: Option<u32>,
}

impl DetectRepeatConfig {
    pub fn from_file(file: Option<FileDetectRepeat>) -> Self {
        let file = file.unwrap_or_default();
        let defaults = Self::default();
        Self {
            enabled: file.enabled.unwrap_or(defaults.enabled),
            threshold: nonzero(file.threshold, defaults.threshold),
            min_length: nonzero(file.min_length, defaults.min_length),
        }
    }

    pub fn settings(&self) -> Option<RepeatSettings> {
        self.enabled.then_some(RepeatSettings {
            threshold: self.threshold,
            min_length: self.min_length,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Automatic context caching
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoCacheConfig {
    pub enabled: bool,
    pub min_bytes: usize,
    /// Seconds
    pub ttl: u64,
    /// Seconds a cache may stay unused before it is forgotten
    pub cleanup: u64,
}

impl Default for AutoCacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_bytes: DEFAULT_CACHE_MIN_BYTES,
            ttl: DEFAULT_CACHE_TTL,
            cleanup: DEFAULT_CACHE_CLEANUP,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct FileAutoCache {
    pub enabled: Option<bool>,
    pub min_bytes: Option<usize>,
    pub ttl: Option<u64>,
    pub cleanup: Option<u64>,
}

impl AutoCacheConfig {
    pub fn from_file(file: Option<FileAutoCache>) -> Self {
        let file = file.unwrap_or_default();
        let defaults = Self::default();
        Self {
            enabled: file.enabled.unwrap_or(defaults.enabled),
            min_bytes: nonzero(file.min_bytes, defaults.min_bytes),
            ttl: nonzero(file.ttl, defaults.ttl),
            cleanup: nonzero(file.cleanup, defaults.cleanup),
        }
    }

    pub fn settings(&self) -> Option<AutoCacheSettings> {
        self.enabled.then_some(AutoCacheSettings {
            min_bytes: self.min_bytes,
            ttl: Duration::from_secs(self.ttl),
            cleanup: Duration::from_secs(self.cleanup),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Start section
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct StartConfig {
    pub port: u16,
    /// Replaces every client's credential when set
    pub key: Option<String>,
    pub force_stream: bool,
    pub detect_repeat: DetectRepeatConfig,
    pub auto_cache: AutoCacheConfig,
}

impl Default for StartConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            key: None,
            force_stream: false,
            detect_repeat: DetectRepeatConfig::default(),
            auto_cache: AutoCacheConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct FileStart {
    pub port: Option<u16>,
    pub key: Option<String>,
    pub force_stream: Option<bool>,
    pub detect_repeat: Option<FileDetectRepeat>,
    pub auto_cache: Option<FileAutoCache>,
}

impl StartConfig {
    /// `env_key` (from `MOONPALACE_KEY`) wins over the file
    pub fn from_file(file: Option<FileStart>, env_key: Option<String>) -> Self {
        let file = file.unwrap_or_default();
        let defaults = Self::default();
        Self {
            port: nonzero(file.port, defaults.port),
            key: env_key.or(file.key).filter(|k| !k.is_empty()),
            force_stream: file.force_stream.unwrap_or(defaults.force_stream),
            detect_repeat: DetectRepeatConfig::from_file(file.detect_repeat),
            auto_cache: AutoCacheConfig::from_file(file.auto_cache),
        }
    }
}
