//! Config serialization to TOML
//!
//! The output parses back as a config file, so `config --show` can be used to
//! seed one.

use super::Config;

/// `sk-abcdef` -> `sk-***`
fn mask_key(key: &str) -> String {
    let visible: String = key.chars().take(3).collect();
    format!("{}***", visible)
}

impl Config {
    pub fn to_toml(&self) -> String {
        let start = &self.start;
        let repeat = &start.detect_repeat;
        let cache = &start.auto_cache;
        let logging = &self.logging;

        let key = match &start.key {
            Some(key) => format!("key = {:?}  # masked", mask_key(key)),
            None => "# key = \"sk-...\"  # or MOONPALACE_KEY".to_string(),
        };

        format!(
            r#"# moonpalace configuration

# Upstream API base URL (MOONPALACE_ENDPOINT overrides)
endpoint = {endpoint:?}

# SQLite database with captured requests
db_path = {db_path:?}

[start]
port = {port}
{key}
# Stream every chat completion upstream, collapsing for non-streaming clients
force_stream = {force_stream}

[start.detect_repeat]
enabled = {repeat_enabled}
threshold = {threshold:?}
min_length = {min_length}

[start.auto_cache]
enabled = {cache_enabled}
min_bytes = {min_bytes}
ttl = {ttl}
cleanup = {cleanup}

# Logging configuration (RUST_LOG env var overrides)
[logging]
level = {level:?}
file_enabled = {file_enabled}
file_dir = {file_dir:?}
file_rotation = "{rotation}"  # hourly, daily, never
file_prefix = {prefix:?}
"#,
            endpoint = self.endpoint,
            db_path = self.db_path.display().to_string(),
            port = start.port,
            key = key,
            force_stream = start.force_stream,
            repeat_enabled = repeat.enabled,
            threshold = repeat.threshold,
            min_length = repeat.min_length,
            cache_enabled = cache.enabled,
            min_bytes = cache.min_bytes,
            ttl = cache.ttl,
            cleanup = cache.cleanup,
            level = logging.level,
            file_enabled = logging.file_enabled,
            file_dir = logging.file_dir.display().to_string(),
            rotation = logging.file_rotation.as_str(),
            prefix = logging.file_prefix,
        )
    }
}
