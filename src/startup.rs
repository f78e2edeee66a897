// Startup module - banner and feature status shown when the proxy starts
//
// Printed to stderr right after the listener is bound, so the base URL shown
// is one that already accepts connections.

use crate::config::VERSION;
use crate::proxy::ProxySettings;

/// ANSI color codes for terminal output
mod colors {
    pub const RESET: &str = "\x1b[0m";
    pub const BOLD: &str = "\x1b[1m";
    pub const DIM: &str = "\x1b[2m";
    pub const GREEN: &str = "\x1b[32m";
    pub const MAGENTA: &str = "\x1b[35m";
}

const ASCII_MOONPALACE: &str = r"
 __  __                   ____       _
|  \/  | ___   ___  _ __ |  _ \ __ _| | __ _  ___ ___
| |\/| |/ _ \ / _ \| '_ \| |_) / _` | |/ _` |/ __/ _ \
| |  | | (_) | (_) | | | |  __/ (_| | | (_| | (_|  __/
|_|  |_|\___/ \___/|_| |_|_|   \__,_|_|\__,_|\___\___|
";

/// Feature status line for display
pub struct FeatureStatus {
    pub name: &'static str,
    pub enabled: bool,
    pub detail: String,
}

/// The base URL clients should point at
pub fn base_url(port: u16) -> String {
    format!("http://127.0.0.1:{}/v1", port)
}

/// Print the startup banner and feature status
pub fn print_startup(port: u16, settings: &ProxySettings) {
    use colors::*;

    eprintln!("{BOLD}MoonPalace Starts => change base_url to {:?}{RESET}", base_url(port));
    eprintln!("{ASCII_MOONPALACE}");
    eprintln!("  {DIM}v{VERSION}{RESET}  {DIM}upstream:{RESET} {}", settings.endpoint);
    eprintln!();

    for feature in feature_status(settings) {
        print_feature_status(&feature);
    }
    eprintln!();
    eprintln!("  {MAGENTA}▸{RESET} Proxy listening on {BOLD}127.0.0.1:{port}{RESET}");
    eprintln!();
}

fn feature_status(settings: &ProxySettings) -> Vec<FeatureStatus> {
    vec![
        FeatureStatus {
            name: "detect-repeat",
            enabled: settings.detect_repeat.is_some(),
            detail: settings
                .detect_repeat
                .map(|r| format!("threshold {}, min length {}", r.threshold, r.min_length))
                .unwrap_or_default(),
        },
        FeatureStatus {
            name: "force-stream",
            enabled: settings.force_stream,
            detail: String::new(),
        },
        FeatureStatus {
            name: "auto-cache",
            enabled: settings.auto_cache.is_some(),
            detail: settings
                .auto_cache
                .map(|c| format!("min {} bytes, ttl {}s", c.min_bytes, c.ttl.as_secs()))
                .unwrap_or_default(),
        },
        FeatureStatus {
            name: "key",
            enabled: settings.key.is_some(),
            detail: "overrides client credentials".to_string(),
        },
    ]
}

fn print_feature_status(feature: &FeatureStatus) {
    use colors::*;

    if feature.enabled {
        eprintln!(
            "  {GREEN}✓{RESET} {:<14} {DIM}{}{RESET}",
            feature.name, feature.detail
        );
    } else {
        eprintln!("  {DIM}○ {:<14} (disabled){RESET}", feature.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::RepeatSettings;

    #[test]
    fn test_base_url() {
        assert_eq!(base_url(9988), "http://127.0.0.1:9988/v1");
    }

    #[test]
    fn test_feature_status_follows_settings() {
        let settings = ProxySettings {
            endpoint: "https://api.moonshot.cn".into(),
            key: None,
            detect_repeat: Some(RepeatSettings {
                threshold: 0.5,
                min_length: 100,
            }),
            force_stream: false,
            auto_cache: None,
        };
        let status = feature_status(&settings);
        let enabled: Vec<&str> = status.iter().filter(|f| f.enabled).map(|f| f.name).collect();
        assert_eq!(enabled, vec!["detect-repeat"]);
        assert_eq!(status[0].detail, "threshold 0.5, min length 100");
    }
}
