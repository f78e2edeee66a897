//! The exchange record, filled in as a request moves through the proxy

use std::time::Duration;

use serde::Deserialize;

use crate::storage::NewRequest;

/// Token accounting reported by the upstream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub(crate) struct Usage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub cached_tokens: i64,
}

/// What went wrong with an exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Failure {
    /// The proxy itself failed at `step`; stored in the `error` column
    Proxy { step: &'static str, message: String },
    /// The upstream answered with a non-2xx status; the body is the message
    Upstream { message: String },
}

/// Metadata headers the upstream attaches to every response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct MshHeaders {
    pub request_id: String,
    pub uid: String,
    pub gid: String,
    pub context_cache_id: String,
    /// `Server-Timing` duration in milliseconds
    pub server_timing: i64,
}

/// Everything captured about one proxied request
#[derive(Debug, Default)]
pub(crate) struct Exchange {
    // ─── Request ───
    pub method: String,
    pub path: String,
    pub query: String,
    pub request_content_type: String,
    /// Inbound `X-Request-Id`
    pub request_id: String,
    /// `Accept-Encoding` as sent upstream
    pub accept_encoding: String,
    pub request_header: String,
    pub request_body: String,

    // ─── Response ───
    pub status: Option<u16>,
    pub response_content_type: String,
    pub content_encoding: String,
    pub response_header: String,
    /// Raw body as received, before any merging
    pub response_body: String,
    pub msh: MshHeaders,

    // ─── Derived ───
    pub moonshot_id: String,
    pub usage: Option<Usage>,
    pub ttft_ms: i64,
    /// Time from dispatch until the last token arrived
    pub token_finish: Option<Duration>,
    pub latency: Duration,
    pub warnings: Vec<String>,
    pub failure: Option<Failure>,

    pub endpoint: String,
    /// Local time, `YYYY-MM-DD HH:MM:SS`
    pub created_at: String,
}

impl Exchange {
    /// Record a warning once; the same text is not repeated
    pub(crate) fn warn(&mut self, warning: impl Into<String>) {
        push_warning(&mut self.warnings, warning.into());
    }

    /// Seconds per output token after the first one
    ///
    /// Only defined when usage and the token finish time are known, and only
    /// when the result is positive and finite.
    pub(crate) fn time_per_output_token(&self) -> Option<f64> {
        let usage = self.usage?;
        let finish = self.token_finish?;
        let tokens = usage.completion_tokens - i64::from(self.ttft_ms != 0);
        let secs = (finish.as_secs_f64() - self.ttft_ms as f64 / 1000.0) / tokens as f64;
        (secs > 0.0 && secs.is_finite()).then_some(secs)
    }

    pub(crate) fn to_new_request(&self) -> NewRequest {
        let tpot = self.time_per_output_token();
        NewRequest {
            request_method: self.method.clone(),
            request_path: self.path.clone(),
            request_query: self.query.clone(),
            request_content_type: self.request_content_type.clone(),
            request_id: self.request_id.clone(),
            moonshot_id: self.moonshot_id.clone(),
            moonshot_gid: self.msh.gid.clone(),
            moonshot_uid: self.msh.uid.clone(),
            moonshot_request_id: self.msh.request_id.clone(),
            moonshot_server_timing: self.msh.server_timing,
            response_status_code: self.status.map(i64::from).unwrap_or(0),
            response_content_type: self.response_content_type.clone(),
            request_header: self.request_header.clone(),
            request_body: self.request_body.clone(),
            response_header: self.response_header.clone(),
            response_body: self.response_body.clone(),
            error: match &self.failure {
                Some(Failure::Proxy { message, .. }) => message.clone(),
                _ => String::new(),
            },
            response_ttft: self.ttft_ms,
            response_tpot: tpot.map(|s| (s * 1000.0) as i64).unwrap_or(0),
            response_otps: tpot.map(|s| 1.0 / s).unwrap_or(0.0),
            latency: self.latency.as_millis() as i64,
            endpoint: self.endpoint.clone(),
            warnings: self.warnings.clone(),
            created_at: self.created_at.clone(),
        }
    }
}

pub(crate) fn push_warning(warnings: &mut Vec<String>, warning: String) {
    if !warnings.contains(&warning) {
        warnings.push(warning);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn streamed(ttft_ms: i64, finish_ms: u64, completion_tokens: i64) -> Exchange {
        Exchange {
            ttft_ms,
            token_finish: Some(Duration::from_millis(finish_ms)),
            usage: Some(Usage {
                completion_tokens,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_tpot_excludes_first_token() {
        // 11 tokens, the first at 100ms, the rest spread over 1s
        let exchange = streamed(100, 1100, 11);
        let tpot = exchange.time_per_output_token().unwrap();
        assert!((tpot - 0.1).abs() < 1e-9);

        let row = exchange.to_new_request();
        assert_eq!(row.response_tpot, 100);
        assert!((row.response_otps - 10.0).abs() < 1e-6);
    }

    #[test]
    fn test_tpot_without_ttft_uses_all_tokens() {
        let exchange = streamed(0, 2000, 4);
        assert_eq!(exchange.time_per_output_token(), Some(0.5));
    }

    #[test]
    fn test_tpot_undefined_cases() {
        // Single token: zero tokens after the first
        assert_eq!(streamed(100, 500, 1).time_per_output_token(), None);
        // No usage
        let mut exchange = streamed(100, 500, 10);
        exchange.usage = None;
        assert_eq!(exchange.time_per_output_token(), None);
        // No finish time
        let mut exchange = streamed(100, 500, 10);
        exchange.token_finish = None;
        assert_eq!(exchange.time_per_output_token(), None);
    }

    #[test]
    fn test_upstream_failure_not_stored_as_error() {
        let mut exchange = Exchange {
            failure: Some(Failure::Upstream {
                message: "rate limited".into(),
            }),
            ..Default::default()
        };
        assert_eq!(exchange.to_new_request().error, "");

        exchange.failure = Some(Failure::Proxy {
            step: "send_new_request",
            message: "connection refused".into(),
        });
        assert_eq!(exchange.to_new_request().error, "connection refused");
    }

    #[test]
    fn test_warnings_are_deduplicated() {
        let mut exchange = Exchange::default();
        exchange.warn("a");
        exchange.warn("b");
        exchange.warn("a");
        assert_eq!(exchange.warnings, vec!["a", "b"]);
    }
}
