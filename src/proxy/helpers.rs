//! Utility functions for request/response header processing

use axum::http::{header, HeaderMap, HeaderName};

use super::record::MshHeaders;
use super::sse::media_type;

/// Headers that never travel from the client to the upstream as-is
fn is_hop_header(name: &HeaderName) -> bool {
    *name == header::HOST
        || *name == header::CONNECTION
        || *name == header::TRANSFER_ENCODING
        || *name == header::CONTENT_LENGTH
        || *name == header::ACCEPT_ENCODING
}

/// Copy inbound headers for the upstream request, minus hop-specific ones
pub(crate) fn forward_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(inbound.len());
    for (name, value) in inbound {
        if is_hop_header(name) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

/// Whether any `Accept-Encoding` entry names gzip
pub(crate) fn accepts_gzip(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|accept| media_type(accept.trim()) == "gzip")
}

/// Whether the body is gzip encoded
pub(crate) fn is_gzip(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::CONTENT_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| media_type(v) == "gzip")
}

/// First value of a header as text, empty when absent or not UTF-8
pub(crate) fn header_text(headers: &HeaderMap, name: impl header::AsHeaderName) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// Content type without parameters
pub(crate) fn content_type(headers: &HeaderMap) -> String {
    media_type(&header_text(headers, header::CONTENT_TYPE)).to_string()
}

/// The credential of an `Authorization` header, with any `Bearer` prefix removed
pub(crate) fn bearer_token(headers: &HeaderMap) -> String {
    let value = header_text(headers, header::AUTHORIZATION);
    value
        .strip_prefix("Bearer")
        .unwrap_or(value.as_str())
        .trim()
        .to_string()
}

/// Duration in milliseconds from a `Server-Timing` header (`...;dur=123`)
pub(crate) fn server_timing(headers: &HeaderMap) -> i64 {
    let value = header_text(headers, "server-timing");
    value
        .split(';')
        .map(str::trim)
        .find_map(|part| part.strip_prefix("dur="))
        .and_then(|dur| dur.parse::<f64>().ok())
        .map(|dur| dur as i64)
        .unwrap_or(0)
}

impl MshHeaders {
    pub(crate) fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            request_id: header_text(headers, "msh-request-id"),
            uid: header_text(headers, "msh-uid"),
            gid: header_text(headers, "msh-gid"),
            context_cache_id: header_text(headers, "msh-context-cache-id"),
            server_timing: server_timing(headers),
        }
    }
}

/// Render headers as `Name: value` lines, sorted by name, without `Authorization`
pub(crate) fn format_headers(headers: &HeaderMap) -> String {
    let mut lines: Vec<(String, &[u8])> = headers
        .iter()
        .filter(|(name, _)| **name != header::AUTHORIZATION)
        .map(|(name, value)| (canonical_name(name.as_str()), value.as_bytes()))
        .collect();
    // Stable, so repeated headers keep their order
    lines.sort_by(|a, b| a.0.cmp(&b.0));

    let mut out = String::new();
    for (name, value) in lines {
        out.push_str(&name);
        out.push_str(": ");
        out.push_str(&String::from_utf8_lossy(value));
        out.push_str("\r\n");
    }
    out
}

/// `content-type` → `Content-Type`
fn canonical_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.chars() {
        if upper {
            out.extend(c.to_uppercase());
        } else {
            out.push(c);
        }
        upper = c == '-';
    }
    out
}
