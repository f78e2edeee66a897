//! Row types for captured exchanges

use std::collections::BTreeMap;
use std::io::{self, Write};

use axum::http::StatusCode;
use serde::Serialize;
use serde_json::Value;

use crate::merge::merge_event_stream;

/// Suffix identifying the chat completion endpoint
pub const CHAT_COMPLETIONS_SUFFIX: &str = "/chat/completions";

/// One exchange, ready to be inserted
///
/// Empty strings and zero numbers are stored as NULL.
#[derive(Debug, Clone, Default)]
pub struct NewRequest {
    pub request_method: String,
    pub request_path: String,
    pub request_query: String,
    pub request_content_type: String,
    pub request_id: String,
    pub moonshot_id: String,
    pub moonshot_gid: String,
    pub moonshot_uid: String,
    pub moonshot_request_id: String,
    pub moonshot_server_timing: i64,
    pub response_status_code: i64,
    pub response_content_type: String,
    pub request_header: String,
    pub request_body: String,
    pub response_header: String,
    pub response_body: String,
    pub error: String,
    pub response_ttft: i64,
    pub response_tpot: i64,
    pub response_otps: f64,
    /// Milliseconds
    pub latency: i64,
    pub endpoint: String,
    pub warnings: Vec<String>,
    /// Local time, `YYYY-MM-DD HH:MM:SS`
    pub created_at: String,
}

/// A stored exchange as read back from `moonshot_requests`
#[derive(Debug, Clone, Default)]
pub struct StoredRequest {
    pub id: i64,
    pub request_method: String,
    pub request_path: String,
    pub request_query: String,
    pub request_content_type: Option<String>,
    pub request_id: Option<String>,
    pub moonshot_id: Option<String>,
    pub moonshot_gid: Option<String>,
    pub moonshot_uid: Option<String>,
    pub moonshot_request_id: Option<String>,
    pub moonshot_server_timing: Option<i64>,
    pub response_status_code: Option<i64>,
    pub response_content_type: Option<String>,
    pub request_header: Option<String>,
    pub request_body: Option<String>,
    pub response_header: Option<String>,
    pub response_body: Option<String>,
    pub error: Option<String>,
    pub response_ttft: Option<i64>,
    pub response_tpot: Option<i64>,
    pub response_otps: Option<f64>,
    pub latency: Option<i64>,
    pub endpoint: Option<String>,
    pub warnings: Option<String>,
    pub created_at: String,

    // Export-only annotations, never stored
    pub category: Option<String>,
    pub tags: Vec<String>,
}

impl StoredRequest {
    /// Most specific identifier: completion id, then upstream request id, then row id
    pub fn ident(&self) -> String {
        if let Some(chatcmpl) = self.chat_cmpl() {
            return format!("chatcmpl={}", chatcmpl);
        }
        match self.moonshot_request_id.as_deref() {
            Some(rid) if !rid.is_empty() => format!("requestid={}", rid),
            _ => format!("id={}", self.id),
        }
    }

    pub fn is_chat(&self) -> bool {
        self.request_path.ends_with(CHAT_COMPLETIONS_SUFFIX)
    }

    pub fn has_error(&self) -> bool {
        match self.response_status_code {
            None => true,
            Some(code) => code >= 400 || self.error.is_some(),
        }
    }

    /// Completion id, only for chat requests
    pub fn chat_cmpl(&self) -> Option<&str> {
        if !self.is_chat() {
            return None;
        }
        self.moonshot_id.as_deref().filter(|id| !id.is_empty())
    }

    /// Full upstream URL; rows written before `endpoint` existed use `fallback`
    pub fn url(&self, fallback: &str) -> String {
        let endpoint = self.endpoint.as_deref().unwrap_or(fallback);
        let mut url = format!("{}{}", endpoint, self.request_path);
        if !self.request_query.is_empty() {
            url.push('?');
            url.push_str(&self.request_query);
        }
        url
    }

    /// Status line such as `200 OK`; empty when no response was received
    pub fn status(&self) -> String {
        match self.response_status_code {
            None | Some(0) => String::new(),
            Some(code) => {
                let reason = u16::try_from(code)
                    .ok()
                    .and_then(|c| StatusCode::from_u16(c).ok())
                    .and_then(|s| s.canonical_reason())
                    .unwrap_or("");
                format!("{} {}", code, reason).trim_end().to_string()
            }
        }
    }

    pub fn metadata(&self) -> BTreeMap<&'static str, String> {
        let mut metadata = BTreeMap::new();
        metadata.insert("moonpalace_id", self.id.to_string());
        if self.moonshot_id.is_some() {
            metadata.insert("chatcmpl", self.chat_cmpl().unwrap_or_default().to_string());
        }
        if let Some(v) = &self.moonshot_request_id {
            metadata.insert("request_id", v.clone());
        }
        if let Some(v) = &self.moonshot_uid {
            metadata.insert("user_id", v.clone());
        }
        if let Some(v) = &self.moonshot_gid {
            metadata.insert("group_id", v.clone());
        }
        if self.response_status_code.is_some() {
            metadata.insert("status", self.status());
        }
        if let Some(v) = self.moonshot_server_timing {
            metadata.insert("server_timing", v.to_string());
        }
        if let Some(v) = &self.request_content_type {
            metadata.insert("request_content_type", v.clone());
        }
        if let Some(v) = &self.response_content_type {
            metadata.insert("response_content_type", v.clone());
        }
        if let Some(v) = self.response_ttft {
            metadata.insert("response_ttft", v.to_string());
        }
        if let Some(v) = self.response_tpot {
            metadata.insert("response_tpot", v.to_string());
        }
        if let Some(v) = self.response_otps {
            metadata.insert("response_otps", format!("{:.4}", v));
        }
        metadata.insert("requested_at", self.created_at.clone());
        if let Some(v) = self.latency {
            metadata.insert("latency", v.to_string());
        }
        if let Some(v) = &self.warnings {
            metadata.insert("warnings", v.clone());
        }
        metadata
    }

    /// Column name to printable text, for `inspect --print`
    pub fn inspection(&self) -> BTreeMap<&'static str, String> {
        let mut inspection = BTreeMap::new();
        let metadata = serde_json::to_value(self.metadata())
            .map(|v| pretty_json(&v))
            .unwrap_or_default();
        inspection.insert("metadata", metadata);
        inspection.insert("request_header", self.request_header.clone().unwrap_or_default());
        inspection.insert("request_body", format_json(self.request_body.as_deref().unwrap_or("")));
        inspection.insert("response_header", self.response_header.clone().unwrap_or_default());
        let response_body = format_json(self.response_body.as_deref().unwrap_or(""));
        inspection.insert(
            "error",
            self.error.clone().unwrap_or_else(|| response_body.clone()),
        );
        inspection.insert("response_body", response_body);
        inspection
    }

    /// Write the request as an HTTP/1.1 message
    pub fn print_request<W: Write>(&self, w: &mut W, fallback_endpoint: &str) -> io::Result<()> {
        writeln!(w, "{} {} HTTP/1.1", self.request_method, self.url(fallback_endpoint))?;
        if let Some(header) = &self.request_header {
            writeln!(w, "{}", header.trim())?;
            if let Some(body) = &self.request_body {
                writeln!(w)?;
                writeln!(w, "{}", format_json(body))?;
            }
        }
        Ok(())
    }

    /// Write the response as an HTTP/1.1 message, optionally merging event streams
    pub fn print_response<W: Write>(&self, w: &mut W, merge: bool) -> io::Result<()> {
        writeln!(w, "HTTP/1.1 {}", self.status())?;
        if let Some(header) = &self.response_header {
            writeln!(w, "{}", header.trim())?;
            if let Some(body) = &self.response_body {
                writeln!(w)?;
                if merge && self.response_content_type.as_deref() == Some("text/event-stream") {
                    writeln!(w, "{}", pretty_json(&Value::Object(merge_event_stream(body))))?;
                } else {
                    writeln!(w, "{}", format_json(body))?;
                }
            }
        }
        Ok(())
    }

    /// JSON form used by `list --export` and `export`
    pub fn to_export(&self, fallback_endpoint: &str) -> ExportedRequest {
        ExportedRequest {
            metadata: self
                .metadata()
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            request: ExportedMessage {
                url: Some(self.url(fallback_endpoint)),
                status: None,
                header: self.request_header.clone().unwrap_or_default(),
                body: body_value(self.request_body.as_deref().unwrap_or("")),
            },
            response: ExportedMessage {
                url: None,
                status: Some(self.status()),
                header: self.response_header.clone().unwrap_or_default(),
                body: body_value(self.response_body.as_deref().unwrap_or("")),
            },
            error: self.error.clone().filter(|e| !e.is_empty()),
            category: self.category.clone().filter(|c| !c.is_empty()),
            tags: self.tags.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ExportedRequest {
    pub metadata: BTreeMap<String, String>,
    pub request: ExportedMessage,
    pub response: ExportedMessage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ExportedMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    pub header: String,
    pub body: Value,
}

/// Embed a body as JSON when it parses, otherwise as a string
fn body_value(body: &str) -> Value {
    serde_json::from_str(body).unwrap_or_else(|_| Value::String(body.to_string()))
}

/// Re-indent a JSON document with four spaces; non-JSON is returned unchanged
pub fn format_json(s: &str) -> String {
    match serde_json::from_str::<Value>(s) {
        Ok(v) => pretty_json(&v),
        Err(_) => s.to_string(),
    }
}

fn pretty_json(v: &Value) -> String {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    if v.serialize(&mut ser).is_err() {
        return v.to_string();
    }
    String::from_utf8(buf).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat_row() -> StoredRequest {
        StoredRequest {
            id: 7,
            request_method: "POST".into(),
            request_path: "/v1/chat/completions".into(),
            request_query: String::new(),
            moonshot_id: Some("cmpl-1".into()),
            moonshot_request_id: Some("req-1".into()),
            response_status_code: Some(200),
            request_header: Some("Content-Type: application/json\r\n".into()),
            request_body: Some(r#"{"model":"m"}"#.into()),
            response_header: Some("Content-Type: application/json\r\n".into()),
            response_body: Some(r#"{"id":"cmpl-1"}"#.into()),
            response_content_type: Some("application/json".into()),
            endpoint: Some("https://api.example.com".into()),
            created_at: "2024-05-01 10:00:00".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_ident_prefers_chatcmpl() {
        let mut row = chat_row();
        assert_eq!(row.ident(), "chatcmpl=cmpl-1");

        row.request_path = "/v1/files".into();
        assert_eq!(row.ident(), "requestid=req-1");

        row.moonshot_request_id = None;
        assert_eq!(row.ident(), "id=7");
    }

    #[test]
    fn test_has_error() {
        let mut row = chat_row();
        assert!(!row.has_error());

        row.response_status_code = Some(429);
        assert!(row.has_error());

        row.response_status_code = None;
        assert!(row.has_error());

        row.response_status_code = Some(200);
        row.error = Some("boom".into());
        assert!(row.has_error());
    }

    #[test]
    fn test_url_and_status() {
        let mut row = chat_row();
        assert_eq!(row.url("http://fallback"), "https://api.example.com/v1/chat/completions");
        row.endpoint = None;
        row.request_query = "a=1".into();
        assert_eq!(row.url("http://fallback"), "http://fallback/v1/chat/completions?a=1");
        assert_eq!(row.status(), "200 OK");
        row.response_status_code = None;
        assert_eq!(row.status(), "");
    }

    #[test]
    fn test_metadata_fields() {
        let row = chat_row();
        let metadata = row.metadata();
        assert_eq!(metadata["moonpalace_id"], "7");
        assert_eq!(metadata["chatcmpl"], "cmpl-1");
        assert_eq!(metadata["status"], "200 OK");
        assert_eq!(metadata["requested_at"], "2024-05-01 10:00:00");
        assert!(!metadata.contains_key("latency"));
    }

    #[test]
    fn test_print_request_writes_http_message() {
        let row = chat_row();
        let mut out = Vec::new();
        row.print_request(&mut out, "").unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("POST https://api.example.com/v1/chat/completions HTTP/1.1\n"));
        assert!(text.contains("Content-Type: application/json\n\n{\n    \"model\": \"m\"\n}\n"));
    }

    #[test]
    fn test_print_response_merges_event_stream() {
        let mut row = chat_row();
        row.response_content_type = Some("text/event-stream".into());
        row.response_body = Some(
            "data: {\"id\":\"cmpl-1\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"a\"}}]}\n\n\
             data: {\"id\":\"cmpl-1\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"b\"}}]}\n\n\
             data: [DONE]\n\n"
                .into(),
        );
        let mut out = Vec::new();
        row.print_response(&mut out, true).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\n"));
        assert!(text.contains("\"content\": \"ab\""));
    }

    #[test]
    fn test_export_embeds_json_bodies() {
        let mut row = chat_row();
        row.category = Some("good".into());
        row.tags = vec!["t1".into()];
        row.response_body = Some("not json".into());

        let exported = serde_json::to_value(row.to_export("")).unwrap();
        assert_eq!(exported["request"]["body"]["model"], "m");
        assert_eq!(exported["request"]["url"], "https://api.example.com/v1/chat/completions");
        assert_eq!(exported["response"]["body"], "not json");
        assert_eq!(exported["response"]["status"], "200 OK");
        assert_eq!(exported["category"], "good");
        assert_eq!(exported["tags"][0], "t1");
        assert!(exported.get("error").is_none());
    }

    #[test]
    fn test_inspection_error_falls_back_to_body() {
        let row = chat_row();
        let inspection = row.inspection();
        assert_eq!(inspection["error"], inspection["response_body"]);
        assert!(inspection["metadata"].contains("\"moonpalace_id\": \"7\""));
    }
}
