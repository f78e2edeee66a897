//! Proxy error types and response handling

use axum::{
    body::Body,
    http::{header, Response, StatusCode},
    response::IntoResponse,
};
use serde_json::json;

use super::record::Failure;

/// Errors that end a request before the upstream response could be relayed
///
/// Each variant names the step of the pipeline that failed; clients see it
/// as `error.type` in a 500 JSON body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ProxyError {
    BodyRead(String),
    RequestBuild(String),
    Upstream(String),
    ResponseRead(String),
}

impl ProxyError {
    pub(crate) fn step(&self) -> &'static str {
        match self {
            ProxyError::BodyRead(_) => "read_request_body",
            ProxyError::RequestBuild(_) => "make_new_request",
            ProxyError::Upstream(_) => "send_new_request",
            ProxyError::ResponseRead(_) => "read_response_body",
        }
    }

    pub(crate) fn message(&self) -> &str {
        match self {
            ProxyError::BodyRead(msg)
            | ProxyError::RequestBuild(msg)
            | ProxyError::Upstream(msg)
            | ProxyError::ResponseRead(msg) => msg,
        }
    }
}

impl From<&ProxyError> for Failure {
    fn from(err: &ProxyError) -> Self {
        Failure::Proxy {
            step: err.step(),
            message: err.message().to_string(),
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response<Body> {
        tracing::error!("Proxy error at {}: {}", self.step(), self.message());

        let mut body = json!({
            "error": {
                "code": "proxy_server_error",
                "type": self.step(),
                "message": self.message(),
            }
        })
        .to_string();
        body.push('\n');

        Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .header(header::CONTENT_TYPE, "application/json; charset=utf-8")
            .body(Body::from(body))
            .unwrap_or_else(|_| Response::new(Body::from("Internal error building error response")))
    }
}
