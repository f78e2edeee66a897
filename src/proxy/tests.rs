// End-to-end tests: a real router in front of an in-process mock upstream

use std::convert::Infallible;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use futures::StreamExt;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_util::task::TaskTracker;
use tower::ServiceExt;

use super::server::{build_client, router, serve};
use super::state::{AutoCacheSettings, ProxySettings, ProxyState};
use crate::detector::RepeatSettings;
use crate::storage::{ListFilter, Persistence, SqliteStore, StoredRequest};

/// What the mock upstream saw
#[derive(Default)]
struct Seen {
    /// `X-Msh-Context-Cache` of every chat request
    cache_headers: Vec<Option<String>>,
    /// `stream` field of every chat request body
    stream_flags: Vec<Option<bool>>,
    /// `Accept-Encoding` of every chat request
    accept_encodings: Vec<Option<String>>,
    caches_created: usize,
}

type Shared = Arc<Mutex<Seen>>;

fn chunk(content: &str) -> String {
    choice_chunk(0, content)
}

fn choice_chunk(index: u32, content: &str) -> String {
    let chunk = json!({
        "id": "cmpl-1",
        "object": "chat.completion.chunk",
        "created": 1700000000,
        "model": "moonshot-v1-8k",
        "choices": [{"index": index, "delta": {"content": content}}],
    });
    format!("data: {}\n\n", chunk)
}

fn gzip(plain: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(plain).unwrap();
    encoder.finish().unwrap()
}

fn gunzip(compressed: &[u8]) -> String {
    let mut plain = String::new();
    GzDecoder::new(compressed).read_to_string(&mut plain).unwrap();
    plain
}

/// One record every 100ms for 30s
fn slow_stream() -> Body {
    let ticks = futures::stream::unfold(0u32, |n| async move {
        if n >= 300 {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        Some((Ok::<_, Infallible>(chunk("tick")), n + 1))
    });
    Body::from_stream(ticks)
}

/// SSE records of every `data:` payload in `body`, parsed
fn payloads(body: &str) -> Vec<Value> {
    body.split("\n\n")
        .filter_map(|record| record.strip_prefix("data: "))
        .filter(|data| *data != "[DONE]")
        .map(|data| serde_json::from_str(data).unwrap())
        .collect()
}

async fn chat(State(seen): State<Shared>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    {
        let mut seen = seen.lock().unwrap();
        seen.cache_headers.push(
            headers
                .get("x-msh-context-cache")
                .and_then(|v| v.to_str().ok())
                .map(String::from),
        );
        seen.stream_flags.push(body.get("stream").and_then(Value::as_bool));
        seen.accept_encodings.push(
            headers
                .get(header::ACCEPT_ENCODING)
                .and_then(|v| v.to_str().ok())
                .map(String::from),
        );
    }
    let model = body.get("model").and_then(Value::as_str).unwrap_or_default();

    let upstream_headers = [("msh-request-id", "req-1"), ("server-timing", "inner; dur=1234")];
    if body.get("stream").and_then(Value::as_bool) != Some(true) {
        let completion = json!({
            "id": "cmpl-1",
            "object": "chat.completion",
            "created": 1700000000,
            "model": "moonshot-v1-8k",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "Hello"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 5, "completion_tokens": 2, "total_tokens": 7},
        });
        return (upstream_headers, Json(completion)).into_response();
    }

    if model == "slow" {
        return ([(header::CONTENT_TYPE, "text/event-stream")], slow_stream()).into_response();
    }

    let mut stream = String::new();
    if model == "repeat" {
        for _ in 0..40 {
            stream.push_str(&chunk("ab"));
        }
    } else if model == "repeat-two-choices" {
        let words = ["The ", "quick ", "brown ", "fox ", "jumps ", "over ", "the ", "lazy ", "dog."];
        for i in 0..150 {
            stream.push_str(&choice_chunk(0, "a"));
            if let Some(word) = words.get(i) {
                stream.push_str(&choice_chunk(1, word));
            }
        }
    } else {
        stream.push_str(&chunk("Hel"));
        stream.push_str(&chunk("lo"));
        let last = json!({
            "id": "cmpl-1",
            "object": "chat.completion.chunk",
            "created": 1700000000,
            "model": "moonshot-v1-8k",
            "choices": [{"index": 0, "delta": {}, "finish_reason": "stop",
                "usage": {"prompt_tokens": 5, "completion_tokens": 2, "total_tokens": 7}}],
        });
        stream.push_str(&format!("data: {}\n\n", last));
    }
    stream.push_str("data: [DONE]\n\n");

    if model == "gzip" {
        return (
            upstream_headers,
            [
                (header::CONTENT_TYPE, "text/event-stream"),
                (header::CONTENT_ENCODING, "gzip"),
            ],
            gzip(stream.as_bytes()),
        )
            .into_response();
    }

    (
        upstream_headers,
        [(header::CONTENT_TYPE, "text/event-stream")],
        stream,
    )
        .into_response()
}

async fn create_cache(State(seen): State<Shared>) -> Json<Value> {
    seen.lock().unwrap().caches_created += 1;
    Json(json!({"id": "cache-1", "status": "pending"}))
}

async fn get_cache(Path(id): Path<String>) -> Json<Value> {
    Json(json!({"id": id, "status": "ready"}))
}

async fn spawn_upstream(seen: Shared) -> String {
    let app = Router::new()
        .route("/v1/chat/completions", post(chat))
        .route("/v1/caching", post(create_cache))
        .route("/v1/caching/:id", get(get_cache))
        .route(
            "/v1/models",
            get(|| async { (StatusCode::UNAUTHORIZED, r#"{"error":{"message":"bad key"}}"#) }),
        )
        .with_state(seen);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn settings(endpoint: String) -> ProxySettings {
    ProxySettings {
        endpoint,
        key: None,
        detect_repeat: None,
        force_stream: false,
        auto_cache: None,
    }
}

struct Harness {
    _dir: TempDir,
    store: Arc<SqliteStore>,
    tracker: TaskTracker,
    app: Router,
}

impl Harness {
    fn new(settings: ProxySettings) -> Self {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SqliteStore::open(dir.path().join("moonpalace.sqlite")).unwrap());
        let tracker = TaskTracker::new();
        let state = ProxyState::new(
            build_client().unwrap(),
            settings,
            store.clone(),
            tracker.clone(),
        );
        Self {
            _dir: dir,
            store,
            tracker,
            app: router(state),
        }
    }

    async fn send(&self, method: &str, path: &str, body: Value) -> (StatusCode, HeaderMap, Vec<u8>) {
        self.send_request(request(method, path, body)).await
    }

    async fn send_request(&self, request: Request<Body>) -> (StatusCode, HeaderMap, Vec<u8>) {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec();
        (status, headers, body)
    }

    /// Wait for background logging and persistence, then read every row
    async fn rows(self) -> Vec<StoredRequest> {
        self.tracker.close();
        tokio::time::timeout(Duration::from_secs(10), self.tracker.wait())
            .await
            .unwrap();
        self.store.list_requests(&ListFilter::default()).unwrap()
    }
}

fn request(method: &str, path: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::AUTHORIZATION, "Bearer sk-test")
        .header("x-request-id", "client-req")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn gzip_request(body: Value) -> Request<Body> {
    let mut request = request("POST", "/v1/chat/completions", body);
    request
        .headers_mut()
        .insert(header::ACCEPT_ENCODING, "gzip, deflate".parse().unwrap());
    request
}

fn chat_body(model: &str, stream: Option<bool>) -> Value {
    let mut body = json!({
        "model": model,
        "messages": [{"role": "user", "content": "hi"}],
    });
    if let Some(stream) = stream {
        body["stream"] = json!(stream);
    }
    body
}

#[tokio::test]
async fn test_buffered_chat_is_persisted_once() {
    let seen = Shared::default();
    let endpoint = spawn_upstream(seen.clone()).await;
    let harness = Harness::new(settings(endpoint));

    let (status, _, body) = harness
        .send("POST", "/v1/chat/completions?trace=1", chat_body("moonshot-v1-8k", None))
        .await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["choices"][0]["message"]["content"], "Hello");

    let rows = harness.rows().await;
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row.moonshot_id.as_deref(), Some("cmpl-1"));
    assert_eq!(row.moonshot_request_id.as_deref(), Some("req-1"));
    assert_eq!(row.moonshot_server_timing, Some(1234));
    assert_eq!(row.request_id.as_deref(), Some("client-req"));
    assert_eq!(row.request_query, "trace=1");
    assert_eq!(row.response_status_code, Some(200));
    assert_eq!(row.error, None);
    assert!(!row
        .request_header
        .as_deref()
        .unwrap_or_default()
        .contains("sk-test"));
}

#[tokio::test]
async fn test_force_stream_collapses_for_non_streaming_client() {
    let seen = Shared::default();
    let endpoint = spawn_upstream(seen.clone()).await;
    let mut settings = settings(endpoint);
    settings.force_stream = true;
    let harness = Harness::new(settings);

    let (status, headers, body) = harness
        .send("POST", "/v1/chat/completions", chat_body("moonshot-v1-8k", None))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        headers.get(header::CONTENT_TYPE).unwrap(),
        "application/json; charset=utf-8"
    );
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["id"], "cmpl-1");
    assert_eq!(body["choices"][0]["message"]["content"], "Hello");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert!(body["choices"][0].get("delta").is_none());
    assert_eq!(seen.lock().unwrap().stream_flags, vec![Some(true)]);

    let rows = harness.rows().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].moonshot_id.as_deref(), Some("cmpl-1"));
    assert_eq!(rows[0].response_content_type.as_deref(), Some("text/event-stream"));
}

#[tokio::test]
async fn test_streaming_client_gets_records_verbatim() {
    let seen = Shared::default();
    let endpoint = spawn_upstream(seen.clone()).await;
    let mut settings = settings(endpoint);
    settings.force_stream = true;
    let harness = Harness::new(settings);

    let (status, headers, body) = harness
        .send("POST", "/v1/chat/completions", chat_body("moonshot-v1-8k", Some(true)))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers.get(header::CONTENT_LENGTH).is_none());
    let body = String::from_utf8(body).unwrap();
    assert!(body.starts_with(&chunk("Hel")));
    assert!(body.ends_with("data: [DONE]\n\n"));

    let rows = harness.rows().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].moonshot_id.as_deref(), Some("cmpl-1"));
}

#[tokio::test]
async fn test_repeat_aborts_stream_with_warning() {
    let seen = Shared::default();
    let endpoint = spawn_upstream(seen.clone()).await;
    let mut settings = settings(endpoint);
    settings.detect_repeat = Some(RepeatSettings {
        threshold: 0.5,
        min_length: 10,
    });
    let harness = Harness::new(settings);

    let (status, _, body) = harness
        .send("POST", "/v1/chat/completions", chat_body("repeat", Some(true)))
        .await;
    assert_eq!(status, StatusCode::OK);
    let body = String::from_utf8(body).unwrap();
    assert!(body.contains(r#""finish_reason":"repeat""#), "no repeat finish in {body}");
    assert!(body.ends_with("data: [DONE]\n\n"));
    assert_eq!(body.matches("[DONE]").count(), 1);
    assert!(body.matches("\"ab\"").count() < 40);

    let rows = harness.rows().await;
    assert_eq!(rows.len(), 1);
    let warnings = rows[0].warnings.as_deref().unwrap_or_default();
    assert!(warnings.contains("content repeating"), "warnings: {warnings}");
}

#[tokio::test]
async fn test_upstream_error_passes_through() {
    let seen = Shared::default();
    let endpoint = spawn_upstream(seen).await;
    let harness = Harness::new(settings(endpoint));

    let (status, _, body) = harness.send("GET", "/v1/models", Value::Null).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body, br#"{"error":{"message":"bad key"}}"#);

    let rows = harness.rows().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].response_status_code, Some(401));
    // Upstream errors are not proxy errors
    assert_eq!(rows[0].error, None);
}

#[tokio::test]
async fn test_unreachable_upstream_is_a_proxy_error() {
    // Grab a free port, then close it so nothing is listening
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);
    let harness = Harness::new(settings(endpoint));

    let (status, headers, body) = harness
        .send("POST", "/v1/chat/completions", chat_body("moonshot-v1-8k", None))
        .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        headers.get(header::CONTENT_TYPE).unwrap(),
        "application/json; charset=utf-8"
    );
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["error"]["code"], "proxy_server_error");
    assert_eq!(body["error"]["type"], "send_new_request");

    let rows = harness.rows().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].response_status_code, None);
    assert!(rows[0].error.is_some());
}

#[tokio::test]
async fn test_auto_cache_creates_then_reuses() {
    let seen = Shared::default();
    let endpoint = spawn_upstream(seen.clone()).await;
    let mut settings = settings(endpoint);
    settings.auto_cache = Some(AutoCacheSettings {
        min_bytes: 8,
        ttl: Duration::from_secs(60),
        cleanup: Duration::from_secs(86400),
    });
    let harness = Harness::new(settings);

    let body = json!({
        "model": "moonshot-v1-8k",
        "messages": [
            {"role": "system", "content": "You are a helpful assistant with a long prompt."},
            {"role": "user", "content": "hi"},
        ],
    });
    for _ in 0..2 {
        let (status, _, _) = harness.send("POST", "/v1/chat/completions", body.clone()).await;
        assert_eq!(status, StatusCode::OK);
    }

    {
        let seen = seen.lock().unwrap();
        assert_eq!(seen.caches_created, 1);
        assert_eq!(
            seen.cache_headers,
            vec![Some("cache-1".to_string()), Some("cache-1".to_string())]
        );
    }
    assert_eq!(harness.rows().await.len(), 2);
}

#[tokio::test]
async fn test_repeat_finishes_every_unfinished_choice() {
    let seen = Shared::default();
    let endpoint = spawn_upstream(seen).await;
    let mut settings = settings(endpoint);
    settings.detect_repeat = Some(RepeatSettings {
        threshold: 0.5,
        min_length: 100,
    });
    let harness = Harness::new(settings);

    let (status, _, body) = harness
        .send(
            "POST",
            "/v1/chat/completions",
            chat_body("repeat-two-choices", Some(true)),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let body = String::from_utf8(body).unwrap();
    assert!(body.ends_with("data: [DONE]\n\n"));
    assert_eq!(body.matches("[DONE]").count(), 1);

    let mut repeat_indices: Vec<u64> = payloads(&body)
        .iter()
        .flat_map(|payload| payload["choices"].as_array().cloned().unwrap_or_default())
        .filter(|choice| choice["finish_reason"] == "repeat")
        .filter_map(|choice| choice["index"].as_u64())
        .collect();
    repeat_indices.sort_unstable();
    assert_eq!(repeat_indices, vec![0, 1]);

    // Cut off shortly after the minimum length, long before all 150 tokens
    let forwarded = payloads(&body)
        .iter()
        .filter(|payload| payload["choices"][0]["delta"]["content"] == "a")
        .count();
    assert!(forwarded > 100 && forwarded < 150, "forwarded {forwarded}");

    let rows = harness.rows().await;
    assert_eq!(rows.len(), 1);
    let warnings = rows[0].warnings.as_deref().unwrap_or_default();
    assert!(warnings.contains("content repeating"), "warnings: {warnings}");
}

#[tokio::test]
async fn test_gzip_stream_is_decoded_and_recompressed() {
    let seen = Shared::default();
    let endpoint = spawn_upstream(seen.clone()).await;
    let harness = Harness::new(settings(endpoint));

    let (status, headers, body) = harness
        .send_request(gzip_request(chat_body("gzip", Some(true))))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get(header::CONTENT_ENCODING).unwrap(), "gzip");

    let plain = gunzip(&body);
    assert!(plain.starts_with(&chunk("Hel")));
    assert!(plain.ends_with("data: [DONE]\n\n"));
    assert_eq!(
        seen.lock().unwrap().accept_encodings,
        vec![Some("gzip".to_string())]
    );

    let rows = harness.rows().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].moonshot_id.as_deref(), Some("cmpl-1"));
    let stored = rows[0].response_body.as_deref().unwrap_or_default();
    assert!(stored.contains("Hel"), "stored body: {stored}");
}

#[tokio::test]
async fn test_gzip_stream_collapses_to_gzip_json() {
    let seen = Shared::default();
    let endpoint = spawn_upstream(seen.clone()).await;
    let mut settings = settings(endpoint);
    settings.force_stream = true;
    let harness = Harness::new(settings);

    let (status, headers, body) = harness
        .send_request(gzip_request(chat_body("gzip", None)))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get(header::CONTENT_ENCODING).unwrap(), "gzip");
    assert_eq!(
        headers.get(header::CONTENT_TYPE).unwrap(),
        "application/json; charset=utf-8"
    );

    let body: Value = serde_json::from_str(&gunzip(&body)).unwrap();
    assert_eq!(body["choices"][0]["message"]["content"], "Hello");
    assert_eq!(seen.lock().unwrap().stream_flags, vec![Some(true)]);
    assert_eq!(harness.rows().await.len(), 1);
}

#[tokio::test]
async fn test_client_disconnect_stops_upstream_read() {
    let seen = Shared::default();
    let endpoint = spawn_upstream(seen).await;
    let harness = Harness::new(settings(endpoint));

    let response = harness
        .app
        .clone()
        .oneshot(request("POST", "/v1/chat/completions", chat_body("slow", Some(true))))
        .await
        .unwrap();
    let mut body = response.into_body().into_data_stream();
    let first = body.next().await.unwrap().unwrap();
    assert!(first.starts_with(b"data: "));
    drop(body);

    // The upstream would keep going for 30s; the relay must notice the drop
    let rows = harness.rows().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].error, None);
    let stored = rows[0].response_body.as_deref().unwrap_or_default();
    assert!(stored.matches("tick").count() < 50, "stored body: {stored}");
}

#[tokio::test]
async fn test_shutdown_cuts_off_long_streams() {
    let seen = Shared::default();
    let endpoint = spawn_upstream(seen).await;
    let dir = TempDir::new().unwrap();
    let store = Arc::new(SqliteStore::open(dir.path().join("moonpalace.sqlite")).unwrap());
    let state = ProxyState::new(
        build_client().unwrap(),
        settings(endpoint),
        store.clone(),
        TaskTracker::new(),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(serve(
        listener,
        state,
        async move {
            let _ = stop_rx.await;
        },
        Duration::from_millis(200),
    ));

    let response = reqwest::Client::new()
        .post(format!("http://{}/v1/chat/completions", addr))
        .json(&chat_body("slow", Some(true)))
        .send()
        .await
        .unwrap();
    let mut body = response.bytes_stream();
    let first = body.next().await.unwrap().unwrap();
    assert!(first.starts_with(b"data: "));

    let started = Instant::now();
    stop_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("shutdown exceeded its bound")
        .unwrap()
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));

    // The client stream ends instead of following the upstream for 30s
    let drained = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(Ok(_)) = body.next().await {}
    })
    .await;
    assert!(drained.is_ok());

    let rows = store.list_requests(&ListFilter::default()).unwrap();
    assert_eq!(rows.len(), 1);
    let error = rows[0].error.as_deref().unwrap_or_default();
    assert!(error.contains("shutting down"), "error: {error}");
}
