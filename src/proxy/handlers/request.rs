//! Main proxy handler
//!
//! One invocation per inbound request: capture the body, optionally force
//! streaming and attach a context cache, dispatch upstream, relay the response
//! (streamed, collapsed or buffered), then hand the exchange record to a
//! background task for logging and persistence.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::State,
    http::{header, request::Parts, HeaderMap, HeaderValue, Request, Response},
    response::IntoResponse,
};
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use super::buffered;
use super::streaming::{gzip_all, relay_stream, StreamProcessor};
use crate::caching::{compute_checkpoints, hash_key, CacheRequest, RawCacheBody};
use crate::detector::RepeatDetectors;
use crate::logging;
use crate::proxy::error::ProxyError;
use crate::proxy::force_stream::force_stream;
use crate::proxy::helpers::{
    accepts_gzip, bearer_token, content_type, format_headers, forward_headers, header_text,
    is_gzip,
};
use crate::proxy::record::{Exchange, Failure, MshHeaders};
use crate::proxy::sse::is_sse_response;
use crate::proxy::state::{AutoCacheSettings, ProxyState};
use crate::storage::{local_datetime, now_local, CHAT_COMPLETIONS_SUFFIX};

const CONTEXT_CACHE_HEADER: &str = "x-msh-context-cache";
const CONTEXT_CACHE_TTL_HEADER: &str = "x-msh-context-cache-reset-ttl";

/// Buffered client-bound chunks per streamed response
const STREAM_CHANNEL_CAPACITY: usize = 64;

/// An upstream response plus how it should be relayed
struct Dispatched {
    response: reqwest::Response,
    /// The request was switched to streaming behind the client's back
    collapse: bool,
}

/// Main proxy handler - forwards every request upstream and records the exchange
pub async fn proxy_handler(State(state): State<ProxyState>, req: Request<Body>) -> Response<Body> {
    let (parts, body) = req.into_parts();
    let mut exchange = Exchange {
        method: parts.method.to_string(),
        path: parts.uri.path().to_string(),
        query: parts.uri.query().unwrap_or_default().to_string(),
        request_content_type: content_type(&parts.headers),
        request_id: header_text(&parts.headers, "x-request-id"),
        request_header: format_headers(&parts.headers),
        endpoint: state.settings.endpoint.clone(),
        created_at: now_local(),
        ..Default::default()
    };
    let mut clock = Instant::now();

    tracing::debug!("Proxying {} {}", parts.method, parts.uri);

    match dispatch(&state, &parts, body, &mut exchange, &mut clock).await {
        Ok(upstream) => respond(&state, exchange, clock, upstream).await,
        Err(err) => fail(&state, exchange, clock, err),
    }
}

/// Read the inbound request, build the upstream one and send it
///
/// `clock` is reset right before sending, so latency and TTFT are measured
/// from dispatch.
async fn dispatch(
    state: &ProxyState,
    parts: &Parts,
    body: Body,
    exchange: &mut Exchange,
    clock: &mut Instant,
) -> Result<Dispatched, ProxyError> {
    let mut body = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|e| ProxyError::BodyRead(e.to_string()))?;

    let is_chat = exchange.path.ends_with(CHAT_COMPLETIONS_SUFFIX);
    let mut collapse = false;
    if is_chat && state.settings.force_stream {
        let intent = force_stream(&body);
        collapse = !intent.client_wants_stream;
        if let Some(rewritten) = intent.rewritten {
            body = Bytes::from(rewritten);
        }
    }
    exchange.request_body = String::from_utf8_lossy(&body).into_owned();

    let mut url = format!("{}{}", state.settings.endpoint, exchange.path);
    if !exchange.query.is_empty() {
        url.push('?');
        url.push_str(&exchange.query);
    }
    let url = reqwest::Url::parse(&url).map_err(|e| ProxyError::RequestBuild(e.to_string()))?;

    let mut headers = forward_headers(&parts.headers);
    if let Some(key) = &state.settings.key {
        let bearer = HeaderValue::from_str(&format!("Bearer {}", key))
            .map_err(|e| ProxyError::RequestBuild(e.to_string()))?;
        headers.insert(header::AUTHORIZATION, bearer);
    }
    if accepts_gzip(&parts.headers) {
        headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
    }
    if is_chat {
        if let Some(cache) = &state.settings.auto_cache {
            attach_context_cache(state, cache, &body, &mut headers).await;
        }
    }
    exchange.accept_encoding = header_text(&headers, header::ACCEPT_ENCODING);
    exchange.request_header = format_headers(&headers);

    *clock = Instant::now();
    let response = state
        .client
        .request(parts.method.clone(), url)
        .headers(headers)
        .body(body)
        .send()
        .await
        .map_err(|e| ProxyError::Upstream(e.to_string()))?;

    let upstream_headers = response.headers();
    exchange.status = Some(response.status().as_u16());
    exchange.response_content_type = content_type(upstream_headers);
    exchange.content_encoding = header_text(upstream_headers, header::CONTENT_ENCODING);
    exchange.response_header = format_headers(upstream_headers);
    exchange.msh = MshHeaders::from_headers(upstream_headers);

    Ok(Dispatched { response, collapse })
}

/// Relay the upstream response in whichever mode applies
async fn respond(
    state: &ProxyState,
    mut exchange: Exchange,
    clock: Instant,
    upstream: Dispatched,
) -> Response<Body> {
    let Dispatched { response, collapse } = upstream;
    let status = response.status();
    let gzip = is_gzip(response.headers());
    let streaming = is_sse_response(response.headers());

    let mut headers = response.headers().clone();
    headers.remove(header::TRANSFER_ENCODING);
    headers.remove(header::CONNECTION);
    if streaming {
        headers.remove(header::CONTENT_LENGTH);
    }

    let body = if !streaming {
        match buffered::read_body(response).await {
            Ok(body) => {
                exchange.token_finish = Some(clock.elapsed());
                buffered::inspect_body(&body, gzip, &mut exchange);
                finalize(state, exchange, clock);
                Body::from(body)
            }
            Err(err) => return fail(state, exchange, clock, err),
        }
    } else {
        let detectors = state.settings.detect_repeat.map(|settings| {
            (
                settings,
                RepeatDetectors::new(&state.pools.detectors, &state.pools.automata),
            )
        });
        let completion = collapse.then(|| state.pools.completions.checkout());
        let processor = StreamProcessor::new(clock, detectors, completion);

        if collapse {
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json; charset=utf-8"),
            );
            let relay =
                collapse_stream(response, processor, gzip, &mut exchange, clock, &state.shutdown);
            match relay.await {
                Ok(body) => {
                    finalize(state, exchange, clock);
                    Body::from(body)
                }
                Err(err) => return fail(state, exchange, clock, err),
            }
        } else {
            stream_through(state, response, processor, gzip, exchange, clock)
        }
    };

    let mut relayed = Response::new(body);
    *relayed.status_mut() = status;
    *relayed.headers_mut() = headers;
    relayed
}

/// Read the whole stream and answer with one merged completion
async fn collapse_stream(
    response: reqwest::Response,
    mut processor: StreamProcessor,
    gzip: bool,
    exchange: &mut Exchange,
    clock: Instant,
    shutdown: &CancellationToken,
) -> Result<Vec<u8>, ProxyError> {
    let relayed = relay_stream(response, &mut processor, gzip, None, shutdown).await;
    exchange.token_finish = Some(clock.elapsed());
    let body = processor.collapsed_body().unwrap_or_default();
    processor.record_into(exchange);
    relayed?;

    if gzip {
        gzip_all(&body).map_err(|e| ProxyError::ResponseRead(e.to_string()))
    } else {
        Ok(body)
    }
}

/// Forward records as they arrive; the exchange is finalized when the stream ends
fn stream_through(
    state: &ProxyState,
    response: reqwest::Response,
    mut processor: StreamProcessor,
    gzip: bool,
    mut exchange: Exchange,
    clock: Instant,
) -> Body {
    let (tx, rx) = mpsc::channel::<Bytes>(STREAM_CHANNEL_CAPACITY);
    let task_state = state.clone();

    state.tracker.spawn(async move {
        let shutdown = &task_state.shutdown;
        let relayed = relay_stream(response, &mut processor, gzip, Some(&tx), shutdown).await;
        drop(tx);

        exchange.token_finish = Some(clock.elapsed());
        processor.record_into(&mut exchange);
        if let Err(err) = relayed {
            tracing::warn!("Stream relay failed: {}", err.message());
            exchange.failure = Some(Failure::from(&err));
        }
        finalize(&task_state, exchange, clock);
    });

    Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>))
}

fn fail(state: &ProxyState, mut exchange: Exchange, clock: Instant, err: ProxyError) -> Response<Body> {
    exchange.failure = Some(Failure::from(&err));
    finalize(state, exchange, clock);
    err.into_response()
}

/// Settle latency and upstream errors, then log and persist off the client path
fn finalize(state: &ProxyState, mut exchange: Exchange, clock: Instant) {
    exchange.latency = match exchange.token_finish {
        Some(finish) if !finish.is_zero() => finish,
        _ => clock.elapsed(),
    };
    if exchange.failure.is_none() {
        if let Some(status) = exchange.status.filter(|s| !(200..300).contains(s)) {
            tracing::debug!("Upstream answered {}", status);
            exchange.failure = Some(Failure::Upstream {
                message: exchange.response_body.clone(),
            });
        }
    }

    let store = Arc::clone(&state.store);
    let log_lock = Arc::clone(&state.log_lock);
    state.tracker.spawn(async move {
        {
            let _guard = log_lock.lock().await;
            tracing::info!("{}", logging::exchange_block(&exchange));
        }

        let row = exchange.to_new_request();
        match tokio::task::spawn_blocking(move || store.insert_request(&row)).await {
            Ok(Ok(id)) => tracing::info!("  New Row Inserted: last_insert_id={}", id),
            Ok(Err(e)) => tracing::error!("Failed to persist exchange: {:#}", e),
            Err(e) => tracing::error!("Persistence task panicked: {}", e),
        }
    });
}

/// Local time `age` ago, in the storage format
///
/// An age too large to represent yields an empty string, which sorts before
/// every stored timestamp.
fn ago(age: Duration) -> String {
    i64::try_from(age.as_secs())
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .and_then(|age| chrono::Local::now().checked_sub_signed(age))
        .map(local_datetime)
        .unwrap_or_default()
}

/// Reuse or create an upstream context cache for this conversation prefix
///
/// Every failure here is logged and swallowed; the request goes out without
/// cache headers instead.
async fn attach_context_cache(
    state: &ProxyState,
    cache: &AutoCacheSettings,
    body: &[u8],
    headers: &mut HeaderMap,
) {
    let key = match &state.settings.key {
        Some(key) => key.clone(),
        None => bearer_token(headers),
    };
    let key_hash = hash_key(&state.pools.hashes, &key);

    let store = Arc::clone(&state.store);
    let (prune_hash, before) = (key_hash.clone(), ago(cache.cleanup));
    state.tracker.spawn_blocking(move || {
        match store.remove_inactive_caches(&prune_hash, &before) {
            Ok(0) => {}
            Ok(n) => tracing::debug!("Pruned {} inactive context caches", n),
            Err(e) => tracing::debug!("Failed to prune context caches: {:#}", e),
        }
    });

    let Ok(request) = serde_json::from_slice::<CacheRequest>(body) else {
        return;
    };
    let raw = serde_json::from_slice::<RawCacheBody>(body).ok();
    let tools = raw
        .as_ref()
        .and_then(|raw| raw.tools)
        .map(|tools| tools.get().as_bytes())
        .unwrap_or_default();

    let (checkpoints, n_bytes) =
        compute_checkpoints(&state.pools.hashes, cache.min_bytes, tools, &request.messages);
    let Some(last) = checkpoints.last().cloned() else {
        return;
    };

    let store = Arc::clone(&state.store);
    let lookup_hash = key_hash.clone();
    let found = tokio::task::spawn_blocking(move || {
        store.get_cache_by_hash_list(&checkpoints, n_bytes / 2, &lookup_hash)
    })
    .await;

    let cache_id = match found {
        Ok(Ok(Some(id))) => match state.caching.get(&key, &id).await {
            Ok(existing) if existing.is_usable() => {
                let store = Arc::clone(&state.store);
                let touched = id.clone();
                state.tracker.spawn_blocking(move || {
                    if let Err(e) = store.touch_cache(&touched, &now_local()) {
                        tracing::debug!("Failed to touch context cache: {:#}", e);
                    }
                });
                Some(id)
            }
            Ok(existing) => {
                tracing::debug!("Context cache {} is in state {}", id, existing.status);
                let caching = state.caching.clone();
                let shutdown = state.shutdown.clone();
                let key = key.clone();
                state.tracker.spawn(async move {
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        deleted = caching.delete(&key, &id) => {
                            if let Err(e) = deleted {
                                tracing::debug!("Failed to delete broken context cache: {:#}", e);
                            }
                        }
                    }
                });
                None
            }
            Err(e) => {
                tracing::debug!("Failed to fetch context cache {}: {:#}", id, e);
                None
            }
        },
        Ok(Ok(None)) => {
            let Some(raw) = raw else {
                return;
            };
            match state.caching.create(&key, raw.messages, raw.tools, cache.ttl).await {
                Ok(created) => {
                    let store = Arc::clone(&state.store);
                    let id = created.id.clone();
                    let saved = tokio::task::spawn_blocking(move || {
                        store.set_cache(&id, &last, n_bytes, &key_hash, &now_local())
                    })
                    .await;
                    match saved {
                        Ok(Ok(())) => Some(created.id),
                        Ok(Err(e)) => {
                            tracing::debug!("Failed to store context cache: {:#}", e);
                            None
                        }
                        Err(e) => {
                            tracing::debug!("Context cache store task failed: {}", e);
                            None
                        }
                    }
                }
                Err(e) => {
                    tracing::debug!("Failed to create context cache: {:#}", e);
                    None
                }
            }
        }
        Ok(Err(e)) => {
            tracing::debug!("Context cache lookup failed: {:#}", e);
            None
        }
        Err(e) => {
            tracing::debug!("Context cache lookup task failed: {}", e);
            None
        }
    };

    if let Some(id) = cache_id {
        if let Ok(value) = HeaderValue::from_str(&id) {
            headers.insert(CONTEXT_CACHE_HEADER, value);
            headers.insert(CONTEXT_CACHE_TTL_HEADER, HeaderValue::from(cache.ttl.as_secs()));
        }
    }
}
