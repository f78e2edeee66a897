//! Streaming (SSE) response handling
//!
//! [`StreamProcessor`] is the synchronous core: it takes decoded upstream
//! bytes, splits them into records, and decides what the client sees. It
//! tracks the completion id, TTFT and usage, runs repeat detection per choice,
//! and in collapse mode merges every chunk into one completion object instead
//! of forwarding records.
//!
//! [`relay_stream`] drives a processor from a live upstream response,
//! handling gzip in both directions.

use std::io::Write;
use std::time::Instant;

use bytes::Bytes;
use flate2::{write::GzDecoder, write::GzEncoder, Compression};
use futures::StreamExt;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{length_warning, Completion, REPEAT_WARNING};
use crate::detector::{RepeatDetectors, RepeatSettings};
use crate::merge::CHAT_COMPLETION;
use crate::pool::Pooled;
use crate::proxy::error::ProxyError;
use crate::proxy::record::{push_warning, Exchange, Usage};
use crate::proxy::sse::{record_data, SseSplitter, DONE};

/// Whether the upstream should keep being read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Flow {
    Continue,
    /// A repeat was detected and the stream has been terminated
    Stop,
}

pub(super) struct StreamProcessor {
    splitter: SseSplitter,
    detectors: Option<(RepeatSettings, RepeatDetectors)>,
    /// Present in collapse mode
    completion: Option<Pooled<Map<String, Value>>>,
    dispatched: Instant,
    stopped: bool,

    raw: Vec<u8>,
    moonshot_id: String,
    usage: Option<Usage>,
    ttft_ms: i64,
    warnings: Vec<String>,
}

impl StreamProcessor {
    pub(super) fn new(
        dispatched: Instant,
        detectors: Option<(RepeatSettings, RepeatDetectors)>,
        completion: Option<Pooled<Map<String, Value>>>,
    ) -> Self {
        Self {
            splitter: SseSplitter::new(),
            detectors,
            completion,
            dispatched,
            stopped: false,
            raw: Vec::new(),
            moonshot_id: String::new(),
            usage: None,
            ttft_ms: 0,
            warnings: Vec::new(),
        }
    }

    fn collapsing(&self) -> bool {
        self.completion.is_some()
    }

    /// Feed decoded upstream bytes; client-bound bytes are appended to `out`
    pub(super) fn push(&mut self, bytes: &[u8], out: &mut Vec<u8>) -> Flow {
        if self.stopped {
            return Flow::Stop;
        }
        self.splitter.push(bytes);
        while let Some(record) = self.splitter.next_record() {
            if self.handle_record(&record, out) == Flow::Stop {
                self.stopped = true;
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    /// Flush a trailing record once the upstream has ended
    pub(super) fn finish(&mut self, out: &mut Vec<u8>) {
        if self.stopped {
            return;
        }
        if let Some(record) = self.splitter.finish() {
            if self.handle_record(&record, out) == Flow::Stop {
                self.stopped = true;
            }
        }
    }

    fn handle_record(&mut self, record: &[u8], out: &mut Vec<u8>) -> Flow {
        if !self.collapsing() {
            out.extend_from_slice(record);
            out.extend_from_slice(b"\n\n");
        }
        if record.iter().all(u8::is_ascii_whitespace) {
            return Flow::Continue;
        }
        self.raw.extend_from_slice(record);
        self.raw.extend_from_slice(b"\n\n");

        let Ok(text) = std::str::from_utf8(record) else {
            return Flow::Continue;
        };
        let Some(data) = record_data(text) else {
            return Flow::Continue;
        };
        if data == DONE {
            return Flow::Continue;
        }

        if let Some(completion) = self.completion.as_mut() {
            if let Ok(chunk) = serde_json::from_str::<Map<String, Value>>(&data) {
                CHAT_COMPLETION.merge_object(completion, chunk);
            }
        }

        match serde_json::from_str::<Completion>(&data) {
            Ok(chunk) if !chunk.id.is_empty() => self.observe(&chunk, out),
            _ => Flow::Continue,
        }
    }

    fn observe(&mut self, chunk: &Completion, out: &mut Vec<u8>) -> Flow {
        self.moonshot_id.clone_from(&chunk.id);
        if let Some(usage) = chunk.usage {
            self.usage = Some(usage);
        }

        for choice in &chunk.choices {
            let delta = choice.delta.as_ref();
            if self.ttft_ms == 0 && delta.is_some_and(|d| d.has_stream_token()) {
                self.ttft_ms = self.dispatched.elapsed().as_millis() as i64;
            }

            if let Some(choice_usage) = choice.usage {
                match self.usage.as_mut() {
                    None => self.usage = Some(choice_usage),
                    Some(usage) => {
                        usage.completion_tokens += choice_usage.completion_tokens;
                        usage.total_tokens += choice_usage.completion_tokens;
                    }
                }
            }

            if choice.finished_by_length() {
                push_warning(&mut self.warnings, length_warning(None));
            }

            let repeating = match self.detectors.as_mut() {
                Some((settings, detectors)) => detectors.observe(
                    choice.index,
                    choice.finish_reason.as_deref(),
                    delta.map(|d| d.content()).unwrap_or_default(),
                    settings,
                ),
                None => false,
            };
            if repeating {
                push_warning(&mut self.warnings, REPEAT_WARNING.to_string());
                self.terminate(chunk, out);
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    /// End the stream after a repeat: a `repeat` finish for every open choice,
    /// then a single `[DONE]`
    fn terminate(&mut self, chunk: &Completion, out: &mut Vec<u8>) {
        let unfinished = self
            .detectors
            .as_ref()
            .map(|(_, d)| d.unfinished())
            .unwrap_or_default();

        for index in unfinished {
            let finish = json!({
                "choices": [{"delta": {}, "finish_reason": "repeat", "index": index}],
                "created": chunk.created,
                "id": chunk.id,
                "model": chunk.model,
                "object": chunk.object,
            });
            let encoded = finish.to_string();
            self.raw.extend_from_slice(b"data: ");
            self.raw.extend_from_slice(encoded.as_bytes());
            self.raw.extend_from_slice(b"\n\n");

            match (self.completion.as_mut(), finish) {
                (Some(completion), Value::Object(finish)) => {
                    CHAT_COMPLETION.merge_object(completion, finish);
                }
                _ => {
                    out.extend_from_slice(b"data: ");
                    out.extend_from_slice(encoded.as_bytes());
                    out.extend_from_slice(b"\n\n");
                }
            }
        }

        let done = format!("data: {}\n\n", DONE);
        self.raw.extend_from_slice(done.as_bytes());
        if !self.collapsing() {
            out.extend_from_slice(done.as_bytes());
        }
    }

    /// The merged completion as a JSON document, each `delta` renamed to `message`
    ///
    /// `None` outside of collapse mode.
    pub(super) fn collapsed_body(&mut self) -> Option<Vec<u8>> {
        let completion = self.completion.as_mut()?;
        if let Some(Value::Array(choices)) = completion.get_mut("choices") {
            for choice in choices.iter_mut().filter_map(Value::as_object_mut) {
                if let Some(delta) = choice.remove("delta") {
                    choice.insert("message".into(), delta);
                }
            }
        }
        let mut body = serde_json::to_vec(&**completion).unwrap_or_default();
        body.push(b'\n');
        Some(body)
    }

    /// Move what was learned from the stream into the exchange record
    pub(super) fn record_into(self, exchange: &mut Exchange) {
        exchange.response_body = String::from_utf8_lossy(&self.raw).into_owned();
        exchange.moonshot_id = self.moonshot_id;
        exchange.usage = self.usage;
        exchange.ttft_ms = self.ttft_ms;
        for warning in self.warnings {
            exchange.warn(warning);
        }
    }
}

/// Gzip for the client side of a relayed stream, flushed after every write
pub(super) struct Recompressor(GzEncoder<Vec<u8>>);

impl Recompressor {
    pub(super) fn new() -> Self {
        Self(GzEncoder::new(Vec::new(), Compression::best()))
    }

    pub(super) fn encode(&mut self, plain: &[u8]) -> std::io::Result<Vec<u8>> {
        self.0.write_all(plain)?;
        self.0.flush()?;
        Ok(std::mem::take(self.0.get_mut()))
    }

    pub(super) fn finish(self) -> std::io::Result<Vec<u8>> {
        self.0.finish()
    }
}

/// Gzip-compress a complete body
pub(super) fn gzip_all(plain: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = Recompressor::new();
    let mut out = encoder.encode(plain)?;
    out.extend(encoder.finish()?);
    Ok(out)
}

/// Pump an upstream SSE response through `processor`
///
/// Client-bound bytes go to `tx` (re-gzipped when the upstream was gzip). With
/// no `tx` the processor is collapsing and nothing is sent. Reading stops when
/// the processor stops or the client goes away, and fails once `shutdown` is
/// cancelled.
pub(super) async fn relay_stream(
    response: reqwest::Response,
    processor: &mut StreamProcessor,
    gzip: bool,
    tx: Option<&mpsc::Sender<Bytes>>,
    shutdown: &CancellationToken,
) -> Result<(), ProxyError> {
    let read_error = |e: std::io::Error| ProxyError::ResponseRead(e.to_string());
    let shutting_down = || ProxyError::ResponseRead("proxy is shutting down".to_string());

    let mut decoder = gzip.then(|| GzDecoder::new(Vec::new()));
    let mut encoder = (gzip && tx.is_some()).then(Recompressor::new);
    let mut upstream = response.bytes_stream();
    let mut out = Vec::new();
    let mut client_gone = false;

    let send = |out: &mut Vec<u8>, encoder: &mut Option<Recompressor>| {
        let bytes = match encoder.as_mut() {
            Some(encoder) => encoder.encode(out).map_err(read_error)?,
            None => out.clone(),
        };
        out.clear();
        Ok::<_, ProxyError>(bytes)
    };

    let mut flow = Flow::Continue;
    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Err(shutting_down()),
            next = upstream.next() => next,
        };
        let Some(chunk) = next else {
            break;
        };
        let chunk = chunk.map_err(|e| ProxyError::ResponseRead(e.to_string()))?;
        flow = match decoder.as_mut() {
            Some(decoder) => {
                decoder.write_all(&chunk).map_err(read_error)?;
                let plain = std::mem::take(decoder.get_mut());
                processor.push(&plain, &mut out)
            }
            None => processor.push(&chunk, &mut out),
        };

        if let Some(tx) = tx {
            if !out.is_empty() {
                let bytes = send(&mut out, &mut encoder)?;
                let sent = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => return Err(shutting_down()),
                    sent = tx.send(Bytes::from(bytes)) => sent,
                };
                if sent.is_err() {
                    tracing::debug!("Client disconnected mid-stream");
                    client_gone = true;
                    break;
                }
            }
        }
        if flow == Flow::Stop {
            break;
        }
    }

    if flow == Flow::Continue && !client_gone {
        if let Some(decoder) = decoder.take() {
            let rest = decoder.finish().map_err(read_error)?;
            processor.push(&rest, &mut out);
        }
        processor.finish(&mut out);
    }

    if let Some(tx) = tx {
        if client_gone {
            return Ok(());
        }
        let mut tail = if out.is_empty() {
            Vec::new()
        } else {
            send(&mut out, &mut encoder)?
        };
        if let Some(encoder) = encoder.take() {
            tail.extend(encoder.finish().map_err(read_error)?);
        }
        if !tail.is_empty() {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Err(shutting_down()),
                _ = tx.send(Bytes::from(tail)) => {}
            }
        }
    }
    Ok(())
}
