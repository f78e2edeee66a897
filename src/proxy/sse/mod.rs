// SSE (Server-Sent Events) framing
//
// The upstream streams chat completion chunks as SSE records separated by a
// blank line. Bytes arrive in arbitrary pieces, so `SseSplitter` buffers them
// and hands out complete records. `\n\n`, `\r\n\r\n` and mixed forms all end a
// record; a trailing partial record is flushed by `finish()` at end of stream.
//
// Each record is one or more `field: value` lines. Only `data:` matters here.

use std::borrow::Cow;

/// Sentinel payload that ends an OpenAI-style stream
pub const DONE: &str = "[DONE]";

/// Incremental splitter of an SSE byte stream into records
#[derive(Debug, Default)]
pub struct SseSplitter {
    buf: Vec<u8>,
    /// Bytes before this offset contain no record boundary
    scanned: usize,
}

impl SseSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Take the next complete record, without its terminating blank line
    pub fn next_record(&mut self) -> Option<Vec<u8>> {
        let (end, consumed) = match self.find_boundary() {
            Some(found) => found,
            None => {
                // A boundary can start at most two bytes before the end
                self.scanned = self.buf.len().saturating_sub(2);
                return None;
            }
        };

        let mut record: Vec<u8> = self.buf.drain(..consumed).collect();
        record.truncate(end);
        if record.last() == Some(&b'\r') {
            record.pop();
        }
        self.scanned = 0;
        Some(record)
    }

    /// Take whatever is left once the stream has ended
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        self.scanned = 0;
        let rest = std::mem::take(&mut self.buf);
        if rest.iter().all(|b| b.is_ascii_whitespace()) {
            return None;
        }
        let mut rest = rest;
        while matches!(rest.last(), Some(b'\n' | b'\r')) {
            rest.pop();
        }
        Some(rest)
    }

    /// Position of the first `\n` of a blank-line boundary and the number of
    /// bytes up to and including the boundary
    fn find_boundary(&self) -> Option<(usize, usize)> {
        let buf = &self.buf;
        let mut i = self.scanned;
        while i < buf.len() {
            if buf[i] == b'\n' {
                match (buf.get(i + 1), buf.get(i + 2)) {
                    (Some(b'\n'), _) => return Some((i, i + 2)),
                    (Some(b'\r'), Some(b'\n')) => return Some((i, i + 3)),
                    _ => {}
                }
            }
            i += 1;
        }
        None
    }
}

/// Extract the payload of a single `data:` line, trimmed
pub fn parse_sse_data_line(line: &str) -> Option<&str> {
    let value = line.trim_start().strip_prefix("data:")?;
    Some(value.trim())
}

/// Payload of all `data:` lines in a record, joined with `\n`
///
/// Returns `None` when the record carries no data.
pub fn record_data(record: &str) -> Option<Cow<'_, str>> {
    let mut lines = record
        .split('\n')
        .map(|l| l.trim_end_matches('\r'))
        .filter_map(parse_sse_data_line);

    let first = lines.next()?;
    match lines.next() {
        None => Some(Cow::Borrowed(first)),
        Some(second) => {
            let mut joined = String::with_capacity(record.len());
            joined.push_str(first);
            joined.push('\n');
            joined.push_str(second);
            for line in lines {
                joined.push('\n');
                joined.push_str(line);
            }
            Some(Cow::Owned(joined))
        }
    }
}

/// Media type of a header value, without parameters (`text/html; charset=x` → `text/html`)
pub fn media_type(value: &str) -> &str {
    value
        .split(|c: char| c == ' ' || c == ';')
        .next()
        .unwrap_or(value)
}

/// Check if a response is SSE based on content-type header
pub fn is_sse_response(headers: &reqwest::header::HeaderMap) -> bool {
    headers
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| media_type(ct) == "text/event-stream")
        .unwrap_or(false)
}
