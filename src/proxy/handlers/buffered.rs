//! Buffered (non-streaming) response handling

use std::io::Read;

use bytes::Bytes;

use super::{length_warning, Completion};
use crate::proxy::error::ProxyError;
use crate::proxy::record::Exchange;
use crate::storage::CHAT_COMPLETIONS_SUFFIX;

/// Read the whole upstream body
pub(super) async fn read_body(response: reqwest::Response) -> Result<Bytes, ProxyError> {
    response
        .bytes()
        .await
        .map_err(|e| ProxyError::ResponseRead(e.to_string()))
}

/// Record a buffered body and, for chat completions, what it says about the run
///
/// `body` is the body exactly as forwarded; it is gunzipped first when `gzip`.
pub(super) fn inspect_body(body: &[u8], gzip: bool, exchange: &mut Exchange) {
    let decoded = if gzip {
        let mut plain = Vec::new();
        match flate2::read::GzDecoder::new(body).read_to_end(&mut plain) {
            Ok(_) => plain,
            Err(e) => {
                tracing::debug!("Failed to gunzip response body: {}", e);
                exchange.response_body = String::from_utf8_lossy(body).into_owned();
                return;
            }
        }
    } else {
        body.to_vec()
    };
    exchange.response_body = String::from_utf8_lossy(&decoded).into_owned();

    if !exchange.path.ends_with(CHAT_COMPLETIONS_SUFFIX)
        || exchange.response_content_type != "application/json"
    {
        return;
    }

    let completion = match serde_json::from_slice::<Completion>(&decoded) {
        Ok(completion) if !completion.id.is_empty() => completion,
        _ => return,
    };

    exchange.moonshot_id = completion.id;
    exchange.usage = completion.usage;
    if completion.choices.iter().any(|c| c.finished_by_length()) {
        let completion_tokens = completion.usage.map(|u| u.completion_tokens).unwrap_or(0);
        exchange.warn(length_warning(Some(completion_tokens)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn chat_exchange() -> Exchange {
        Exchange {
            path: "/v1/chat/completions".into(),
            response_content_type: "application/json".into(),
            ..Default::default()
        }
    }

    const COMPLETION: &str = r#"{"id":"cmpl-1","object":"chat.completion","choices":[{"index":0,"message":{"role":"assistant","content":"hi"},"finish_reason":"length"}],"usage":{"prompt_tokens":3,"completion_tokens":16,"total_tokens":19}}"#;

    #[test]
    fn test_inspect_chat_completion() {
        let mut exchange = chat_exchange();
        inspect_body(COMPLETION.as_bytes(), false, &mut exchange);
        assert_eq!(exchange.moonshot_id, "cmpl-1");
        assert_eq!(exchange.usage.unwrap().total_tokens, 19);
        assert_eq!(exchange.response_body, COMPLETION);
        assert_eq!(
            exchange.warnings,
            vec![
                "it seems that your max_tokens value is too small, please set a value greater than 16"
                    .to_string()
            ]
        );
    }

    #[test]
    fn test_inspect_gzip_body() {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(COMPLETION.as_bytes()).unwrap();
        let compressed = encoder.finish().unwrap();

        let mut exchange = chat_exchange();
        inspect_body(&compressed, true, &mut exchange);
        assert_eq!(exchange.moonshot_id, "cmpl-1");
        assert_eq!(exchange.response_body, COMPLETION);
    }

    #[test]
    fn test_non_chat_bodies_are_only_recorded() {
        let mut exchange = chat_exchange();
        exchange.path = "/v1/models".into();
        inspect_body(COMPLETION.as_bytes(), false, &mut exchange);
        assert_eq!(exchange.moonshot_id, "");
        assert_eq!(exchange.response_body, COMPLETION);

        let mut exchange = chat_exchange();
        inspect_body(b"not json", false, &mut exchange);
        assert_eq!(exchange.moonshot_id, "");
        assert!(exchange.warnings.is_empty());
    }
}
