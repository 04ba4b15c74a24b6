//! Server-sent-events plumbing shared by every streaming adapter.
//!
//! Inference servers differ in what they put in `data:` payloads, but they
//! all frame them the same way. [`SseDecoder`] turns arbitrary byte chunks
//! into complete payloads; [`check_status`] maps HTTP failures to
//! [`BackendError`]s before a stream is started.

use promptloom_core::error::BackendError;
use tracing::warn;

/// One decoded SSE payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    /// A `data:` payload (already trimmed)
    Data(String),
    /// The `[DONE]` terminator
    Done,
}

/// Incremental SSE line decoder.
///
/// Bytes may split lines (or UTF-8 sequences) anywhere; incomplete tails
/// stay buffered until the next push.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes, returning every payload completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();

        while let Some(line_end) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=line_end).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);

            // blank separators, comments, and event/id fields
            if line.is_empty() || line.starts_with(':') {
                continue;
            }

            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data.is_empty() {
                continue;
            }
            if data == "[DONE]" {
                events.push(SseEvent::Done);
            } else {
                events.push(SseEvent::Data(data.to_string()));
            }
        }

        events
    }
}

/// Reject non-success responses with the matching error variant.
pub async fn check_status(
    response: reqwest::Response,
    backend: &str,
) -> Result<reqwest::Response, BackendError> {
    let status = response.status().as_u16();

    if status == 429 {
        let retry_after_secs = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(5);
        return Err(BackendError::RateLimited { retry_after_secs });
    }

    if status == 401 || status == 403 {
        return Err(BackendError::AuthenticationFailed(
            "Invalid API key or insufficient permissions".into(),
        ));
    }

    if !(200..300).contains(&status) {
        let error_body = response.text().await.unwrap_or_default();
        warn!(backend, status, body = %error_body, "Backend returned error");
        return Err(BackendError::Api {
            status_code: status,
            message: error_body,
        });
    }

    Ok(response)
}

/// Map a transport failure to a backend error.
pub fn network_error(e: reqwest::Error) -> BackendError {
    BackendError::Network(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_split_lines() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: {\"a\"").is_empty());
        let events = decoder.push(b":1}\n\ndata: [DONE]\n");
        assert_eq!(
            events,
            vec![SseEvent::Data("{\"a\":1}".into()), SseEvent::Done]
        );
    }

    #[test]
    fn skips_comments_and_event_fields() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b": keep-alive\r\nevent: message\r\ndata: {\"token\":\"Hi\"}\r\n\r\n");
        assert_eq!(events, vec![SseEvent::Data("{\"token\":\"Hi\"}".into())]);
    }

    #[test]
    fn accepts_data_without_space() {
        let mut decoder = SseDecoder::new();
        assert_eq!(decoder.push(b"data:x\n"), vec![SseEvent::Data("x".into())]);
    }

    #[test]
    fn multibyte_split_across_pushes() {
        let mut decoder = SseDecoder::new();
        let bytes = "data: héllo\n".as_bytes();
        // split inside the two-byte 'é'
        assert!(decoder.push(&bytes[..8]).is_empty());
        assert_eq!(
            decoder.push(&bytes[8..]),
            vec![SseEvent::Data("héllo".into())]
        );
    }
}
