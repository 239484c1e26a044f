//! Server-sent event decoding shared by the streaming strategies.

use futures::StreamExt;
use reqwest::RequestBuilder;
use reqwest::header::CONTENT_TYPE;
use serde_json::Value;
use tokio::time::Instant;

use super::{ProbeError, StreamEvent, StreamedReply, http_error};

/// Splits a byte stream into `data:` payloads.
///
/// Bytes are buffered until a newline so multi-byte characters split across
/// chunks decode intact.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(data) = data_payload(&line) {
                payloads.push(data);
            }
        }
        payloads
    }

    /// Whatever is left once the stream closes without a trailing newline
    pub fn finish(&mut self) -> Option<String> {
        let line = std::mem::take(&mut self.buffer);
        data_payload(&line)
    }
}

fn data_payload(line: &[u8]) -> Option<String> {
    let line = String::from_utf8_lossy(line);
    let line = line.trim_end_matches(['\r', '\n']);
    let data = line.strip_prefix("data:")?;
    let data = data.strip_prefix(' ').unwrap_or(data);
    if data.is_empty() { None } else { Some(data.to_string()) }
}

/// Send a streaming request and fold its events into a [`StreamedReply`].
///
/// `parse` turns one JSON payload into an event. Endpoints that ignore the
/// stream flag and answer with a single JSON document go through the same
/// parser once.
pub async fn collect<F>(request: RequestBuilder, parse: F) -> Result<StreamedReply, ProbeError>
where
    F: Fn(&Value) -> StreamEvent + Send,
{
    let started = Instant::now();
    let response = request.send().await.map_err(ProbeError::from_reqwest)?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(http_error(status.as_u16(), &body));
    }

    let is_plain_json = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/json"));

    let mut reply = StreamedReply::default();

    if is_plain_json {
        let body = response.text().await.map_err(ProbeError::from_reqwest)?;
        let value: Value = serde_json::from_str(&body)
            .map_err(|e| ProbeError::Stream(format!("invalid JSON body: {e}")))?;
        apply_event(&mut reply, parse(&value), started)?;
        return Ok(reply);
    }

    let mut stream = response.bytes_stream();
    let mut decoder = SseDecoder::default();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(ProbeError::from_reqwest)?;
        for payload in decoder.push(&chunk) {
            if handle_payload(&mut reply, &payload, &parse, started)? {
                return Ok(reply);
            }
        }
    }

    if let Some(payload) = decoder.finish() {
        handle_payload(&mut reply, &payload, &parse, started)?;
    }

    Ok(reply)
}

/// Returns `true` once the stream signalled completion.
fn handle_payload<F>(
    reply: &mut StreamedReply,
    payload: &str,
    parse: &F,
    started: Instant,
) -> Result<bool, ProbeError>
where
    F: Fn(&Value) -> StreamEvent,
{
    if payload.trim() == "[DONE]" {
        return Ok(true);
    }
    let Ok(value) = serde_json::from_str::<Value>(payload) else {
        tracing::debug!(payload = %payload, "Skipping non-JSON stream payload");
        return Ok(false);
    };
    apply_event(reply, parse(&value), started)
}

fn apply_event(
    reply: &mut StreamedReply,
    event: StreamEvent,
    started: Instant,
) -> Result<bool, ProbeError> {
    match event {
        StreamEvent::Text(text) => {
            if !text.is_empty() {
                mark_first_token(reply, started);
                reply.text.push_str(&text);
            }
            Ok(false)
        }
        StreamEvent::Thinking => {
            mark_first_token(reply, started);
            Ok(false)
        }
        StreamEvent::Done => Ok(true),
        StreamEvent::Error(message) => Err(ProbeError::Stream(message)),
        StreamEvent::Skip => Ok(false),
    }
}

fn mark_first_token(reply: &mut StreamedReply, started: Instant) {
    if reply.first_token_ms.is_none() {
        reply.first_token_ms = Some(started.elapsed().as_millis() as u64);
    }
}
