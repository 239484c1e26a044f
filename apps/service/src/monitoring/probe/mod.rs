//! Vendor probe strategies.
//!
//! Each vendor family implements [`ProbeStrategy`]: send one streamed
//! exchange carrying the challenge prompt and return the collected reply.
//! Timeouts, retries and classification live in the executor so every
//! strategy shares one outer contract.

pub mod anthropic;
pub mod gemini;
pub mod openai;
pub mod ping;
pub mod sse;

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::Arc;
use thiserror::Error;

use super::challenge::Challenge;
use super::types::Vendor;
use crate::database::Target;

pub use anthropic::AnthropicProbe;
pub use gemini::GeminiProbe;
pub use openai::OpenAiProbe;

/// Longest slice of an error body kept in outcome messages.
const ERROR_BODY_LIMIT: usize = 300;

#[derive(Debug, Clone, Error)]
pub enum ProbeError {
    /// Connection reset or closed mid-exchange; worth one immediate retry.
    #[error("connection aborted: {0}")]
    Aborted(String),
    #[error("request timed out")]
    Timeout,
    #[error("request cancelled")]
    Cancelled,
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    /// Error reported inside the event stream by the vendor.
    #[error("stream error: {0}")]
    Stream(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ProbeError {
    pub fn is_aborted(&self) -> bool {
        matches!(self, ProbeError::Aborted(_))
    }

    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProbeError::Timeout
        } else if err.is_builder() {
            ProbeError::InvalidRequest(err.to_string())
        } else if looks_aborted(&err) {
            ProbeError::Aborted(error_chain(&err))
        } else if err.is_body() || err.is_decode() {
            ProbeError::Stream(error_chain(&err))
        } else {
            ProbeError::Transport(error_chain(&err))
        }
    }
}

/// Walk the source chain looking for a reset/closed connection.
fn looks_aborted(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if matches!(
                io.kind(),
                ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::BrokenPipe
                    | ErrorKind::UnexpectedEof
            ) {
                return true;
            }
        }
        let text = e.to_string().to_ascii_lowercase();
        if text.contains("connection reset")
            || text.contains("aborted")
            || text.contains("connection closed before message completed")
            || text.contains("unexpected eof")
        {
            return true;
        }
        current = e.source();
    }
    false
}

fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut parts = vec![err.to_string()];
    let mut current = err.source();
    while let Some(e) = current {
        let text = e.to_string();
        if !parts.iter().any(|p| p.contains(&text)) {
            parts.push(text);
        }
        current = e.source();
    }
    parts.join(": ")
}

pub(crate) fn truncate(text: &str, limit: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= limit {
        trimmed.to_string()
    } else {
        let cut: String = trimmed.chars().take(limit).collect();
        format!("{cut}…")
    }
}

pub(crate) fn http_error(status: u16, body: &str) -> ProbeError {
    ProbeError::Http { status, body: truncate(body, ERROR_BODY_LIMIT) }
}

/// Text collected from one streamed exchange
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamedReply {
    pub text: String,
    /// Milliseconds from send to the first content (or reasoning) chunk
    pub first_token_ms: Option<u64>,
}

/// One decoded stream payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Answer text
    Text(String),
    /// Reasoning output: proves the model started, but is not the answer
    Thinking,
    Done,
    Error(String),
    Skip,
}

#[async_trait]
pub trait ProbeStrategy: Send + Sync {
    /// Send the challenge as a minimal streamed exchange and collect the reply.
    async fn stream_reply(
        &self,
        client: &reqwest::Client,
        target: &Target,
        challenge: &Challenge,
    ) -> Result<StreamedReply, ProbeError>;
}

/// Strategy per vendor, chosen by the target's vendor tag
#[derive(Clone)]
pub struct ProbeRegistry {
    strategies: HashMap<Vendor, Arc<dyn ProbeStrategy>>,
}

impl ProbeRegistry {
    pub fn empty() -> Self {
        Self { strategies: HashMap::new() }
    }

    /// The built-in HTTP strategies for every vendor family
    pub fn standard() -> Self {
        Self::empty()
            .with_strategy(Vendor::OpenAi, Arc::new(OpenAiProbe))
            .with_strategy(Vendor::Anthropic, Arc::new(AnthropicProbe))
            .with_strategy(Vendor::Gemini, Arc::new(GeminiProbe))
    }

    pub fn with_strategy(mut self, vendor: Vendor, strategy: Arc<dyn ProbeStrategy>) -> Self {
        self.strategies.insert(vendor, strategy);
        self
    }

    pub fn get(&self, vendor: Vendor) -> Option<Arc<dyn ProbeStrategy>> {
        self.strategies.get(&vendor).cloned()
    }
}

/// Reasoning directive carried in the model field after `@`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasoningEffort {
    Minimal,
    Low,
    Medium,
    High,
}

impl ReasoningEffort {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasoningEffort::Minimal => "minimal",
            ReasoningEffort::Low => "low",
            ReasoningEffort::Medium => "medium",
            ReasoningEffort::High => "high",
        }
    }

    /// Token budget for vendors that size thinking in tokens.
    pub fn thinking_budget(&self) -> u64 {
        match self {
            ReasoningEffort::Minimal | ReasoningEffort::Low => 1_024,
            ReasoningEffort::Medium => 2_048,
            ReasoningEffort::High => 4_096,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelSpec<'a> {
    pub model: &'a str,
    pub effort: Option<ReasoningEffort>,
}

/// Split `model@effort`. Unknown suffixes stay part of the model name.
pub fn parse_model(raw: &str) -> ModelSpec<'_> {
    let raw = raw.trim();
    if let Some((model, suffix)) = raw.rsplit_once('@') {
        let effort = match suffix.to_ascii_lowercase().as_str() {
            "minimal" => Some(ReasoningEffort::Minimal),
            "low" => Some(ReasoningEffort::Low),
            "medium" => Some(ReasoningEffort::Medium),
            "high" => Some(ReasoningEffort::High),
            _ => None,
        };
        if effort.is_some() && !model.is_empty() {
            return ModelSpec { model, effort };
        }
    }
    ModelSpec { model: raw, effort: None }
}

/// Layer a request body: vendor defaults, then the target's `requestBody`
/// overrides, then the fields the probe depends on, which always win.
pub(crate) fn build_body(
    target: &Target,
    defaults: Map<String, Value>,
    protected: Map<String, Value>,
) -> Value {
    let mut body = defaults;
    if let Some(overrides) = target.request_body_overrides() {
        for (key, value) in overrides {
            body.insert(key.clone(), value.clone());
        }
    }
    body.extend(protected);
    Value::Object(body)
}

/// Attach the target's custom headers after the vendor's own.
pub(crate) fn apply_custom_headers(
    mut request: reqwest::RequestBuilder,
    target: &Target,
) -> reqwest::RequestBuilder {
    for (name, value) in &target.request_headers {
        request = request.header(name.as_str(), value.as_str());
    }
    request
}

/// Pull a human-readable message out of a vendor error object.
pub(crate) fn error_message(value: &Value) -> String {
    value
        .pointer("/error/message")
        .or_else(|| value.pointer("/response/error/message"))
        .or_else(|| value.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| truncate(&value.to_string(), ERROR_BODY_LIMIT))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_model_directive() {
        assert_eq!(
            parse_model("o3@high"),
            ModelSpec { model: "o3", effort: Some(ReasoningEffort::High) }
        );
        assert_eq!(parse_model("gpt-4o"), ModelSpec { model: "gpt-4o", effort: None });
        assert_eq!(
            parse_model("org/model@v2"),
            ModelSpec { model: "org/model@v2", effort: None }
        );
        assert_eq!(parse_model("@low"), ModelSpec { model: "@low", effort: None });
    }

    #[test]
    fn test_build_body_protects_probe_fields() {
        let mut target = Target::new("t", Vendor::OpenAi, "m", "https://x", "k");
        target.metadata.insert(
            "requestBody".into(),
            json!({ "temperature": 0, "stream": false, "model": "other", "max_tokens": 5 }),
        );

        let defaults = json!({ "max_tokens": 64 }).as_object().cloned().unwrap();
        let protected = json!({ "model": "m", "stream": true }).as_object().cloned().unwrap();
        let body = build_body(&target, defaults, protected);

        assert_eq!(body["model"], "m");
        assert_eq!(body["stream"], true);
        assert_eq!(body["temperature"], 0);
        assert_eq!(body["max_tokens"], 5);
    }

    #[test]
    fn test_aborted_detection_walks_io_errors() {
        let reset = std::io::Error::new(ErrorKind::ConnectionReset, "peer went away");
        assert!(looks_aborted(&reset));
        let refused = std::io::Error::new(ErrorKind::ConnectionRefused, "nobody home");
        assert!(!looks_aborted(&refused));
    }

    #[test]
    fn test_error_message_extraction() {
        assert_eq!(error_message(&json!({"error": {"message": "overloaded"}})), "overloaded");
        assert_eq!(error_message(&json!({"message": "bad"})), "bad");
    }

    #[test]
    fn test_truncate_long_bodies() {
        let long = "x".repeat(400);
        let cut = truncate(&long, 300);
        assert_eq!(cut.chars().count(), 301);
    }
}
