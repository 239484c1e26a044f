//! Google Gemini `streamGenerateContent`.

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use super::{
    ProbeError, ProbeStrategy, StreamEvent, StreamedReply, apply_custom_headers, build_body,
    error_message, parse_model, sse,
};
use crate::database::Target;
use crate::monitoring::challenge::Challenge;

const ANSWER_TOKENS: u64 = 64;

pub struct GeminiProbe;

impl GeminiProbe {
    /// Endpoints may be a base URL or an already complete streaming URL.
    pub fn stream_url(endpoint: &str, model: &str) -> String {
        if endpoint.contains(":streamGenerateContent") {
            return endpoint.to_string();
        }
        format!("{}/models/{}:streamGenerateContent?alt=sse", endpoint.trim_end_matches('/'), model)
    }

    fn body(target: &Target, challenge: &Challenge) -> Value {
        let spec = parse_model(&target.model);
        let mut generation = Map::new();
        match spec.effort {
            Some(effort) => {
                let budget = effort.thinking_budget();
                generation.insert("maxOutputTokens".into(), json!(budget + ANSWER_TOKENS));
                generation.insert("thinkingConfig".into(), json!({ "thinkingBudget": budget }));
            }
            None => {
                generation.insert("maxOutputTokens".into(), json!(ANSWER_TOKENS));
            }
        }
        let mut defaults = Map::new();
        defaults.insert("generationConfig".into(), Value::Object(generation));

        let mut protected = Map::new();
        protected.insert(
            "contents".into(),
            json!([{ "role": "user", "parts": [{ "text": challenge.prompt }] }]),
        );
        build_body(target, defaults, protected)
    }
}

pub fn parse_event(value: &Value) -> StreamEvent {
    if value.get("error").is_some() {
        return StreamEvent::Error(error_message(value));
    }
    let Some(parts) = value.pointer("/candidates/0/content/parts").and_then(Value::as_array)
    else {
        return StreamEvent::Skip;
    };

    let mut text = String::new();
    let mut thought = false;
    for part in parts {
        if part.get("thought").and_then(Value::as_bool).unwrap_or(false) {
            thought = true;
        } else if let Some(t) = part.get("text").and_then(Value::as_str) {
            text.push_str(t);
        }
    }

    if !text.is_empty() {
        StreamEvent::Text(text)
    } else if thought {
        StreamEvent::Thinking
    } else {
        StreamEvent::Skip
    }
}

#[async_trait]
impl ProbeStrategy for GeminiProbe {
    async fn stream_reply(
        &self,
        client: &reqwest::Client,
        target: &Target,
        challenge: &Challenge,
    ) -> Result<StreamedReply, ProbeError> {
        let spec = parse_model(&target.model);
        let request = client
            .post(Self::stream_url(&target.endpoint, spec.model))
            .header("x-goog-api-key", &target.api_key)
            .json(&Self::body(target, challenge));
        let request = apply_custom_headers(request, target);

        sse::collect(request, parse_event).await
    }
}
