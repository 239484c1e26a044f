//! Anthropic messages API.

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use super::{
    ProbeError, ProbeStrategy, StreamEvent, StreamedReply, apply_custom_headers, build_body,
    error_message, parse_model, sse,
};
use crate::database::Target;
use crate::monitoring::challenge::Challenge;

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Room left for the answer on top of any thinking budget
const ANSWER_TOKENS: u64 = 64;

pub struct AnthropicProbe;

impl AnthropicProbe {
    fn body(target: &Target, challenge: &Challenge) -> Value {
        let spec = parse_model(&target.model);
        let mut defaults = Map::new();
        match spec.effort {
            Some(effort) => {
                let budget = effort.thinking_budget();
                defaults.insert("max_tokens".into(), json!(budget + ANSWER_TOKENS));
                defaults.insert(
                    "thinking".into(),
                    json!({ "type": "enabled", "budget_tokens": budget }),
                );
            }
            None => {
                defaults.insert("max_tokens".into(), json!(ANSWER_TOKENS));
            }
        }

        let mut protected = Map::new();
        protected.insert("model".into(), json!(spec.model));
        protected.insert(
            "messages".into(),
            json!([{ "role": "user", "content": challenge.prompt }]),
        );
        protected.insert("stream".into(), json!(true));
        build_body(target, defaults, protected)
    }
}

pub fn parse_event(value: &Value) -> StreamEvent {
    match value.get("type").and_then(Value::as_str).unwrap_or_default() {
        "content_block_delta" => {
            let delta = value.get("delta");
            match delta.and_then(|d| d.get("type")).and_then(Value::as_str) {
                Some("text_delta") => delta
                    .and_then(|d| d.get("text"))
                    .and_then(Value::as_str)
                    .map(|t| StreamEvent::Text(t.to_string()))
                    .unwrap_or(StreamEvent::Skip),
                Some("thinking_delta") => StreamEvent::Thinking,
                _ => StreamEvent::Skip,
            }
        }
        "message_stop" => StreamEvent::Done,
        "error" => StreamEvent::Error(error_message(value)),
        // Non-streamed message body.
        "message" => {
            let text: String = value
                .get("content")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(|block| block.get("text").and_then(Value::as_str))
                .collect();
            StreamEvent::Text(text)
        }
        _ => StreamEvent::Skip,
    }
}

#[async_trait]
impl ProbeStrategy for AnthropicProbe {
    async fn stream_reply(
        &self,
        client: &reqwest::Client,
        target: &Target,
        challenge: &Challenge,
    ) -> Result<StreamedReply, ProbeError> {
        let request = client
            .post(&target.endpoint)
            .header("x-api-key", &target.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("accept", "text/event-stream")
            .json(&Self::body(target, challenge));
        let request = apply_custom_headers(request, target);

        sse::collect(request, parse_event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::challenge::Operator;
    use crate::monitoring::types::Vendor;

    #[test]
    fn test_body_with_thinking_budget() {
        let target = Target::new(
            "claude",
            Vendor::Anthropic,
            "claude-sonnet-4@medium",
            "https://api.anthropic.com/v1/messages",
            "key",
        );
        let body = AnthropicProbe::body(&target, &Challenge::new(1, Operator::Add, 2));
        assert_eq!(body["model"], "claude-sonnet-4");
        assert_eq!(body["thinking"]["budget_tokens"], 2048);
        assert_eq!(body["max_tokens"], 2048 + 64);
        assert_eq!(body["stream"], true);
    }

    #[test]
    fn test_parse_stream_events() {
        let text = json!({"type": "content_block_delta", "delta": {"type": "text_delta", "text": "42"}});
        assert_eq!(parse_event(&text), StreamEvent::Text("42".into()));

        let thinking =
            json!({"type": "content_block_delta", "delta": {"type": "thinking_delta", "thinking": "x"}});
        assert_eq!(parse_event(&thinking), StreamEvent::Thinking);

        assert_eq!(parse_event(&json!({"type": "ping"})), StreamEvent::Skip);
        assert_eq!(parse_event(&json!({"type": "message_stop"})), StreamEvent::Done);

        let error = json!({"type": "error", "error": {"type": "overloaded_error", "message": "Overloaded"}});
        assert_eq!(parse_event(&error), StreamEvent::Error("Overloaded".into()));
    }
}
