//! OpenAI-compatible chat completions and the responses API.
//!
//! An endpoint whose path ends in `/responses` speaks the responses event
//! protocol; everything else is treated as chat completions.

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use url::Url;

use super::{
    ProbeError, ProbeStrategy, StreamEvent, StreamedReply, apply_custom_headers, build_body,
    error_message, parse_model, sse,
};
use crate::database::Target;
use crate::monitoring::challenge::Challenge;

pub struct OpenAiProbe;

impl OpenAiProbe {
    pub fn uses_responses_api(endpoint: &str) -> bool {
        Url::parse(endpoint)
            .map(|url| url.path().trim_end_matches('/').ends_with("/responses"))
            .unwrap_or(false)
    }

    fn chat_body(target: &Target, challenge: &Challenge) -> Value {
        let spec = parse_model(&target.model);
        let mut defaults = Map::new();
        if let Some(effort) = spec.effort {
            defaults.insert("reasoning_effort".into(), json!(effort.as_str()));
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

    fn responses_body(target: &Target, challenge: &Challenge) -> Value {
        let spec = parse_model(&target.model);
        let mut defaults = Map::new();
        if let Some(effort) = spec.effort {
            defaults.insert("reasoning".into(), json!({ "effort": effort.as_str() }));
        }

        let mut protected = Map::new();
        protected.insert("model".into(), json!(spec.model));
        protected.insert("input".into(), json!(challenge.prompt));
        protected.insert("stream".into(), json!(true));
        build_body(target, defaults, protected)
    }
}

/// One chat completions chunk, or a whole non-streamed completion.
pub fn parse_chat_event(value: &Value) -> StreamEvent {
    if value.get("error").is_some() {
        return StreamEvent::Error(error_message(value));
    }
    let Some(choice) = value.pointer("/choices/0") else {
        return StreamEvent::Skip;
    };
    let message = choice.get("delta").or_else(|| choice.get("message"));
    let Some(message) = message else {
        return StreamEvent::Skip;
    };

    match message.get("content").and_then(Value::as_str) {
        Some(text) if !text.is_empty() => StreamEvent::Text(text.to_string()),
        _ => {
            let reasoning = message
                .get("reasoning_content")
                .or_else(|| message.get("reasoning"))
                .and_then(Value::as_str);
            if reasoning.is_some_and(|r| !r.is_empty()) {
                StreamEvent::Thinking
            } else {
                StreamEvent::Skip
            }
        }
    }
}

/// One event of the responses API stream.
pub fn parse_responses_event(value: &Value) -> StreamEvent {
    let kind = value.get("type").and_then(Value::as_str).unwrap_or_default();
    match kind {
        "response.output_text.delta" => value
            .get("delta")
            .and_then(Value::as_str)
            .map(|d| StreamEvent::Text(d.to_string()))
            .unwrap_or(StreamEvent::Skip),
        "response.reasoning_text.delta" | "response.reasoning_summary_text.delta" => {
            StreamEvent::Thinking
        }
        "response.completed" => StreamEvent::Done,
        "error" | "response.failed" => StreamEvent::Error(error_message(value)),
        _ => StreamEvent::Skip,
    }
}

#[async_trait]
impl ProbeStrategy for OpenAiProbe {
    async fn stream_reply(
        &self,
        client: &reqwest::Client,
        target: &Target,
        challenge: &Challenge,
    ) -> Result<StreamedReply, ProbeError> {
        let responses = Self::uses_responses_api(&target.endpoint);
        let body = if responses {
            Self::responses_body(target, challenge)
        } else {
            Self::chat_body(target, challenge)
        };

        let request = client
            .post(&target.endpoint)
            .bearer_auth(&target.api_key)
            .header("accept", "text/event-stream")
            .json(&body);
        let request = apply_custom_headers(request, target);

        if responses {
            sse::collect(request, parse_responses_event).await
        } else {
            sse::collect(request, parse_chat_event).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::challenge::Operator;
    use crate::monitoring::types::Vendor;

    fn target(endpoint: &str, model: &str) -> Target {
        Target::new("openai", Vendor::OpenAi, model, endpoint, "sk-test")
    }

    #[test]
    fn test_endpoint_selects_protocol() {
        assert!(OpenAiProbe::uses_responses_api("https://api.openai.com/v1/responses"));
        assert!(OpenAiProbe::uses_responses_api("https://api.openai.com/v1/responses/"));
        assert!(!OpenAiProbe::uses_responses_api("https://api.openai.com/v1/chat/completions"));
        assert!(!OpenAiProbe::uses_responses_api("not a url"));
    }

    #[test]
    fn test_chat_body_carries_effort_and_prompt() {
        let challenge = Challenge::new(17, Operator::Add, 25);
        let body = OpenAiProbe::chat_body(
            &target("https://x/v1/chat/completions", "o4-mini@low"),
            &challenge,
        );
        assert_eq!(body["model"], "o4-mini");
        assert_eq!(body["reasoning_effort"], "low");
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][0]["content"], challenge.prompt);
    }

    #[test]
    fn test_responses_body_uses_input() {
        let challenge = Challenge::new(6, Operator::Multiply, 7);
        let body =
            OpenAiProbe::responses_body(&target("https://x/v1/responses", "gpt-5@high"), &challenge);
        assert_eq!(body["model"], "gpt-5");
        assert_eq!(body["reasoning"]["effort"], "high");
        assert_eq!(body["input"], challenge.prompt);
    }

    #[test]
    fn test_parse_chat_chunks() {
        let text = json!({"choices": [{"delta": {"content": "42"}}]});
        assert_eq!(parse_chat_event(&text), StreamEvent::Text("42".into()));

        let reasoning = json!({"choices": [{"delta": {"reasoning_content": "hmm"}}]});
        assert_eq!(parse_chat_event(&reasoning), StreamEvent::Thinking);

        let role_only = json!({"choices": [{"delta": {"role": "assistant"}}]});
        assert_eq!(parse_chat_event(&role_only), StreamEvent::Skip);

        let error = json!({"error": {"message": "rate limited"}});
        assert_eq!(parse_chat_event(&error), StreamEvent::Error("rate limited".into()));
    }

    #[test]
    fn test_parse_responses_events() {
        let delta = json!({"type": "response.output_text.delta", "delta": "4"});
        assert_eq!(parse_responses_event(&delta), StreamEvent::Text("4".into()));
        let done = json!({"type": "response.completed", "response": {}});
        assert_eq!(parse_responses_event(&done), StreamEvent::Done);
        let failed = json!({"type": "response.failed", "response": {"error": {"message": "quota"}}});
        assert_eq!(parse_responses_event(&failed), StreamEvent::Error("quota".into()));
    }
}
