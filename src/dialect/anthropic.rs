//! Anthropic Messages API dialect. Near-passthrough: the canonical shape
//! already mirrors Anthropic wire format closely enough that this dialect
//! does little beyond validating `model` is present and wrapping stream
//! bytes.

use super::{
    AggregatedStream, CanonicalRequest, CanonicalResponse, CanonicalStreamEvent, CanonicalUsage,
    InboundTransformer, OutboundTransformer,
};
use crate::model::ChannelType;
use anyhow::{bail, Context, Result};
use axum::http::HeaderMap;
use serde_json::{json, Value};

pub struct AnthropicDialect;

impl InboundTransformer for AnthropicDialect {
    fn api_format(&self) -> &'static str {
        "anthropic"
    }

    fn detect(&self, headers: &HeaderMap, body: &Value) -> bool {
        headers.keys().any(|k| k.as_str().starts_with("anthropic-"))
            || body.get("model").and_then(|m| m.as_str()).is_some()
    }

    fn transform_request(&self, raw: Value) -> Result<CanonicalRequest> {
        let req: CanonicalRequest = serde_json::from_value(raw).context("parsing anthropic request body")?;
        if req.model.is_empty() {
            bail!("request.model is required");
        }
        Ok(req)
    }

    fn transform_response(&self, canonical: CanonicalResponse) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&canonical)?)
    }

    fn transform_stream_event(&self, canonical: &CanonicalStreamEvent) -> Result<Vec<u8>> {
        Ok(canonical.raw.clone())
    }

    fn transform_error(&self, status: u16, message: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "type": "error",
            "error": { "type": "api_error", "status": status, "message": message }
        }))
        .unwrap_or_default()
    }

    fn aggregate_stream_chunks(&self, chunks: &[Vec<u8>]) -> Result<AggregatedStream> {
        let mut response_id = None;
        let mut usage = None;
        let mut text = String::new();

        for chunk in chunks {
            let Ok(s) = std::str::from_utf8(chunk) else { continue };
            for line in s.lines() {
                let Some(data) = line.strip_prefix("data:") else { continue };
                let data = data.trim();
                if data.is_empty() || data == "[DONE]" {
                    continue;
                }
                let Ok(event) = serde_json::from_str::<Value>(data) else { continue };
                if let Some(id) = event.get("message").and_then(|m| m.get("id")).and_then(|v| v.as_str()) {
                    response_id = Some(id.to_string());
                }
                if let Some(delta) = event.get("delta").and_then(|d| d.get("text")).and_then(|v| v.as_str()) {
                    text.push_str(delta);
                }
                if let Some(u) = event.get("usage") {
                    usage = serde_json::from_value::<CanonicalUsage>(u.clone()).ok();
                }
            }
        }

        Ok(AggregatedStream {
            body: json!({ "type": "text", "text": text }),
            response_id,
            usage,
        })
    }
}

impl OutboundTransformer for AnthropicDialect {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Anthropic
    }

    fn build_request(&self, canonical: &CanonicalRequest, actual_model: &str) -> Result<Value> {
        let mut body = serde_json::to_value(canonical)?;
        if let Some(obj) = body.as_object_mut() {
            obj.insert("model".to_string(), json!(actual_model));
        }
        Ok(body)
    }

    fn parse_response(&self, raw: Value) -> Result<CanonicalResponse> {
        Ok(serde_json::from_value(raw)?)
    }

    fn parse_stream_chunk(&self, chunk: &[u8]) -> Result<Vec<CanonicalStreamEvent>> {
        let text = String::from_utf8_lossy(chunk);
        let mut events = Vec::new();
        let mut current_event: Option<&str> = None;
        for line in text.lines() {
            if let Some(event_type) = line.strip_prefix("event:") {
                current_event = Some(event_type.trim());
            } else if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim();
                events.push(CanonicalStreamEvent {
                    raw: format!("event: {}\ndata: {}\n\n", current_event.unwrap_or(""), data).into_bytes(),
                    is_terminal: super::is_terminal_marker(current_event, data),
                    usage: None,
                });
            }
        }
        Ok(events)
    }

    fn aggregate_stream_chunks(&self, chunks: &[Vec<u8>]) -> Result<AggregatedStream> {
        <Self as InboundTransformer>::aggregate_stream_chunks(self, chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::CanonicalMessage;

    fn sample_request() -> Value {
        json!({
            "model": "claude-3-5-sonnet",
            "messages": [{ "role": "user", "content": "hello" }],
        })
    }

    #[test]
    fn parses_minimal_request() {
        let dialect = AnthropicDialect;
        let req = dialect.transform_request(sample_request()).unwrap();
        assert_eq!(req.model, "claude-3-5-sonnet");
        assert_eq!(req.messages.len(), 1);
    }

    #[test]
    fn empty_model_is_rejected() {
        let dialect = AnthropicDialect;
        let mut body = sample_request();
        body["model"] = json!("");
        assert!(dialect.transform_request(body).is_err());
    }

    #[test]
    fn detect_matches_on_anthropic_header_or_model_field() {
        let dialect = AnthropicDialect;
        let headers = HeaderMap::new();
        assert!(dialect.detect(&headers, &sample_request()));
    }

    #[test]
    fn build_request_stamps_actual_model() {
        let dialect = AnthropicDialect;
        let canonical = CanonicalRequest {
            model: "alias".into(),
            messages: vec![CanonicalMessage {
                role: "user".into(),
                content: json!("hi"),
                tool_call_id: None,
            }],
            system: None,
            max_tokens: None,
            temperature: None,
            stream: None,
            tools: None,
            tool_choice: None,
            stop_sequences: None,
            extra_params: None,
        };
        let body = dialect.build_request(&canonical, "claude-3-5-sonnet-20241022").unwrap();
        assert_eq!(body["model"], "claude-3-5-sonnet-20241022");
    }
}
