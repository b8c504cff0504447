//! OpenAI `/v1/chat/completions` dialect: converts between the canonical
//! request/response shape and OpenAI's wire format in both directions —
//! system-prompt flattening, tool_use/tool_calls conversion, and a
//! finish_reason/stop_reason mapping table.

use super::{
    AggregatedStream, CanonicalMessage, CanonicalRequest, CanonicalResponse, CanonicalStreamEvent,
    CanonicalUsage, ContentBlock, InboundTransformer, OutboundTransformer,
};
use crate::model::ChannelType;
use anyhow::{Context, Result};
use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct OpenAiWireMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OpenAiWireToolCall>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OpenAiWireToolCall {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    tool_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function: Option<OpenAiWireToolFunction>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OpenAiWireToolFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OpenAiWireRequest {
    model: String,
    messages: Vec<OpenAiWireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Value>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct OpenAiWireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct OpenAiWireResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    choices: Vec<OpenAiWireChoice>,
    usage: Option<OpenAiWireUsage>,
}

#[derive(Debug, Clone, Deserialize)]
struct OpenAiWireChoice {
    message: OpenAiWireMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

fn canonical_content_to_string(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(items) => {
            let mut out = String::new();
            for item in items {
                if let Some(text) = item.get("text").and_then(|t| t.as_str()) {
                    if !out.is_empty() {
                        out.push('\n');
                    }
                    out.push_str(text);
                }
            }
            out
        }
        other if other.is_null() => String::new(),
        other => other.to_string(),
    }
}

/// Canonical request -> OpenAI wire request, for channels of type OpenAi.
fn canonical_to_openai_wire(canonical: &CanonicalRequest, actual_model: &str) -> OpenAiWireRequest {
    let mut messages = Vec::new();

    if let Some(system) = &canonical.system {
        let content = canonical_content_to_string(system);
        if !content.is_empty() {
            messages.push(OpenAiWireMessage {
                role: "system".into(),
                content: Some(Value::String(content)),
                ..Default::default()
            });
        }
    }

    for msg in &canonical.messages {
        let role = match msg.role.as_str() {
            "human" => "user",
            other => other,
        };

        if let Some(blocks) = msg.content.as_array() {
            for block in blocks {
                if block.get("type").and_then(|t| t.as_str()) == Some("tool_result") {
                    let content = block.get("content").map(canonical_content_to_string);
                    let tool_call_id = block.get("tool_use_id").and_then(|v| v.as_str()).map(String::from);
                    messages.push(OpenAiWireMessage {
                        role: "tool".into(),
                        content: content.map(Value::String),
                        tool_call_id,
                        tool_calls: None,
                    });
                }
            }
        }

        let mut tool_calls = None;
        let mut content_source = msg.content.clone();

        if role == "assistant" {
            if let Some(blocks) = msg.content.as_array() {
                let mut converted = Vec::new();
                let mut remaining = Vec::new();
                for block in blocks {
                    if block.get("type").and_then(|t| t.as_str()) == Some("tool_use") {
                        let id = block.get("id").and_then(|v| v.as_str()).unwrap_or("toolu_unknown").to_string();
                        let name = block.get("name").and_then(|v| v.as_str()).unwrap_or("tool").to_string();
                        let arguments = block.get("input").cloned().unwrap_or_else(|| json!({})).to_string();
                        converted.push(OpenAiWireToolCall {
                            id: Some(id),
                            tool_type: Some("function".into()),
                            function: Some(OpenAiWireToolFunction { name, arguments }),
                        });
                    } else {
                        remaining.push(block.clone());
                    }
                }
                if !converted.is_empty() {
                    tool_calls = Some(converted);
                    content_source = Value::Array(remaining);
                }
            }
        }

        let content_text = canonical_content_to_string(&content_source);
        let has_content = !content_text.is_empty();
        if has_content || role != "user" {
            messages.push(OpenAiWireMessage {
                role: role.to_string(),
                content: Some(Value::String(content_text)),
                tool_call_id: msg.tool_call_id.clone(),
                tool_calls,
            });
        }
    }

    OpenAiWireRequest {
        model: actual_model.to_string(),
        messages,
        max_tokens: canonical.max_tokens,
        temperature: canonical.temperature,
        stream: canonical.stream,
        tools: canonical.tools.as_ref().map(|tools| {
            tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.input_schema,
                        }
                    })
                })
                .collect()
        }),
    }
}

/// OpenAI wire response -> canonical, for channels of type OpenAi.
fn openai_wire_to_canonical(wire: OpenAiWireResponse, requested_model: &str) -> CanonicalResponse {
    let model = if wire.model.is_empty() { requested_model.to_string() } else { wire.model };
    let mut content = Vec::new();
    let mut stop_reason = None;

    if let Some(choice) = wire.choices.into_iter().next() {
        stop_reason = choice.finish_reason.map(|r| match r.as_str() {
            "stop" => "end_turn".to_string(),
            "length" => "max_tokens".to_string(),
            "tool_calls" => "tool_use".to_string(),
            "content_filter" => "stop_sequence".to_string(),
            other => other.to_string(),
        });

        if let Some(text) = choice.message.content.as_ref().and_then(|c| c.as_str()) {
            if !text.is_empty() {
                content.push(ContentBlock::Text { text: text.to_string() });
            }
        }

        if let Some(tool_calls) = choice.message.tool_calls {
            for (index, call) in tool_calls.into_iter().enumerate() {
                if let Some(function) = call.function {
                    let input = serde_json::from_str(&function.arguments)
                        .unwrap_or_else(|_| json!({ "raw_arguments": function.arguments }));
                    content.push(ContentBlock::ToolUse {
                        id: call.id.unwrap_or_else(|| format!("toolu_{index}")),
                        name: function.name,
                        input,
                    });
                }
            }
        }
    }

    let usage = wire.usage.map(|u| CanonicalUsage {
        input_tokens: u.prompt_tokens,
        output_tokens: u.completion_tokens,
        input_tokens_details: None,
    });

    CanonicalResponse {
        id: wire.id,
        response_type: "message".into(),
        role: "assistant".into(),
        model,
        content,
        stop_reason,
        usage,
        extra_data: None,
    }
}

pub struct OpenAiDialect;

impl InboundTransformer for OpenAiDialect {
    fn api_format(&self) -> &'static str {
        "openai"
    }

    fn detect(&self, headers: &HeaderMap, body: &Value) -> bool {
        !headers.keys().any(|k| k.as_str().starts_with("anthropic-"))
            && body
                .get("messages")
                .and_then(|m| m.as_array())
                .map(|arr| arr.iter().all(|m| m.get("role").and_then(|r| r.as_str()).is_some()))
                .unwrap_or(false)
    }

    fn transform_request(&self, raw: Value) -> Result<CanonicalRequest> {
        let wire: OpenAiWireRequest = serde_json::from_value(raw).context("parsing openai chat completion body")?;
        let mut system = None;
        let mut messages = Vec::new();

        for m in wire.messages {
            if m.role == "system" {
                system = m.content;
                continue;
            }
            messages.push(CanonicalMessage {
                role: m.role,
                content: m.content.unwrap_or(Value::Null),
                tool_call_id: m.tool_call_id,
            });
        }

        Ok(CanonicalRequest {
            model: wire.model,
            messages,
            system,
            max_tokens: wire.max_tokens,
            temperature: wire.temperature,
            stream: wire.stream,
            tools: None,
            tool_choice: None,
            stop_sequences: None,
            extra_params: None,
        })
    }

    fn transform_response(&self, canonical: CanonicalResponse) -> Result<Vec<u8>> {
        let text = canonical
            .content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.clone()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");

        let body = json!({
            "id": canonical.id,
            "object": "chat.completion",
            "model": canonical.model,
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": text },
                "finish_reason": canonical.stop_reason,
            }],
            "usage": canonical.usage.map(|u| json!({
                "prompt_tokens": u.input_tokens,
                "completion_tokens": u.output_tokens,
                "total_tokens": u.input_tokens + u.output_tokens,
            })),
        });
        Ok(serde_json::to_vec(&body)?)
    }

    fn transform_stream_event(&self, canonical: &CanonicalStreamEvent) -> Result<Vec<u8>> {
        Ok(canonical.raw.clone())
    }

    fn transform_error(&self, status: u16, message: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({ "error": { "message": message, "code": status } })).unwrap_or_default()
    }

    fn aggregate_stream_chunks(&self, chunks: &[Vec<u8>]) -> Result<AggregatedStream> {
        let mut text = String::new();
        let mut response_id = None;
        let mut usage = None;

        for chunk in chunks {
            let Ok(s) = std::str::from_utf8(chunk) else { continue };
            for line in s.lines() {
                let Some(data) = line.strip_prefix("data:") else { continue };
                let data = data.trim();
                if data.is_empty() || data == "[DONE]" {
                    continue;
                }
                let Ok(event) = serde_json::from_str::<Value>(data) else { continue };
                if let Some(id) = event.get("id").and_then(|v| v.as_str()) {
                    response_id = Some(id.to_string());
                }
                if let Some(delta) = event
                    .get("choices")
                    .and_then(|c| c.get(0))
                    .and_then(|c| c.get("delta"))
                    .and_then(|d| d.get("content"))
                    .and_then(|v| v.as_str())
                {
                    text.push_str(delta);
                }
                if let Some(u) = event.get("usage") {
                    usage = serde_json::from_value::<OpenAiWireUsage>(u.clone())
                        .ok()
                        .map(|u| CanonicalUsage {
                            input_tokens: u.prompt_tokens,
                            output_tokens: u.completion_tokens,
                            input_tokens_details: None,
                        });
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

impl OutboundTransformer for OpenAiDialect {
    fn channel_type(&self) -> ChannelType {
        ChannelType::OpenAi
    }

    fn build_request(&self, canonical: &CanonicalRequest, actual_model: &str) -> Result<Value> {
        Ok(serde_json::to_value(canonical_to_openai_wire(canonical, actual_model))?)
    }

    fn parse_response(&self, raw: Value) -> Result<CanonicalResponse> {
        let wire: OpenAiWireResponse = serde_json::from_value(raw).context("parsing openai wire response")?;
        let model = wire.model.clone();
        Ok(openai_wire_to_canonical(wire, &model))
    }

    fn parse_stream_chunk(&self, chunk: &[u8]) -> Result<Vec<CanonicalStreamEvent>> {
        let text = String::from_utf8_lossy(chunk);
        let mut events = Vec::new();
        for line in text.lines() {
            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim();
                events.push(CanonicalStreamEvent {
                    raw: format!("data: {data}\n\n").into_bytes(),
                    is_terminal: super::is_terminal_marker(None, data),
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

    #[test]
    fn system_message_extracted_from_messages_array() {
        let raw = json!({
            "model": "gpt-4",
            "messages": [
                { "role": "system", "content": "be nice" },
                { "role": "user", "content": "hi" },
            ],
        });
        let dialect = OpenAiDialect;
        let canonical = dialect.transform_request(raw).unwrap();
        assert_eq!(canonical.system, Some(json!("be nice")));
        assert_eq!(canonical.messages.len(), 1);
    }

    #[test]
    fn canonical_to_openai_wire_flattens_system_field() {
        let canonical = CanonicalRequest {
            model: "alias".into(),
            messages: vec![CanonicalMessage {
                role: "user".into(),
                content: json!("hi"),
                tool_call_id: None,
            }],
            system: Some(json!("be nice")),
            max_tokens: Some(100),
            temperature: None,
            stream: None,
            tools: None,
            tool_choice: None,
            stop_sequences: None,
            extra_params: None,
        };
        let wire = canonical_to_openai_wire(&canonical, "gpt-4o");
        assert_eq!(wire.model, "gpt-4o");
        assert_eq!(wire.messages[0].role, "system");
        assert_eq!(wire.messages[1].role, "user");
    }

    #[test]
    fn finish_reason_maps_to_anthropic_style_stop_reason() {
        let wire = OpenAiWireResponse {
            id: "chatcmpl-1".into(),
            model: "gpt-4o".into(),
            choices: vec![OpenAiWireChoice {
                message: OpenAiWireMessage {
                    role: "assistant".into(),
                    content: Some(json!("hello")),
                    tool_call_id: None,
                    tool_calls: None,
                },
                finish_reason: Some("tool_calls".into()),
            }],
            usage: None,
        };
        let canonical = openai_wire_to_canonical(wire, "gpt-4o");
        assert_eq!(canonical.stop_reason, Some("tool_use".into()));
    }

    #[test]
    fn tool_use_block_becomes_openai_tool_call() {
        let canonical = CanonicalRequest {
            model: "alias".into(),
            messages: vec![CanonicalMessage {
                role: "assistant".into(),
                content: json!([{ "type": "tool_use", "id": "t1", "name": "lookup", "input": {"q": "x"} }]),
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
        let wire = canonical_to_openai_wire(&canonical, "gpt-4o");
        let tool_calls = wire.messages[0].tool_calls.as_ref().unwrap();
        assert_eq!(tool_calls[0].function.as_ref().unwrap().name, "lookup");
    }
}
