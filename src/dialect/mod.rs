//! Canonical request/response model and the Inbound/Outbound transformer
//! contracts. The canonical shape is Anthropic-leaning (content blocks,
//! top-level `system`) since that is the richer of the two wire shapes
//! and absorbs the other losslessly for the fields this crate cares
//! about.
//!
//! Two concrete dialects exercise the pipeline end-to-end: `anthropic`
//! (near-passthrough, since canonical already looks like Anthropic wire)
//! and `openai` (a real bidirectional conversion). Wire-format
//! completeness for either is not the goal; these exist to prove the
//! orchestration core against more than one shape.

pub mod anthropic;
pub mod openai;

use async_trait::async_trait;
use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalMessage {
    pub role: String,
    pub content: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image")]
    Image { source: ImageSource },
    #[serde(rename = "tool_use")]
    ToolUse { id: String, name: String, input: Value },
    #[serde(rename = "tool_result")]
    ToolResult { tool_use_id: String, content: Value },
    #[serde(rename = "thinking")]
    Thinking {
        thinking: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ImageSource {
    #[serde(rename = "base64")]
    Base64 { media_type: String, data: String },
    #[serde(rename = "url")]
    Url { url: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalTool {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CanonicalUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_tokens_details: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalRequest {
    pub model: String,
    pub messages: Vec<CanonicalMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<CanonicalTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_params: Option<Value>,
}

/// Tool names Anthropic serves as server-side "native" tools (versioned
/// types like `bash_20250124` collapse to their unversioned prefix here)
/// rather than client-defined function tools.
const ANTHROPIC_NATIVE_TOOL_PREFIXES: &[&str] = &["bash", "text_editor", "computer", "web_search"];

/// Tool names Google serves as server-side "native" tools.
const GOOGLE_NATIVE_TOOL_NAMES: &[&str] = &["google_search", "google_search_retrieval", "code_execution"];

impl CanonicalRequest {
    /// Whether any requested tool is one of Anthropic's native/server tools,
    /// used to steer candidate selection toward channels that advertise
    /// `supports_anthropic_native_tools` (see `select::AnthropicNativeTools`).
    pub fn has_anthropic_native_tools(&self) -> bool {
        self.tools.as_ref().map_or(false, |tools| {
            tools
                .iter()
                .any(|t| ANTHROPIC_NATIVE_TOOL_PREFIXES.iter().any(|p| t.name.starts_with(p)))
        })
    }

    /// Same idea as `has_anthropic_native_tools`, for Google's native tools.
    pub fn has_google_native_tools(&self) -> bool {
        self.tools.as_ref().map_or(false, |tools| {
            tools.iter().any(|t| GOOGLE_NATIVE_TOOL_NAMES.contains(&t.name.as_str()))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalResponse {
    pub id: String,
    #[serde(rename = "type")]
    pub response_type: String,
    pub role: String,
    pub model: String,
    pub content: Vec<ContentBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<CanonicalUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_data: Option<Value>,
}

/// One decoded stream event in canonical shape. `raw` carries the
/// dialect-native SSE payload so the persistent transformer decorators
/// can buffer the exact bytes while still inspecting `is_terminal`.
#[derive(Debug, Clone)]
pub struct CanonicalStreamEvent {
    pub raw: Vec<u8>,
    pub is_terminal: bool,
    pub usage: Option<CanonicalUsage>,
}

/// Result of aggregating a completed stream's chunks: the reconstructed
/// body, response metadata, and an optional terminal error.
pub struct AggregatedStream {
    pub body: Value,
    pub response_id: Option<String>,
    pub usage: Option<CanonicalUsage>,
}

#[async_trait]
pub trait InboundTransformer: Send + Sync {
    fn api_format(&self) -> &'static str;
    fn detect(&self, headers: &HeaderMap, body: &Value) -> bool;
    fn transform_request(&self, raw: Value) -> anyhow::Result<CanonicalRequest>;
    fn transform_response(&self, canonical: CanonicalResponse) -> anyhow::Result<Vec<u8>>;
    fn transform_stream_event(&self, canonical: &CanonicalStreamEvent) -> anyhow::Result<Vec<u8>>;
    fn transform_error(&self, status: u16, message: &str) -> Vec<u8>;
    fn aggregate_stream_chunks(&self, chunks: &[Vec<u8>]) -> anyhow::Result<AggregatedStream>;
}

/// Symmetric contract per channel: canonical to the channel's raw wire
/// request, raw wire response/stream back to canonical.
pub trait OutboundTransformer: Send + Sync {
    fn channel_type(&self) -> crate::model::ChannelType;
    fn build_request(&self, canonical: &CanonicalRequest, actual_model: &str) -> anyhow::Result<Value>;
    fn parse_response(&self, raw: Value) -> anyhow::Result<CanonicalResponse>;
    fn parse_stream_chunk(&self, chunk: &[u8]) -> anyhow::Result<Vec<CanonicalStreamEvent>>;
    fn aggregate_stream_chunks(&self, chunks: &[Vec<u8>]) -> anyhow::Result<AggregatedStream>;

    /// Hook for channel-specific request signing; identity by default. The
    /// executor calls this immediately before dispatch, after override
    /// middleware has run.
    fn customize_executor(&self, raw_headers: HeaderMap) -> HeaderMap {
        raw_headers
    }
}

/// Maps a channel's wire protocol to its concrete `OutboundTransformer`.
/// `ChannelType::Google` has no dialect implementation yet — callers treat
/// `None` as a channel-configuration error.
pub fn outbound_transformer_for(channel_type: crate::model::ChannelType) -> Option<std::sync::Arc<dyn OutboundTransformer>> {
    use crate::model::ChannelType;
    match channel_type {
        ChannelType::Anthropic => Some(std::sync::Arc::new(anthropic::AnthropicDialect)),
        ChannelType::OpenAi => Some(std::sync::Arc::new(openai::OpenAiDialect)),
        ChannelType::Google => None,
    }
}

/// Exact bytes / event types that mark a stream as successfully complete.
pub fn is_terminal_marker(event_type: Option<&str>, data: &str) -> bool {
    data.trim() == "[DONE]"
        || event_type == Some("response.completed")
        || event_type == Some("message_stop")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_marker_recognizes_all_three_forms() {
        assert!(is_terminal_marker(None, "[DONE]"));
        assert!(is_terminal_marker(Some("response.completed"), ""));
        assert!(is_terminal_marker(Some("message_stop"), ""));
        assert!(!is_terminal_marker(Some("content_block_delta"), "{}"));
    }

    #[test]
    fn canonical_request_serializes_without_optional_fields() {
        let req = CanonicalRequest {
            model: "gpt-4".into(),
            messages: vec![CanonicalMessage {
                role: "user".into(),
                content: Value::String("hi".into()),
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
        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains("max_tokens"));
    }

    fn request_with_tool(name: &str) -> CanonicalRequest {
        CanonicalRequest {
            model: "gpt-4".into(),
            messages: vec![],
            system: None,
            max_tokens: None,
            temperature: None,
            stream: None,
            tools: Some(vec![CanonicalTool {
                name: name.into(),
                description: None,
                input_schema: None,
            }]),
            tool_choice: None,
            stop_sequences: None,
            extra_params: None,
        }
    }

    #[test]
    fn detects_anthropic_native_tool_by_prefix() {
        assert!(request_with_tool("bash_20250124").has_anthropic_native_tools());
        assert!(request_with_tool("text_editor_20250429").has_anthropic_native_tools());
        assert!(!request_with_tool("bash_20250124").has_google_native_tools());
    }

    #[test]
    fn detects_google_native_tool_by_exact_name() {
        assert!(request_with_tool("google_search").has_google_native_tools());
        assert!(!request_with_tool("google_search").has_anthropic_native_tools());
    }

    #[test]
    fn client_defined_tool_matches_neither() {
        let req = request_with_tool("get_weather");
        assert!(!req.has_anthropic_native_tools());
        assert!(!req.has_google_native_tools());
    }
}
