//! HTTP Executor: `{do(ctx, raw_req) -> (raw_resp, err),
//! do_stream(ctx, raw_req) -> (stream, err)}`, implemented against
//! `reqwest`. Seeds default per-channel-type auth headers; the override
//! middleware runs on top of whatever this seeds.

use crate::error::{RouterError, RouterResult};
use crate::model::{Channel, ChannelType};
use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderValue};
use futures::stream::{BoxStream, StreamExt};
use reqwest::Client;
use serde_json::Value;
use std::sync::Arc;

const DEFAULT_ANTHROPIC_VERSION: &str = "2023-06-01";

/// Seeds the headers a channel needs before the Transform Middleware's
/// header-override stage runs on top.
pub fn default_headers_for_channel(channel: &Channel) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("content-type", HeaderValue::from_static("application/json"));
    match channel.channel_type {
        ChannelType::OpenAi => {
            if let Ok(v) = HeaderValue::from_str(&format!("Bearer {}", channel.api_key)) {
                headers.insert("authorization", v);
            }
        }
        ChannelType::Anthropic => {
            if let Ok(v) = HeaderValue::from_str(&channel.api_key) {
                headers.insert("x-api-key", v);
            }
            headers.insert("anthropic-version", HeaderValue::from_static(DEFAULT_ANTHROPIC_VERSION));
        }
        ChannelType::Google => {
            if let Ok(v) = HeaderValue::from_str(&channel.api_key) {
                headers.insert("x-goog-api-key", v);
            }
        }
    }
    headers
}

fn endpoint_for(channel: &Channel) -> String {
    let base = channel.base_url.trim_end_matches('/');
    let suffix = match channel.channel_type {
        ChannelType::OpenAi => "chat/completions",
        ChannelType::Anthropic => "messages",
        ChannelType::Google => "generateContent",
    };
    if base.ends_with(suffix) {
        base.to_string()
    } else {
        format!("{base}/{suffix}")
    }
}

/// Either shape an execution can produce; `Executor` returns this instead
/// of two separate methods so the orchestrator's retry loop has a single
/// dispatch point regardless of `stream`.
pub enum Dispatched {
    Unary(Value),
    Stream(BoxStream<'static, RouterResult<Vec<u8>>>),
}

#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, channel: &Channel, body: Value, headers: HeaderMap) -> RouterResult<Dispatched>;
    async fn execute_stream(&self, channel: &Channel, body: Value, headers: HeaderMap) -> RouterResult<Dispatched>;
}

pub struct HttpExecutor {
    client: Client,
}

impl HttpExecutor {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn transport_err(err: reqwest::Error) -> RouterError {
    RouterError::UpstreamTransport(err.to_string())
}

#[async_trait]
impl Executor for HttpExecutor {
    async fn execute(&self, channel: &Channel, body: Value, headers: HeaderMap) -> RouterResult<Dispatched> {
        let resp = self
            .client
            .post(endpoint_for(channel))
            .headers(headers)
            .json(&body)
            .send()
            .await
            .map_err(transport_err)?;

        let status = resp.status().as_u16();
        if status == 429 {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(std::time::Duration::from_secs);
            return Err(RouterError::RateLimited { retry_after });
        }
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(RouterError::UpstreamHttp { status, body: text });
        }
        let value: Value = resp.json().await.map_err(transport_err)?;
        Ok(Dispatched::Unary(value))
    }

    async fn execute_stream(&self, channel: &Channel, body: Value, headers: HeaderMap) -> RouterResult<Dispatched> {
        let resp = self
            .client
            .post(endpoint_for(channel))
            .headers(headers)
            .json(&body)
            .send()
            .await
            .map_err(transport_err)?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(RouterError::UpstreamHttp { status, body: text });
        }

        let bytes_stream = resp.bytes_stream().map(|chunk| chunk.map(|b| b.to_vec()).map_err(transport_err));
        Ok(Dispatched::Stream(Box::pin(bytes_stream)))
    }
}

/// Wraps an `Arc<dyn Executor>` so call sites can share one instance across
/// requests without re-threading a concrete type.
pub type SharedExecutor = Arc<dyn Executor>;
