//! Prometheus metrics surface, exposed at `GET /metrics`.
//!
//! Same `lazy_static` + `prometheus::register_*_vec!` idiom this crate has
//! always used for its counters/histograms; the label set moves from
//! tier/frontend to channel/model since routing is now channel-based
//! rather than tier-based.

use crate::dialect::CanonicalRequest;
use axum::response::IntoResponse;
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder, GaugeVec,
    HistogramVec, TextEncoder,
};

lazy_static! {
    static ref REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        "axonhub_requests_total",
        "Total number of inbound requests per original model",
        &["model"]
    )
    .unwrap();

    static ref REQUEST_DURATION: HistogramVec = register_histogram_vec!(
        "axonhub_request_duration_seconds",
        "End-to-end request duration in seconds",
        &["model", "outcome"],
        vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]
    )
    .unwrap();

    static ref CHANNEL_ATTEMPTS_TOTAL: CounterVec = register_counter_vec!(
        "axonhub_channel_attempts_total",
        "Execution attempts per channel and outcome",
        &["channel_id", "outcome"]
    )
    .unwrap();

    static ref CHANNEL_RETRIES_TOTAL: CounterVec = register_counter_vec!(
        "axonhub_channel_retries_total",
        "Retry decisions taken, by kind",
        &["kind"]
    )
    .unwrap();

    static ref ACTIVE_CONNECTIONS: GaugeVec = register_gauge_vec!(
        "axonhub_active_connections",
        "Current in-flight requests per channel",
        &["channel_id"]
    )
    .unwrap();

    static ref ACTIVE_STREAMS: GaugeVec = register_gauge_vec!(
        "axonhub_active_streams",
        "Current open streaming responses per channel",
        &["channel_id"]
    )
    .unwrap();

    static ref PRE_REQUEST_TOKENS: CounterVec = register_counter_vec!(
        "axonhub_pre_request_tokens_total",
        "Estimated input tokens per model and component before dispatch",
        &["model", "component"]
    )
    .unwrap();

    static ref PRE_REQUEST_TOKENS_HIST: HistogramVec = register_histogram_vec!(
        "axonhub_pre_request_tokens",
        "Distribution of estimated pre-request token counts per model",
        &["model"],
        vec![100.0, 500.0, 1000.0, 2000.0, 5000.0, 10000.0, 25000.0, 50000.0, 100000.0, 200000.0]
    )
    .unwrap();
}

/// Characters per token for the crude pre-request estimate below. Not a
/// real BPE tokenizer count (this crate takes actual usage from the
/// canonical response) — only precise enough for audit-log trending.
const CHARS_PER_TOKEN: u64 = 4;

fn estimate_tokens(value: &serde_json::Value) -> u64 {
    estimate_tokens_from_chars(value.to_string().chars().count())
}

fn estimate_tokens_from_chars(char_count: usize) -> u64 {
    (char_count as u64).div_ceil(CHARS_PER_TOKEN)
}

/// Crude pre-request token estimate for audit logging, broken down by
/// component (messages/system/tools) and summed to a total. Returns the
/// total so callers can log it alongside the request id.
pub fn record_pre_request_tokens(model: &str, canonical: &CanonicalRequest) -> u64 {
    let mut total = 0u64;

    let message_tokens: u64 = canonical.messages.iter().map(|m| estimate_tokens(&m.content)).sum();
    if message_tokens > 0 {
        PRE_REQUEST_TOKENS.with_label_values(&[model, "messages"]).inc_by(message_tokens as f64);
    }
    total += message_tokens;

    let system_tokens = canonical.system.as_ref().map(estimate_tokens).unwrap_or(0);
    if system_tokens > 0 {
        PRE_REQUEST_TOKENS.with_label_values(&[model, "system"]).inc_by(system_tokens as f64);
    }
    total += system_tokens;

    let tool_tokens: u64 = canonical
        .tools
        .as_ref()
        .map(|tools| {
            tools
                .iter()
                .map(|t| {
                    let mut chars = t.name.chars().count();
                    if let Some(desc) = &t.description {
                        chars += desc.chars().count();
                    }
                    if let Some(schema) = &t.input_schema {
                        chars += schema.to_string().chars().count();
                    }
                    estimate_tokens_from_chars(chars)
                })
                .sum()
        })
        .unwrap_or(0);
    if tool_tokens > 0 {
        PRE_REQUEST_TOKENS.with_label_values(&[model, "tools"]).inc_by(tool_tokens as f64);
    }
    total += tool_tokens;

    if total > 0 {
        PRE_REQUEST_TOKENS_HIST.with_label_values(&[model]).observe(total as f64);
    }
    total
}

pub fn record_request(model: &str) {
    REQUESTS_TOTAL.with_label_values(&[model]).inc();
}

pub fn record_request_duration(model: &str, outcome: &str, seconds: f64) {
    REQUEST_DURATION.with_label_values(&[model, outcome]).observe(seconds);
}

pub fn record_channel_attempt(channel_id: u64, outcome: &str) {
    CHANNEL_ATTEMPTS_TOTAL
        .with_label_values(&[&channel_id.to_string(), outcome])
        .inc();
}

pub fn record_retry(kind: &str) {
    CHANNEL_RETRIES_TOTAL.with_label_values(&[kind]).inc();
}

pub fn set_active_connections(channel_id: u64, count: usize) {
    ACTIVE_CONNECTIONS
        .with_label_values(&[&channel_id.to_string()])
        .set(count as f64);
}

pub fn inc_active_streams(channel_id: u64) {
    ACTIVE_STREAMS.with_label_values(&[&channel_id.to_string()]).inc();
}

pub fn dec_active_streams(channel_id: u64) {
    ACTIVE_STREAMS.with_label_values(&[&channel_id.to_string()]).dec();
}

/// `GET /metrics`: Prometheus text exposition format.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %err, "failed to encode metrics");
        return (axum::http::StatusCode::INTERNAL_SERVER_ERROR, String::new());
    }
    (
        axum::http::StatusCode::OK,
        String::from_utf8(buffer).unwrap_or_default(),
    )
}
