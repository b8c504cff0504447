//! Persistent Transformers: the inbound and outbound transformer
//! decorators that own request/execution persistence, plus the
//! detached-context helper both use for terminal writes.
//!
//! Follows the "decorator wrapping a transformer, delegating most calls"
//! shape, and reuses `ConnectionGuard`'s (`connection.rs`) "exactly once on
//! every exit path" discipline for the streaming variants.

use crate::connection::ConnectionGuard;
use crate::dialect::{
    outbound_transformer_for, CanonicalRequest, CanonicalResponse, CanonicalStreamEvent, CanonicalUsage,
    InboundTransformer, OutboundTransformer,
};
use crate::error::RouterResult;
use crate::model::{ChannelId, ChannelType, TransformOptions};
use crate::perf::PerformanceRecord;
use crate::state::PersistenceState;
use crate::storage::{Storage, UsageLog};
use anyhow::anyhow;
use axum::http::HeaderMap;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Bound on detached terminal-persistence writes (≈ 10s).
const DETACHED_PERSIST_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs `fut` with a fixed timeout, severed from the caller's cancellation
/// by being spawned onto its own task. Failures (error, panic, or timeout)
/// are logged and never propagated to the caller.
pub async fn persist_detached<F>(label: &'static str, fut: F)
where
    F: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let handle = tokio::spawn(fut);
    match tokio::time::timeout(DETACHED_PERSIST_TIMEOUT, handle).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(err))) => warn!(label, error = %err, "persistence failed"),
        Ok(Err(join_err)) => warn!(label, error = %join_err, "persistence task panicked"),
        Err(_) => warn!(label, "persistence timed out"),
    }
}

/// Wraps a dialect's `InboundTransformer`. `transform_request` is a pure
/// delegate — the orchestrator captures `raw_request`/`canonical_request`
/// into `PersistenceState` itself once it has one, immediately after
/// calling this (the state constructor needs a candidate list that isn't
/// known yet at inbound-transform time). This type's load-bearing
/// behavior is `wrap_stream`: request-level stream buffering and
/// close-time persistence.
pub struct InboundPersistentTransformer {
    pub inner: Arc<dyn InboundTransformer>,
}

struct InboundStreamState {
    upstream: BoxStream<'static, RouterResult<CanonicalStreamEvent>>,
    buffer: Vec<Vec<u8>>,
    completed: bool,
    error: Option<String>,
}

impl InboundPersistentTransformer {
    pub fn new(inner: Arc<dyn InboundTransformer>) -> Self {
        Self { inner }
    }

    pub fn transform_request(&self, raw: Value) -> anyhow::Result<CanonicalRequest> {
        self.inner.transform_request(raw)
    }

    /// Buffers every event's raw bytes and tracks whether a terminal
    /// marker was seen; on upstream end (successful or not) persists
    /// exactly once via a detached context.
    pub fn wrap_stream(
        &self,
        upstream: BoxStream<'static, RouterResult<CanonicalStreamEvent>>,
        storage: Arc<dyn Storage>,
        request_id: String,
    ) -> BoxStream<'static, RouterResult<Vec<u8>>> {
        let inner = self.inner.clone();
        let state = InboundStreamState {
            upstream,
            buffer: Vec::new(),
            completed: false,
            error: None,
        };

        stream::unfold(Some(state), move |slot| {
            let inner = inner.clone();
            let storage = storage.clone();
            let request_id = request_id.clone();
            async move {
                let mut st = slot?;
                match st.upstream.next().await {
                    Some(Ok(event)) => {
                        st.buffer.push(event.raw.clone());
                        if event.is_terminal {
                            st.completed = true;
                        }
                        match inner.transform_stream_event(&event) {
                            Ok(bytes) => Some((Ok(bytes), Some(st))),
                            Err(err) => {
                                st.error = Some(err.to_string());
                                finalize_inbound(&inner, &storage, &request_id, st).await;
                                None
                            }
                        }
                    }
                    Some(Err(err)) => {
                        st.error = Some(err.to_string());
                        finalize_inbound(&inner, &storage, &request_id, st).await;
                        None
                    }
                    None => {
                        finalize_inbound(&inner, &storage, &request_id, st).await;
                        None
                    }
                }
            }
        })
        .boxed()
    }
}

async fn finalize_inbound(
    inner: &Arc<dyn InboundTransformer>,
    storage: &Arc<dyn Storage>,
    request_id: &str,
    st: InboundStreamState,
) {
    let inner = inner.clone();
    let storage = storage.clone();
    let request_id = request_id.to_string();
    let InboundStreamState { buffer, completed, error, .. } = st;
    persist_detached("inbound_stream_close", async move {
        if completed {
            let aggregated = inner.aggregate_stream_chunks(&buffer)?;
            let response_id = aggregated.response_id.unwrap_or_else(|| request_id.clone());
            storage.save_request_chunks(&request_id, buffer).await?;
            storage.update_request_completed(&request_id, &response_id).await?;
        } else {
            let message = error.unwrap_or_else(|| "stream closed before completion".to_string());
            storage.update_request_status_from_error(&request_id, &message).await?;
        }
        Ok(())
    })
    .await;
}

/// Out-of-place `transform_options` mutations applied before handing the
/// canonical request to the channel's outbound dialect.
fn apply_transform_options(canonical: &mut CanonicalRequest, opts: &TransformOptions) {
    if opts.developer_role_to_system {
        for message in &mut canonical.messages {
            if message.role == "developer" {
                message.role = "system".to_string();
            }
        }
    }
    if opts.force_array_instructions {
        if let Some(system) = canonical.system.take() {
            let as_array = match system {
                Value::Array(items) => Value::Array(items),
                other => Value::Array(vec![other]),
            };
            canonical.system = Some(as_array);
        }
    }
    if opts.force_array_inputs {
        for message in &mut canonical.messages {
            if matches!(message.content, Value::String(_)) {
                let text = message.content.take();
                message.content = Value::Array(vec![serde_json::json!({ "type": "text", "text": text })]);
            }
        }
    }
}

/// Wraps a channel's `OutboundTransformer` and is itself the retryable
/// surface the orchestrator drives. `current` is rebound to the candidate
/// channel's dialect on every `rebind` call, so the bound dialect always
/// tracks whatever channel the selector has landed on.
pub struct OutboundPersistentTransformer {
    current: Arc<dyn OutboundTransformer>,
}

impl OutboundPersistentTransformer {
    pub fn new(channel_type: ChannelType) -> anyhow::Result<Self> {
        let current = outbound_transformer_for(channel_type)
            .ok_or_else(|| anyhow!("no outbound dialect registered for {:?}", channel_type))?;
        Ok(Self { current })
    }

    pub fn rebind(&mut self, channel_type: ChannelType) -> anyhow::Result<()> {
        self.current = outbound_transformer_for(channel_type)
            .ok_or_else(|| anyhow!("no outbound dialect registered for {:?}", channel_type))?;
        Ok(())
    }

    pub fn customize_executor(&self, headers: HeaderMap) -> HeaderMap {
        self.current.customize_executor(headers)
    }

    /// Reads `current_candidate`/`current_model_index` off `state`, stamps
    /// `actual_model`, applies the channel's `transform_options`, and
    /// delegates to the bound dialect.
    pub fn build_request(&self, state: &PersistenceState) -> anyhow::Result<Value> {
        let model_entry = state.current_model().ok_or_else(|| anyhow!("no current model"))?;
        let channel = state.current_channel().ok_or_else(|| anyhow!("no current channel"))?;
        let mut canonical = state.canonical_request.clone();
        canonical.model = model_entry.actual_model.clone();
        apply_transform_options(&mut canonical, &channel.settings.transform_options);
        self.current.build_request(&canonical, &model_entry.actual_model)
    }

    pub fn parse_response(&self, raw: &Value) -> anyhow::Result<CanonicalResponse> {
        self.current.parse_response(raw.clone())
    }

    /// `has_more_channels`/`next_channel`/`can_retry`/`prepare_for_retry`
    /// are implemented directly on `PersistenceState`, modeled as value
    /// semantics over stable indices rather than shared mutable state;
    /// this type adds only the rebinding step `next_channel` needs, done
    /// by the orchestrator calling `rebind` after `state.advance_candidate()`.
    pub fn wrap_stream(
        &self,
        raw_stream: BoxStream<'static, RouterResult<Vec<u8>>>,
        storage: Arc<dyn Storage>,
        request_id: String,
        execution_id: String,
        channel_id: ChannelId,
        trace_id: Option<String>,
        perf: PerformanceRecord,
        guard: ConnectionGuard,
    ) -> BoxStream<'static, RouterResult<CanonicalStreamEvent>> {
        let dialect = self.current.clone();
        let state = OutboundStreamState {
            raw: raw_stream,
            pending: VecDeque::new(),
            buffer: Vec::new(),
            usage: None,
            completed: false,
            error: None,
            first_token_seen: false,
            perf,
            guard: Some(guard),
        };

        stream::unfold(Some(state), move |slot| {
            let dialect = dialect.clone();
            let storage = storage.clone();
            let request_id = request_id.clone();
            let execution_id = execution_id.clone();
            let trace_id = trace_id.clone();
            async move {
                let mut st = slot?;
                loop {
                    if let Some(event) = st.pending.pop_front() {
                        if event.is_terminal {
                            st.completed = true;
                        }
                        if event.usage.is_some() {
                            st.usage = event.usage.clone();
                        }
                        if !st.first_token_seen {
                            st.first_token_seen = true;
                            st.perf.record_first_token();
                        }
                        return Some((Ok(event), Some(st)));
                    }

                    match st.raw.next().await {
                        Some(Ok(chunk)) => {
                            st.buffer.push(chunk.clone());
                            match dialect.parse_stream_chunk(&chunk) {
                                Ok(events) => {
                                    if events.is_empty() {
                                        continue;
                                    }
                                    st.pending.extend(events);
                                }
                                Err(err) => {
                                    st.error = Some(err.to_string());
                                    finalize_outbound(
                                        &dialect,
                                        &storage,
                                        &request_id,
                                        &execution_id,
                                        channel_id,
                                        trace_id,
                                        st,
                                    )
                                    .await;
                                    return None;
                                }
                            }
                        }
                        Some(Err(err)) => {
                            st.error = Some(err.to_string());
                            finalize_outbound(&dialect, &storage, &request_id, &execution_id, channel_id, trace_id, st)
                                .await;
                            return None;
                        }
                        None => {
                            finalize_outbound(&dialect, &storage, &request_id, &execution_id, channel_id, trace_id, st)
                                .await;
                            return None;
                        }
                    }
                }
            }
        })
        .boxed()
    }
}

struct OutboundStreamState {
    raw: BoxStream<'static, RouterResult<Vec<u8>>>,
    pending: VecDeque<CanonicalStreamEvent>,
    buffer: Vec<Vec<u8>>,
    usage: Option<CanonicalUsage>,
    completed: bool,
    error: Option<String>,
    first_token_seen: bool,
    perf: PerformanceRecord,
    guard: Option<ConnectionGuard>,
}

async fn finalize_outbound(
    dialect: &Arc<dyn OutboundTransformer>,
    storage: &Arc<dyn Storage>,
    request_id: &str,
    execution_id: &str,
    channel_id: ChannelId,
    trace_id: Option<String>,
    mut st: OutboundStreamState,
) {
    if let Some(guard) = st.guard.take() {
        guard.release();
    }
    crate::metrics::dec_active_streams(channel_id);
    let dialect = dialect.clone();
    let storage = storage.clone();
    let request_id = request_id.to_string();
    let execution_id = execution_id.to_string();
    let completed = st.completed;
    let mut perf = st.perf.clone();
    let buffer = std::mem::take(&mut st.buffer);
    let usage = st.usage.clone();
    let error = st.error.clone();

    persist_detached("outbound_stream_close", async move {
        if completed {
            let aggregated = dialect.aggregate_stream_chunks(&buffer)?;
            let token_count = aggregated
                .usage
                .as_ref()
                .or(usage.as_ref())
                .map(|u| u.output_tokens)
                .unwrap_or(0);
            perf.finish_success(token_count);
            storage.save_request_execution_chunks(&execution_id, buffer).await?;
            storage.update_request_execution_completed(&execution_id, &perf).await?;
            if let Some(usage) = aggregated.usage.or(usage) {
                storage
                    .create_usage_log(UsageLog {
                        request_id,
                        channel_id,
                        input_tokens: usage.input_tokens,
                        output_tokens: usage.output_tokens,
                    })
                    .await?;
            }
            storage.record_channel_outcome(channel_id, true).await;
            if let Some(trace_id) = trace_id {
                storage.record_trace_success(&trace_id, channel_id).await;
            }
        } else {
            storage.record_channel_outcome(channel_id, false).await;
            perf.finish_failure(None);
            let message = error.unwrap_or_else(|| "stream closed before completion".to_string());
            storage.update_request_execution_failed(&execution_id, &message).await?;
        }
        Ok(())
    })
    .await;
}
