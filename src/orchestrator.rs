//! Orchestrator & Retry Pipeline: composes the fixed stage order over one
//! request, drives the outbound retryable interface across failures, and
//! hands back either a unary response or a wrapped stream.
//!
//! Authentication, quota accounting, and prompt-injection scanning are
//! external collaborators referenced only by contract, not implemented
//! here. `Middleware` is kept as the extension seam for genuinely
//! in-scope, user-registered steps (e.g. usage accounting), while the
//! in-scope stages (select-candidates, persist-request, overrides,
//! performance-recording, persist-request-execution, connection-tracking)
//! are implemented directly by `Orchestrator::handle` in a fixed order.

use crate::balance::LoadBalancer;
use crate::connection::{ConnectionGuard, ConnectionTracker};
use crate::dialect::{CanonicalResponse, InboundTransformer};
use crate::error::{RouterError, RouterResult};
use crate::executor::{default_headers_for_channel, Executor};
use crate::model::ChannelId;
use crate::overrides::{self, RenderContext};
use crate::perf::PerformanceRecord;
use crate::persist::{InboundPersistentTransformer, OutboundPersistentTransformer};
use crate::policy::{self, ApiKeyModelMapper};
use crate::registry::ChannelRegistry;
use crate::select::{build_default_chain, RetryBudget, Selector, SelectionRequest};
use crate::state::PersistenceState;
use crate::storage::{RequestExecutionRecord, RequestRecord, RequestStatus, Storage, UsageLog};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Selects which composite balancer a request's candidates are scored with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancerStrategy {
    Adaptive,
    Weighted,
}

impl Default for LoadBalancerStrategy {
    fn default() -> Self {
        LoadBalancerStrategy::Adaptive
    }
}

/// `{enabled, max_channel_retries, max_single_channel_retries,
/// retry_delay_ms, load_balancer_strategy}` (spec.md 6).
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub enabled: bool,
    pub max_channel_retries: usize,
    pub max_single_channel_retries: usize,
    pub retry_delay_ms: u64,
    pub load_balancer_strategy: LoadBalancerStrategy,
}

impl RetryPolicy {
    /// Derives a full policy from the selector's lighter-weight
    /// `RetryBudget`, filling in defaults for the fields `LoadBalanced`
    /// doesn't need to compute `required()`.
    pub fn default_for(budget: RetryBudget) -> Self {
        Self {
            enabled: budget.enabled,
            max_channel_retries: budget.max_channel_retries,
            max_single_channel_retries: 0,
            retry_delay_ms: 250,
            load_balancer_strategy: LoadBalancerStrategy::Adaptive,
        }
    }

    pub fn budget(&self) -> RetryBudget {
        RetryBudget {
            enabled: self.enabled,
            max_channel_retries: self.max_channel_retries,
        }
    }

    pub fn balancer(&self) -> LoadBalancer {
        match self.load_balancer_strategy {
            LoadBalancerStrategy::Adaptive => LoadBalancer::adaptive(),
            LoadBalancerStrategy::Weighted => LoadBalancer::weighted(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::default_for(RetryBudget {
            enabled: true,
            max_channel_retries: 2,
        })
    }
}

/// Lifecycle hooks a user-registered middleware may implement; every hook
/// defaults to a no-op so implementors only override what they need
/// (spec.md 4.7's named hook list).
#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &'static str;

    async fn on_inbound_llm_request(&self, _state: &mut PersistenceState) -> RouterResult<()> {
        Ok(())
    }
    async fn on_llm_request(&self, _state: &mut PersistenceState) -> RouterResult<()> {
        Ok(())
    }
    async fn on_outbound_raw_request(&self, _state: &mut PersistenceState, _raw: &mut serde_json::Value) -> RouterResult<()> {
        Ok(())
    }
    async fn on_outbound_raw_response(&self, _state: &mut PersistenceState, _raw: &mut serde_json::Value) -> RouterResult<()> {
        Ok(())
    }
    async fn on_outbound_llm_response(&self, _state: &mut PersistenceState, _resp: &mut CanonicalResponse) -> RouterResult<()> {
        Ok(())
    }
    async fn on_outbound_raw_stream(&self, _state: &mut PersistenceState) -> RouterResult<()> {
        Ok(())
    }
    async fn on_outbound_llm_stream(&self, _state: &mut PersistenceState) -> RouterResult<()> {
        Ok(())
    }
    async fn on_inbound_raw_response(&self, _state: &mut PersistenceState) -> RouterResult<()> {
        Ok(())
    }
    async fn on_outbound_raw_error(&self, _state: &mut PersistenceState, _err: &RouterError) {}
}

/// What the orchestrator hands back to the HTTP layer.
pub enum OrchestratorOutcome {
    Unary { body: Vec<u8> },
    Stream { body: BoxStream<'static, RouterResult<Vec<u8>>> },
}

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_request_id(prefix: &str) -> String {
    let n = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_{n:x}")
}

#[derive(Default)]
pub struct RequestOptions {
    pub trace_id: Option<String>,
    pub tags: Vec<String>,
    pub selected_channel_ids: Vec<ChannelId>,
    pub api_key: Option<String>,
}

/// Drives one request end to end: candidate selection, the per-candidate
/// execution loop, retry, and terminal persistence.
pub struct Orchestrator {
    pub registry: Arc<ChannelRegistry>,
    pub base_selector: Arc<dyn Selector>,
    pub storage: Arc<dyn Storage>,
    pub connections: Arc<ConnectionTracker>,
    pub executor: Arc<dyn Executor>,
    pub retry_policy: RetryPolicy,
    pub middlewares: Vec<Arc<dyn Middleware>>,
    pub model_mapper: Arc<ApiKeyModelMapper>,
}

enum RetryDecision {
    SameChannel,
    NextChannel,
    GiveUp,
}

fn decide_retry(
    policy: &RetryPolicy,
    err: &RouterError,
    has_more_models: bool,
    has_more_channels: bool,
    same_channel_retries: usize,
    cross_channel_retries: usize,
) -> RetryDecision {
    if !policy.enabled {
        return RetryDecision::GiveUp;
    }
    let can_retry = has_more_models || err.is_retryable();
    if can_retry && same_channel_retries < policy.max_single_channel_retries {
        return RetryDecision::SameChannel;
    }
    if has_more_channels && cross_channel_retries < policy.max_channel_retries {
        return RetryDecision::NextChannel;
    }
    RetryDecision::GiveUp
}

impl Orchestrator {
    pub async fn handle(
        &self,
        inbound: Arc<dyn InboundTransformer>,
        raw_request: serde_json::Value,
        opts: RequestOptions,
    ) -> RouterResult<OrchestratorOutcome> {
        let mut canonical = inbound
            .transform_request(raw_request.clone())
            .map_err(|err| RouterError::InvalidModel(err.to_string()))?;

        let profile = self.model_mapper.profile_for(opts.api_key.as_deref()).cloned();
        policy::check_model_access(profile.as_ref(), &canonical.model)?;
        canonical.model = self
            .model_mapper
            .resolve_model(opts.api_key.as_deref(), &canonical.model)
            .to_string();

        let original_model = canonical.model.clone();
        let stream = canonical.stream.unwrap_or(false);
        crate::metrics::record_pre_request_tokens(&original_model, &canonical);

        let load_balancer = Arc::new(self.retry_policy.balancer());
        let retry_budget = self.retry_policy.budget();

        let selection_request = SelectionRequest {
            model: &original_model,
            stream,
            selected_channel_ids: &opts.selected_channel_ids,
            tags: &opts.tags,
            has_google_native_tools: canonical.has_google_native_tools(),
            has_anthropic_native_tools: canonical.has_anthropic_native_tools(),
            trace_id: opts.trace_id.as_deref(),
            storage: self.storage.as_ref(),
            connections: Some(self.connections.as_ref()),
        };
        let chain = build_default_chain(
            self.base_selector.clone(),
            &selection_request,
            load_balancer.clone(),
            retry_budget,
        );

        let mut state = PersistenceState::new(
            raw_request,
            canonical,
            original_model.clone(),
            Vec::new(),
            load_balancer,
            chain.clone(),
            self.retry_policy,
            self.model_mapper.clone(),
        );
        state.trace_id = opts.trace_id.clone();
        state.api_key = opts.api_key.clone();
        state.profile_snapshot = profile
            .as_ref()
            .map(|p| serde_json::to_value(p).unwrap_or(serde_json::Value::Null));
        if let Some(snapshot) = &state.profile_snapshot {
            tracing::debug!(api_key = ?state.api_key, profile = %snapshot, "applying access profile to request");
        }

        for mw in &self.middlewares {
            mw.on_inbound_llm_request(&mut state).await?;
        }

        let candidates = chain.select(&selection_request).await?;
        if candidates.is_empty() {
            return Err(RouterError::InvalidModel(original_model));
        }
        state.set_candidates(candidates);

        for mw in &self.middlewares {
            mw.on_llm_request(&mut state).await?;
        }

        let request_id = next_request_id("req");
        self.storage
            .create_request(RequestRecord {
                id: request_id.clone(),
                channel_id: None,
                original_model: original_model.clone(),
                status: RequestStatus::Pending,
                response_id: None,
                error: None,
            })
            .await
            .map_err(|err| RouterError::Persistence(err.to_string()))?;

        let inbound_persist = InboundPersistentTransformer::new(inbound);
        let mut outbound = OutboundPersistentTransformer::new(state.current_channel().ok_or_else(|| {
            RouterError::InvalidModel(original_model.clone())
        })?.channel_type)
        .map_err(|err| RouterError::InvalidModel(err.to_string()))?;

        let mut same_channel_retries = 0usize;
        let mut cross_channel_retries = 0usize;

        loop {
            let channel = match state.current_channel() {
                Some(c) => c,
                None => return Err(RouterError::CandidatesExhausted),
            };
            outbound.rebind(channel.channel_type).map_err(|err| RouterError::InvalidModel(err.to_string()))?;

            let mut raw_body = outbound.build_request(&state).map_err(|err| RouterError::InvalidModel(err.to_string()))?;
            for mw in &self.middlewares {
                mw.on_outbound_raw_request(&mut state, &mut raw_body).await?;
            }

            let render_ctx = RenderContext {
                request_model: original_model.clone(),
                model: state.canonical_request.model.clone(),
                metadata: serde_json::Value::Null,
                reasoning_effort: None,
            };
            let body_ops = overrides::parse_overrides(&channel.settings.override_request_body);
            overrides::apply_body_overrides(&mut raw_body, &body_ops, &render_ctx);

            let mut headers = default_headers_for_channel(&channel);
            let header_ops = overrides::parse_overrides(&channel.settings.override_request_headers);
            overrides::apply_header_overrides(&mut headers, &header_ops, &render_ctx);
            headers = outbound.customize_executor(headers);

            let perf = PerformanceRecord::start(channel.id, stream);
            state.perf = Some(perf.clone());

            let execution_id = next_request_id("exec");
            let model_entry = state.current_model().cloned();
            let actual_model = model_entry.map(|m| m.actual_model).unwrap_or_default();
            self.storage
                .create_request_execution(RequestExecutionRecord {
                    id: execution_id.clone(),
                    request_id: request_id.clone(),
                    channel_id: channel.id,
                    model: actual_model.clone(),
                    status: RequestStatus::Pending,
                    error: None,
                    first_token_latency_ms: None,
                    request_latency_ms: None,
                    total_latency_ms: None,
                })
                .await
                .map_err(|err| RouterError::Persistence(err.to_string()))?;
            state.request_exec = Some(RequestExecutionRecord {
                id: execution_id.clone(),
                request_id: request_id.clone(),
                channel_id: channel.id,
                model: actual_model,
                status: RequestStatus::Pending,
                error: None,
                first_token_latency_ms: None,
                request_latency_ms: None,
                total_latency_ms: None,
            });

            let guard = ConnectionGuard::acquire(&self.connections, channel.id);
            crate::metrics::set_active_connections(channel.id, self.connections.active(channel.id));

            let outcome = if stream {
                self.executor.execute_stream(&channel, raw_body, headers).await
            } else {
                self.executor.execute(&channel, raw_body, headers).await
            };

            let err = match outcome {
                Ok(crate::executor::Dispatched::Unary(mut raw_resp)) => {
                    guard.release();
                    crate::metrics::set_active_connections(channel.id, self.connections.active(channel.id));
                    crate::metrics::record_channel_attempt(channel.id, "success");
                    for mw in &self.middlewares {
                        mw.on_outbound_raw_response(&mut state, &mut raw_resp).await?;
                    }
                    let canonical_resp = outbound
                        .parse_response(&raw_resp)
                        .map_err(|e| RouterError::UpstreamHttp { status: 502, body: e.to_string() })?;
                    let mut canonical_resp = canonical_resp;
                    for mw in &self.middlewares {
                        mw.on_outbound_llm_response(&mut state, &mut canonical_resp).await?;
                    }
                    let token_count = canonical_resp.usage.as_ref().map(|u| u.output_tokens).unwrap_or(0);
                    if let Some(perf) = state.perf.as_mut() {
                        perf.finish_success(token_count);
                    }
                    self.persist_success(
                        &request_id,
                        &execution_id,
                        &state,
                        &canonical_resp.id,
                        &canonical_resp.usage,
                        channel.id,
                        opts.trace_id.clone(),
                    )
                    .await;
                    let body = inbound_persist
                        .inner
                        .transform_response(canonical_resp)
                        .map_err(|e| RouterError::Persistence(e.to_string()))?;
                    return Ok(OrchestratorOutcome::Unary { body });
                }
                Ok(crate::executor::Dispatched::Stream(raw_stream)) => {
                    crate::metrics::record_channel_attempt(channel.id, "success");
                    crate::metrics::inc_active_streams(channel.id);
                    for mw in &self.middlewares {
                        mw.on_outbound_raw_stream(&mut state).await?;
                    }
                    let wrapped = outbound.wrap_stream(
                        raw_stream,
                        self.storage.clone(),
                        request_id.clone(),
                        execution_id.clone(),
                        channel.id,
                        opts.trace_id.clone(),
                        perf.clone(),
                        guard,
                    );
                    let client_stream = inbound_persist.wrap_stream(wrapped, self.storage.clone(), request_id.clone());
                    for mw in &self.middlewares {
                        mw.on_outbound_llm_stream(&mut state).await?;
                    }
                    return Ok(OrchestratorOutcome::Stream { body: client_stream });
                }
                Err(err) => {
                    guard.release();
                    crate::metrics::set_active_connections(channel.id, self.connections.active(channel.id));
                    crate::metrics::record_channel_attempt(channel.id, "failure");
                    err
                }
            };

            if let Some(perf) = state.perf.as_mut() {
                perf.finish_failure(Some(err.http_status()));
            }
            for mw in &self.middlewares {
                mw.on_outbound_raw_error(&mut state, &err).await;
            }
            // Record this attempt's outcome against its channel immediately
            // (not detached) so `ErrorAware`'s consecutive-failure count
            // reflects every failed attempt, not just the request's final
            // terminal channel.
            self.storage.record_channel_outcome(channel.id, false).await;

            let has_more_models = state.has_more_models_in_current_candidate();
            let has_more_channels = state.has_more_channels();
            match decide_retry(
                &self.retry_policy,
                &err,
                has_more_models,
                has_more_channels,
                same_channel_retries,
                cross_channel_retries,
            ) {
                RetryDecision::SameChannel => {
                    same_channel_retries += 1;
                    crate::metrics::record_retry("same_channel");
                    tokio::time::sleep(Duration::from_millis(self.retry_policy.retry_delay_ms)).await;
                    if has_more_models {
                        state.advance_model();
                    } else {
                        state.reset_execution();
                    }
                }
                RetryDecision::NextChannel => {
                    cross_channel_retries += 1;
                    same_channel_retries = 0;
                    crate::metrics::record_retry("next_channel");
                    tokio::time::sleep(Duration::from_millis(self.retry_policy.retry_delay_ms)).await;
                    state.advance_candidate()?;
                }
                RetryDecision::GiveUp => {
                    self.persist_failure(&request_id, &execution_id, &err).await;
                    return Err(err);
                }
            }
        }
    }

    async fn persist_success(
        &self,
        request_id: &str,
        execution_id: &str,
        state: &PersistenceState,
        response_id: &str,
        usage: &Option<crate::dialect::CanonicalUsage>,
        channel_id: ChannelId,
        trace_id: Option<String>,
    ) {
        let storage = self.storage.clone();
        let request_id = request_id.to_string();
        let execution_id = execution_id.to_string();
        let response_id = response_id.to_string();
        let perf = state.perf.clone();
        let usage = usage.clone();
        crate::persist::persist_detached("persist_success", async move {
            storage.update_request_completed(&request_id, &response_id).await?;
            storage.update_request_channel_id(&request_id, channel_id).await?;
            if let Some(perf) = perf {
                storage.update_request_execution_completed(&execution_id, &perf).await?;
            }
            if let Some(usage) = usage {
                storage
                    .create_usage_log(UsageLog {
                        request_id,
                        channel_id,
                        input_tokens: usage.input_tokens,
                        output_tokens: usage.output_tokens,
                    })
                    .await?;
            }
            // Feeds the success back to storage so `ErrorAware` and
            // `TraceAware` (spec.md 4.2) see it on the next selection.
            storage.record_channel_outcome(channel_id, true).await;
            if let Some(trace_id) = trace_id {
                storage.record_trace_success(&trace_id, channel_id).await;
            }
            Ok(())
        })
        .await;
    }

    async fn persist_failure(&self, request_id: &str, execution_id: &str, err: &RouterError) {
        let storage = self.storage.clone();
        let request_id = request_id.to_string();
        let execution_id = execution_id.to_string();
        let message = err.to_string();
        crate::persist::persist_detached("persist_failure", async move {
            storage.update_request_status_from_error(&request_id, &message).await?;
            storage.update_request_execution_failed(&execution_id, &message).await?;
            Ok(())
        })
        .await;
    }
}
