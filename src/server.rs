//! HTTP ingress: binds the orchestrator to axum routes. Authentication,
//! quota accounting, and request-body validation beyond "is this valid
//! JSON" are out of scope — this layer's only job is translating an HTTP
//! request into an `Orchestrator::handle` call and its outcome back into
//! an HTTP response.

use crate::config::Config;
use crate::connection::ConnectionTracker;
use crate::dialect::anthropic::AnthropicDialect;
use crate::dialect::openai::OpenAiDialect;
use crate::dialect::InboundTransformer;
use crate::error::RouterError;
use crate::executor::{Executor, HttpExecutor};
use crate::metrics;
use crate::orchestrator::{Orchestrator, OrchestratorOutcome, RequestOptions};
use crate::registry::ChannelRegistry;
use crate::select::{DefaultSelector, Selector};
use crate::storage::{MemoryStore, Storage};
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    /// Wires a fresh in-process `Orchestrator` from a loaded `Config`:
    /// `config.build_registry()` for channels/models, an in-memory
    /// `Storage`, a process-lifetime `ConnectionTracker`, and an
    /// `HttpExecutor` built on the config's shared `reqwest::Client`.
    pub fn from_config(config: &Config) -> Self {
        let registry = Arc::new(config.build_registry());
        let base_selector: Arc<dyn Selector> = Arc::new(DefaultSelector::new(
            registry.clone(),
            config.file().fallback_to_channels_on_model_not_found,
        ));
        let storage: Arc<dyn Storage> = Arc::new(MemoryStore::new());
        let connections = Arc::new(ConnectionTracker::new());
        let executor: Arc<dyn Executor> = Arc::new(HttpExecutor::new(config.http_client()));

        Self {
            orchestrator: Arc::new(Orchestrator {
                registry,
                base_selector,
                storage,
                connections,
                executor,
                retry_policy: config.retry_policy(),
                middlewares: Vec::new(),
                model_mapper: config.build_model_mapper(),
            }),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/messages", post(messages_handler))
        .route("/v1/chat/completions", post(chat_completions_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics::metrics_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

async fn messages_handler(State(state): State<AppState>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    dispatch(state, Arc::new(AnthropicDialect), headers, body).await
}

async fn chat_completions_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    dispatch(state, Arc::new(OpenAiDialect), headers, body).await
}

fn request_options(headers: &HeaderMap) -> RequestOptions {
    RequestOptions {
        trace_id: headers
            .get("x-trace-id")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string()),
        tags: Vec::new(),
        selected_channel_ids: Vec::new(),
        api_key: headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.trim_start_matches("Bearer ").to_string()),
    }
}

async fn dispatch(state: AppState, inbound: Arc<dyn InboundTransformer>, headers: HeaderMap, body: Value) -> Response {
    let model = body
        .get("model")
        .and_then(|m| m.as_str())
        .unwrap_or("unknown")
        .to_string();
    metrics::record_request(&model);
    let started = Instant::now();
    let opts = request_options(&headers);

    match state.orchestrator.handle(inbound.clone(), body, opts).await {
        Ok(OrchestratorOutcome::Unary { body }) => {
            metrics::record_request_duration(&model, "success", started.elapsed().as_secs_f64());
            (
                StatusCode::OK,
                [("content-type", "application/json")],
                body,
            )
                .into_response()
        }
        Ok(OrchestratorOutcome::Stream { body }) => {
            metrics::record_request_duration(&model, "success", started.elapsed().as_secs_f64());
            (
                StatusCode::OK,
                [("content-type", "text/event-stream")],
                Body::from_stream(body),
            )
                .into_response()
        }
        Err(err) => {
            metrics::record_request_duration(&model, "error", started.elapsed().as_secs_f64());
            let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            let payload = inbound.transform_error(err.http_status(), &err.to_string());
            (status, [("content-type", "application/json")], payload).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigFile;
    use crate::model::{Channel, ChannelSettings, ChannelType};
    use http_body_util::BodyExt;
    use std::collections::HashSet;
    use tower::ServiceExt;

    fn channel(base_url: String) -> Channel {
        Channel {
            id: 1,
            name: "test".into(),
            channel_type: ChannelType::OpenAi,
            base_url,
            api_key: "sk-test".into(),
            models: vec!["gpt-4o".into()],
            model_mappings: vec![],
            extra_prefix: None,
            auto_trim_prefix: None,
            weight: 50,
            tags: HashSet::new(),
            enabled: true,
            settings: ChannelSettings::default(),
            max_connections: 0,
            updated_at: 0,
        }
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let config = Config::from_config_file(ConfigFile::default()).unwrap();
        let app = build_router(AppState::from_config(&config));
        let response = app
            .oneshot(axum::http::Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn chat_completions_with_unknown_model_returns_400() {
        let mock = wiremock::MockServer::start().await;
        let mut file = ConfigFile::default();
        file.channels.push(channel(mock.uri()));
        let config = Config::from_config_file(file).unwrap();
        let app = build_router(AppState::from_config(&config));

        let req = axum::http::Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({ "model": "not-configured", "messages": [{"role": "user", "content": "hi"}] })
                    .to_string(),
            ))
            .unwrap();

        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json: Value = serde_json::from_slice(&bytes).unwrap();
        assert!(json["error"].is_object());
    }
}
