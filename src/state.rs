//! Persistence State: the per-request mutable record threaded through the
//! orchestrator's middleware chain.
//!
//! Plays the role of the single struct every middleware closes over,
//! generalized from "shared app config" to a per-request record with
//! single-threaded mutation. Fields are written once except a handful
//! (`current_candidate_index`, `current_model_index`, `request_exec`,
//! `perf`, `stream_completed`), which the retry pipeline and stream
//! observers mutate in place.

use crate::balance::LoadBalancer;
use crate::dialect::CanonicalRequest;
use crate::error::{RouterError, RouterResult};
use crate::model::ChannelModelsCandidate;
use crate::orchestrator::RetryPolicy;
use crate::perf::PerformanceRecord;
use crate::policy::ApiKeyModelMapper;
use crate::select::Selector;
use crate::storage::{RequestExecutionRecord, RequestRecord};
use std::sync::Arc;

/// Per-request mutable context. Not shared across requests; the
/// orchestrator constructs one per inbound call and discards it once the
/// response (or stream) completes.
pub struct PersistenceState {
    pub raw_request: serde_json::Value,
    pub canonical_request: CanonicalRequest,
    pub original_model: String,
    pub api_key: Option<String>,
    pub trace_id: Option<String>,
    pub profile_snapshot: Option<serde_json::Value>,
    pub proxy_url: Option<String>,

    pub candidates: Vec<ChannelModelsCandidate>,
    pub current_candidate_index: usize,
    pub current_model_index: usize,

    pub request_record: Option<RequestRecord>,
    pub request_exec: Option<RequestExecutionRecord>,
    pub perf: Option<PerformanceRecord>,
    pub stream_completed: bool,

    pub load_balancer: Arc<LoadBalancer>,
    pub selector: Arc<dyn Selector>,
    pub retry_policy: RetryPolicy,
    pub model_mapper: Arc<ApiKeyModelMapper>,
}

impl PersistenceState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        raw_request: serde_json::Value,
        canonical_request: CanonicalRequest,
        original_model: String,
        candidates: Vec<ChannelModelsCandidate>,
        load_balancer: Arc<LoadBalancer>,
        selector: Arc<dyn Selector>,
        retry_policy: RetryPolicy,
        model_mapper: Arc<ApiKeyModelMapper>,
    ) -> Self {
        Self {
            raw_request,
            canonical_request,
            original_model,
            api_key: None,
            trace_id: None,
            profile_snapshot: None,
            proxy_url: None,
            candidates,
            current_candidate_index: 0,
            current_model_index: 0,
            request_record: None,
            request_exec: None,
            perf: None,
            stream_completed: false,
            load_balancer,
            selector,
            retry_policy,
            model_mapper,
        }
    }

    /// `(candidate_index, model_index)` dereferenced on use rather than a
    /// shared mutable reference into `candidates`.
    pub fn current_candidate(&self) -> Option<&ChannelModelsCandidate> {
        self.candidates.get(self.current_candidate_index)
    }

    pub fn current_model(&self) -> Option<&crate::model::ChannelModelEntry> {
        self.current_candidate()
            .and_then(|c| c.models.get(self.current_model_index))
    }

    pub fn current_channel(&self) -> Option<Arc<crate::model::Channel>> {
        self.current_candidate().map(|c| c.channel.clone())
    }

    pub fn has_more_channels(&self) -> bool {
        self.current_candidate_index + 1 < self.candidates.len()
    }

    pub fn has_more_models_in_current_candidate(&self) -> bool {
        self.current_candidate()
            .map(|c| self.current_model_index + 1 < c.models.len())
            .unwrap_or(false)
    }

    /// Advance to the next candidate, resetting the model index and the
    /// execution pointer. Fails if candidates are exhausted.
    pub fn advance_candidate(&mut self) -> RouterResult<()> {
        if !self.has_more_channels() {
            return Err(RouterError::CandidatesExhausted);
        }
        self.current_candidate_index += 1;
        self.current_model_index = 0;
        self.request_exec = None;
        Ok(())
    }

    /// Advance to the next model within the current candidate, if any.
    pub fn advance_model(&mut self) -> bool {
        if self.has_more_models_in_current_candidate() {
            self.current_model_index += 1;
            self.request_exec = None;
            true
        } else {
            false
        }
    }

    /// Reset the execution pointer only, keeping the same channel/model —
    /// used for same-channel same-model retries.
    pub fn reset_execution(&mut self) {
        self.request_exec = None;
    }

    /// Installs the selector's output once candidate selection completes.
    /// `PersistenceState` is constructed before selection runs (the inbound
    /// transformer needs a place to stash `raw_request`/`canonical_request`
    /// first), so this is the one field set after construction rather than
    /// by it — the exactly-once write rule applies from this point on.
    pub fn set_candidates(&mut self, candidates: Vec<ChannelModelsCandidate>) {
        self.candidates = candidates;
        self.current_candidate_index = 0;
        self.current_model_index = 0;
        self.request_exec = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::CanonicalMessage;
    use crate::model::{Channel, ChannelModelEntry, ChannelSettings, ChannelType, EntrySource};
    use crate::select::{RetryBudget, SelectedChannels};
    use std::collections::HashSet;

    fn channel(id: u64) -> Arc<Channel> {
        Arc::new(Channel {
            id,
            name: format!("ch{id}"),
            channel_type: ChannelType::OpenAi,
            base_url: "https://example.com".into(),
            api_key: "sk".into(),
            models: vec!["gpt-4".into()],
            model_mappings: vec![],
            extra_prefix: None,
            auto_trim_prefix: None,
            weight: 50,
            tags: HashSet::new(),
            enabled: true,
            settings: ChannelSettings::default(),
            max_connections: 0,
            updated_at: 0,
        })
    }

    fn candidate(id: u64, models: Vec<&str>) -> ChannelModelsCandidate {
        ChannelModelsCandidate {
            channel: channel(id),
            priority: 0,
            models: models
                .into_iter()
                .map(|m| ChannelModelEntry {
                    request_model: m.into(),
                    actual_model: m.into(),
                    source: EntrySource::Direct,
                })
                .collect(),
        }
    }

    fn state(candidates: Vec<ChannelModelsCandidate>) -> PersistenceState {
        let req = CanonicalRequest {
            model: "gpt-4".into(),
            messages: vec![CanonicalMessage {
                role: "user".into(),
                content: serde_json::Value::String("hi".into()),
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
        let selector: Arc<dyn Selector> = Arc::new(SelectedChannels::new(
            Arc::new(crate::select::SpecifiedChannelSelector::new(
                Arc::new(crate::registry::ChannelRegistry::new(vec![], vec![])),
                1,
            )),
            vec![],
        ));
        PersistenceState::new(
            serde_json::json!({}),
            req,
            "gpt-4".into(),
            candidates,
            Arc::new(LoadBalancer::weighted()),
            selector,
            RetryPolicy::default_for(RetryBudget {
                enabled: true,
                max_channel_retries: 2,
            }),
            Arc::new(ApiKeyModelMapper::default()),
        )
    }

    #[test]
    fn advance_model_before_advance_candidate() {
        let mut s = state(vec![candidate(1, vec!["a", "b"]), candidate(2, vec!["c"])]);
        assert!(s.advance_model());
        assert_eq!(s.current_model_index, 1);
        assert!(!s.advance_model());
        assert!(s.has_more_channels());
        s.advance_candidate().unwrap();
        assert_eq!(s.current_candidate_index, 1);
        assert_eq!(s.current_model_index, 0);
    }

    #[test]
    fn advance_candidate_fails_when_exhausted() {
        let mut s = state(vec![candidate(1, vec!["a"])]);
        assert!(s.advance_candidate().is_err());
    }

    #[test]
    fn current_pointers_dereference_by_index() {
        let s = state(vec![candidate(7, vec!["m1"])]);
        assert_eq!(s.current_channel().unwrap().id, 7);
        assert_eq!(s.current_model().unwrap().actual_model, "m1");
    }
}
