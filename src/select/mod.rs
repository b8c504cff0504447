//! Candidate Selector pipeline (spec.md 4.3).
//!
//! Grounded structurally on `ccr-rust::transformer::{Transformer,
//! TransformerChain}` — a single-method trait object composed via
//! constructors — generalized from a linear chain to the spec's decorator
//! stack with early-exit semantics in `LoadBalanced`.

pub mod decorators;

use crate::balance::LoadBalancer;
use crate::error::{RouterError, RouterResult};
use crate::model::{Association, ChannelId, ChannelModelEntry, ChannelModelsCandidate, ModelId};
use crate::registry::ChannelRegistry;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Minimal request shape the selector needs; the orchestrator's canonical
/// request carries more fields but only these are relevant to candidate
/// resolution. Carries the scoring context (trace id, storage, connection
/// tracker) through the decorator chain so `LoadBalanced` can hand it to
/// the balancer without the `Selector` trait itself growing those
/// parameters.
pub struct SelectionRequest<'a> {
    pub model: &'a str,
    pub stream: bool,
    pub selected_channel_ids: &'a [ChannelId],
    pub tags: &'a [String],
    pub has_google_native_tools: bool,
    pub has_anthropic_native_tools: bool,
    pub trace_id: Option<&'a str>,
    pub storage: &'a dyn crate::storage::Storage,
    pub connections: Option<&'a crate::connection::ConnectionTracker>,
}

#[async_trait]
pub trait Selector: Send + Sync {
    async fn select(&self, req: &SelectionRequest<'_>) -> RouterResult<Vec<ChannelModelsCandidate>>;
}

#[derive(Debug, Clone)]
struct CacheEntry {
    candidates: Vec<(ChannelId, i32, Vec<ChannelModelEntry>)>,
    enabled_channel_count: usize,
    latest_channel_updated_at: i64,
    model_updated_at: i64,
    cached_at: Instant,
}

const CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// Innermost selector: resolves an AxonHub model's associations, or falls
/// through to a scan of enabled channels' unified model maps.
pub struct DefaultSelector {
    registry: Arc<ChannelRegistry>,
    fallback_to_channels_on_model_not_found: bool,
    cache: RwLock<HashMap<ModelId, CacheEntry>>,
}

impl DefaultSelector {
    pub fn new(registry: Arc<ChannelRegistry>, fallback_to_channels_on_model_not_found: bool) -> Self {
        Self {
            registry,
            fallback_to_channels_on_model_not_found,
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn resolve_associations(&self, associations: &[Association]) -> Vec<(ChannelId, i32, Vec<ChannelModelEntry>)> {
        // group emissions by (channel_id, priority), preserving emission order;
        // dedup by actual_model (first wins) happens once per group below.
        let mut groups: Vec<(ChannelId, i32, Vec<ChannelModelEntry>)> = Vec::new();
        let mut index: HashMap<(ChannelId, i32), usize> = HashMap::new();

        let mut emit = |channel_id: ChannelId, priority: i32, entry: ChannelModelEntry| {
            let key = (channel_id, priority);
            let idx = *index.entry(key).or_insert_with(|| {
                groups.push((channel_id, priority, Vec::new()));
                groups.len() - 1
            });
            groups[idx].2.push(entry);
        };

        for assoc in associations {
            match assoc {
                Association::ChannelModel {
                    priority,
                    channel_id,
                    model_id,
                } => {
                    if let Some(channel) = self.registry.get_channel(*channel_id) {
                        if channel.enabled {
                            if let Some(entry) = channel.lookup_entry(model_id) {
                                emit(*channel_id, *priority, entry);
                            }
                        }
                    }
                }
                Association::ChannelRegex {
                    priority,
                    channel_id,
                    pattern,
                } => {
                    if let Some(channel) = self.registry.get_channel(*channel_id) {
                        if channel.enabled {
                            if let Some(re) = crate::model::compile_regex(pattern) {
                                for entry in channel.unified_model_entries().into_values() {
                                    if re.is_match(&entry.request_model) {
                                        emit(*channel_id, *priority, entry);
                                    }
                                }
                            }
                        }
                    }
                }
                Association::Regex { priority, pattern } => {
                    if let Some(re) = crate::model::compile_regex(pattern) {
                        for channel in self.registry.enabled_channels() {
                            for entry in channel.unified_model_entries().into_values() {
                                if re.is_match(&entry.request_model) {
                                    emit(channel.id, *priority, entry);
                                }
                            }
                        }
                    }
                }
                Association::Model { priority, model_id } => {
                    for channel in self.registry.enabled_channels() {
                        if let Some(entry) = channel.lookup_entry(model_id) {
                            emit(channel.id, *priority, entry);
                        }
                    }
                }
            }
        }

        for group in &mut groups {
            group.2 = ChannelModelsCandidate::dedup_by_actual_model(std::mem::take(&mut group.2));
        }

        groups
    }

    fn materialize(&self, groups: &[(ChannelId, i32, Vec<ChannelModelEntry>)]) -> Vec<ChannelModelsCandidate> {
        groups
            .iter()
            .filter_map(|(channel_id, priority, models)| {
                let channel = self.registry.get_channel(*channel_id)?;
                Some(ChannelModelsCandidate {
                    channel,
                    priority: *priority,
                    models: models.clone(),
                })
            })
            .collect()
    }

    fn cache_valid(
        &self,
        entry: &CacheEntry,
        enabled_channel_count: usize,
        latest_channel_updated_at: i64,
        model_updated_at: i64,
    ) -> bool {
        entry.enabled_channel_count == enabled_channel_count
            && entry.latest_channel_updated_at == latest_channel_updated_at
            && entry.model_updated_at == model_updated_at
            && entry.cached_at.elapsed() < CACHE_TTL
    }
}

#[async_trait]
impl Selector for DefaultSelector {
    async fn select(&self, req: &SelectionRequest<'_>) -> RouterResult<Vec<ChannelModelsCandidate>> {
        if let Some(model) = self.registry.get_model(req.model) {
            if model.associations.is_empty() {
                // spec.md 9 open question: fail-fast rather than fall through.
                return Ok(Vec::new());
            }

            let (enabled_channel_count, latest_channel_updated_at) = self.registry.enabled_channel_fingerprint();
            let model_updated_at = self.registry.model_updated_at(req.model);

            {
                let cache = self.cache.read();
                if let Some(entry) = cache.get(req.model) {
                    if self.cache_valid(entry, enabled_channel_count, latest_channel_updated_at, model_updated_at) {
                        return Ok(self.materialize(&entry.candidates));
                    }
                }
            }

            let groups = self.resolve_associations(&model.associations);
            {
                let mut cache = self.cache.write();
                cache.insert(
                    req.model.to_string(),
                    CacheEntry {
                        candidates: groups.clone(),
                        enabled_channel_count,
                        latest_channel_updated_at,
                        model_updated_at,
                        cached_at: Instant::now(),
                    },
                );
            }
            return Ok(self.materialize(&groups));
        }

        if !self.fallback_to_channels_on_model_not_found {
            return Err(RouterError::InvalidModel(req.model.to_string()));
        }

        let mut candidates = Vec::new();
        for channel in self.registry.enabled_channels() {
            if let Some(entry) = channel.lookup_entry(req.model) {
                candidates.push(ChannelModelsCandidate {
                    channel,
                    priority: 0,
                    models: vec![entry],
                });
            }
        }
        Ok(candidates)
    }
}

/// Test-only selector: bypasses enablement and all decorators, returning
/// exactly one candidate for a specific channel id and model.
pub struct SpecifiedChannelSelector {
    registry: Arc<ChannelRegistry>,
    channel_id: ChannelId,
}

impl SpecifiedChannelSelector {
    pub fn new(registry: Arc<ChannelRegistry>, channel_id: ChannelId) -> Self {
        Self { registry, channel_id }
    }
}

#[async_trait]
impl Selector for SpecifiedChannelSelector {
    async fn select(&self, req: &SelectionRequest<'_>) -> RouterResult<Vec<ChannelModelsCandidate>> {
        let channel = self
            .registry
            .get_channel_any(self.channel_id)
            .ok_or_else(|| RouterError::InvalidModel(req.model.to_string()))?;
        let entry = channel
            .lookup_entry(req.model)
            .ok_or_else(|| RouterError::InvalidModel(req.model.to_string()))?;
        Ok(vec![ChannelModelsCandidate {
            channel,
            priority: 0,
            models: vec![entry],
        }])
    }
}

/// Retry policy shape needed by `LoadBalanced` to compute `required`; the
/// full policy (with delay/strategy fields) lives in `orchestrator`.
#[derive(Debug, Clone, Copy)]
pub struct RetryBudget {
    pub enabled: bool,
    pub max_channel_retries: usize,
}

impl RetryBudget {
    pub fn required(&self) -> usize {
        if self.enabled {
            1 + self.max_channel_retries
        } else {
            1
        }
    }
}

pub use decorators::{
    AnthropicNativeTools, GoogleNativeTools, LoadBalanced, SelectedChannels, StreamPolicyFilter,
    TagsFilter,
};

pub fn build_default_chain(
    inner: Arc<dyn Selector>,
    req_like: &SelectionRequest<'_>,
    balancer: Arc<LoadBalancer>,
    retry_budget: RetryBudget,
) -> Arc<dyn Selector> {
    let mut chain: Arc<dyn Selector> = inner;
    chain = Arc::new(StreamPolicyFilter::new(chain));
    if req_like.has_anthropic_native_tools {
        chain = Arc::new(AnthropicNativeTools::new(chain));
    }
    if req_like.has_google_native_tools {
        chain = Arc::new(GoogleNativeTools::new(chain));
    }
    if !req_like.tags.is_empty() {
        chain = Arc::new(TagsFilter::new(chain, req_like.tags.to_vec()));
    }
    if !req_like.selected_channel_ids.is_empty() {
        chain = Arc::new(SelectedChannels::new(chain, req_like.selected_channel_ids.to_vec()));
    }
    Arc::new(LoadBalanced::new(chain, balancer, retry_budget))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Channel, ChannelSettings, ChannelType, RouterModel};
    use std::collections::HashSet;

    fn channel(id: ChannelId) -> Channel {
        Channel {
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
        }
    }

    #[tokio::test]
    async fn model_with_empty_associations_returns_empty_not_fallback() {
        let registry = Arc::new(ChannelRegistry::new(
            vec![channel(1)],
            vec![RouterModel {
                model_id: "virtual".into(),
                enabled: true,
                associations: vec![],
                updated_at: 0,
            }],
        ));
        let selector = DefaultSelector::new(registry, true);
        let store = crate::storage::MemoryStore::new();
        let req = SelectionRequest {
            model: "virtual",
            stream: false,
            selected_channel_ids: &[],
            tags: &[],
            has_google_native_tools: false,
            has_anthropic_native_tools: false,
            trace_id: None,
            storage: &store,
            connections: None,
        };
        let result = selector.select(&req).await.unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn fallback_scans_channels_when_model_missing_and_fallback_enabled() {
        let registry = Arc::new(ChannelRegistry::new(vec![channel(1)], vec![]));
        let selector = DefaultSelector::new(registry, true);
        let store = crate::storage::MemoryStore::new();
        let req = SelectionRequest {
            model: "gpt-4",
            stream: false,
            selected_channel_ids: &[],
            tags: &[],
            has_google_native_tools: false,
            has_anthropic_native_tools: false,
            trace_id: None,
            storage: &store,
            connections: None,
        };
        let result = selector.select(&req).await.unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].channel.id, 1);
    }

    #[tokio::test]
    async fn missing_model_without_fallback_is_invalid_model_error() {
        let registry = Arc::new(ChannelRegistry::new(vec![channel(1)], vec![]));
        let selector = DefaultSelector::new(registry, false);
        let store = crate::storage::MemoryStore::new();
        let req = SelectionRequest {
            model: "gpt-4",
            stream: false,
            selected_channel_ids: &[],
            tags: &[],
            has_google_native_tools: false,
            has_anthropic_native_tools: false,
            trace_id: None,
            storage: &store,
            connections: None,
        };
        let err = selector.select(&req).await.unwrap_err();
        assert!(matches!(err, RouterError::InvalidModel(_)));
    }

    #[tokio::test]
    async fn association_groups_dedup_same_channel_and_priority_into_one_candidate() {
        let registry = Arc::new(ChannelRegistry::new(
            vec![channel(1)],
            vec![RouterModel {
                model_id: "virtual".into(),
                enabled: true,
                associations: vec![
                    Association::ChannelModel {
                        priority: 0,
                        channel_id: 1,
                        model_id: "gpt-4".into(),
                    },
                    Association::ChannelModel {
                        priority: 0,
                        channel_id: 1,
                        model_id: "gpt-4".into(),
                    },
                ],
                updated_at: 0,
            }],
        ));
        let selector = DefaultSelector::new(registry, true);
        let store = crate::storage::MemoryStore::new();
        let req = SelectionRequest {
            model: "virtual",
            stream: false,
            selected_channel_ids: &[],
            tags: &[],
            has_google_native_tools: false,
            has_anthropic_native_tools: false,
            trace_id: None,
            storage: &store,
            connections: None,
        };
        let result = selector.select(&req).await.unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].models.len(), 1);
    }

    #[test]
    fn required_count_matches_retry_policy() {
        let enabled = RetryBudget {
            enabled: true,
            max_channel_retries: 2,
        };
        assert_eq!(enabled.required(), 3);
        let disabled = RetryBudget {
            enabled: false,
            max_channel_retries: 2,
        };
        assert_eq!(disabled.required(), 1);
    }
}
