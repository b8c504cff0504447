use super::{RetryBudget, Selector, SelectionRequest};
use crate::balance::{LoadBalancer, ScoringContext};
use crate::error::RouterResult;
use crate::model::{ChannelId, ChannelModelsCandidate, StreamPolicy};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// Keeps only candidates whose channel id is in `ids`, when `ids` is
/// non-empty. Empty `ids` passes everything through.
pub struct SelectedChannels {
    inner: Arc<dyn Selector>,
    ids: HashSet<ChannelId>,
}

impl SelectedChannels {
    pub fn new(inner: Arc<dyn Selector>, ids: Vec<ChannelId>) -> Self {
        Self {
            inner,
            ids: ids.into_iter().collect(),
        }
    }
}

#[async_trait]
impl Selector for SelectedChannels {
    async fn select(&self, req: &SelectionRequest<'_>) -> RouterResult<Vec<ChannelModelsCandidate>> {
        let candidates = self.inner.select(req).await?;
        if self.ids.is_empty() {
            return Ok(candidates);
        }
        Ok(candidates.into_iter().filter(|c| self.ids.contains(&c.channel.id)).collect())
    }
}

/// Keeps candidates whose channel tag set intersects the filter tags (OR).
/// Channels without tags never match when a filter is given. Case-sensitive.
pub struct TagsFilter {
    inner: Arc<dyn Selector>,
    tags: HashSet<String>,
}

impl TagsFilter {
    pub fn new(inner: Arc<dyn Selector>, tags: Vec<String>) -> Self {
        Self {
            inner,
            tags: tags.into_iter().collect(),
        }
    }
}

#[async_trait]
impl Selector for TagsFilter {
    async fn select(&self, req: &SelectionRequest<'_>) -> RouterResult<Vec<ChannelModelsCandidate>> {
        let candidates = self.inner.select(req).await?;
        if self.tags.is_empty() {
            return Ok(candidates);
        }
        Ok(candidates
            .into_iter()
            .filter(|c| !c.channel.tags.is_disjoint(&self.tags))
            .collect())
    }
}

/// Applied only for the Gemini native dialect. Prefers candidates whose
/// channel declares Google-native-tools support; degrades to the
/// unfiltered list if that would empty the result.
pub struct GoogleNativeTools {
    inner: Arc<dyn Selector>,
}

impl GoogleNativeTools {
    pub fn new(inner: Arc<dyn Selector>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Selector for GoogleNativeTools {
    async fn select(&self, req: &SelectionRequest<'_>) -> RouterResult<Vec<ChannelModelsCandidate>> {
        let candidates = self.inner.select(req).await?;
        if !req.has_google_native_tools {
            return Ok(candidates);
        }
        let preferred: Vec<_> = candidates
            .iter()
            .filter(|c| c.channel.settings.policies.supports_google_native_tools)
            .cloned()
            .collect();
        if preferred.is_empty() {
            Ok(candidates)
        } else {
            Ok(preferred)
        }
    }
}

/// Same shape as `GoogleNativeTools`, for Anthropic native tools.
pub struct AnthropicNativeTools {
    inner: Arc<dyn Selector>,
}

impl AnthropicNativeTools {
    pub fn new(inner: Arc<dyn Selector>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Selector for AnthropicNativeTools {
    async fn select(&self, req: &SelectionRequest<'_>) -> RouterResult<Vec<ChannelModelsCandidate>> {
        let candidates = self.inner.select(req).await?;
        if !req.has_anthropic_native_tools {
            return Ok(candidates);
        }
        let preferred: Vec<_> = candidates
            .iter()
            .filter(|c| c.channel.settings.policies.supports_anthropic_native_tools)
            .cloned()
            .collect();
        if preferred.is_empty() {
            Ok(candidates)
        } else {
            Ok(preferred)
        }
    }
}

/// Filters by the channel's declared stream policy against the request's
/// stream flag (defaulting to false when absent upstream).
pub struct StreamPolicyFilter {
    inner: Arc<dyn Selector>,
}

impl StreamPolicyFilter {
    pub fn new(inner: Arc<dyn Selector>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Selector for StreamPolicyFilter {
    async fn select(&self, req: &SelectionRequest<'_>) -> RouterResult<Vec<ChannelModelsCandidate>> {
        let candidates = self.inner.select(req).await?;
        Ok(candidates
            .into_iter()
            .filter(|c| match c.channel.settings.policies.stream {
                StreamPolicy::Require => req.stream,
                StreamPolicy::Forbid => !req.stream,
                StreamPolicy::Unlimited | StreamPolicy::Unset => true,
            })
            .collect())
    }
}

/// Groups candidates by priority (lowest value first), sorts each group
/// with the load balancer, and accumulates until `required` candidates
/// have been collected. Remaining priority groups are left unsorted and
/// unincluded.
pub struct LoadBalanced {
    inner: Arc<dyn Selector>,
    balancer: Arc<LoadBalancer>,
    retry_budget: RetryBudget,
}

impl LoadBalanced {
    pub fn new(inner: Arc<dyn Selector>, balancer: Arc<LoadBalancer>, retry_budget: RetryBudget) -> Self {
        Self {
            inner,
            balancer,
            retry_budget,
        }
    }
}

#[async_trait]
impl Selector for LoadBalanced {
    async fn select(&self, req: &SelectionRequest<'_>) -> RouterResult<Vec<ChannelModelsCandidate>> {
        let candidates = self.inner.select(req).await?;
        if candidates.len() <= 1 {
            return Ok(candidates);
        }

        let mut groups: BTreeMap<i32, Vec<ChannelModelsCandidate>> = BTreeMap::new();
        for candidate in candidates {
            groups.entry(candidate.priority).or_default().push(candidate);
        }

        let required = self.retry_budget.required();
        let mut result = Vec::with_capacity(required);

        let ctx = ScoringContext {
            model: req.model,
            trace_id: req.trace_id,
            storage: req.storage,
            connections: req.connections,
        };

        for (_, group) in groups {
            if result.len() >= required {
                break;
            }
            let sorted = self.balancer.sort(&ctx, group, false).await;
            for (candidate, _) in sorted {
                if result.len() >= required {
                    break;
                }
                result.push(candidate);
            }
        }

        Ok(result)
    }
}
