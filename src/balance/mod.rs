//! Load Balancer & Strategies (spec.md 4.2).
//!
//! Grounded on `ccr-rust::routing::EwmaTracker`'s per-tier rolling-state
//! pattern (`parking_lot::RwLock<HashMap<_, _>>` guarding small Copy state
//! structs) generalized from one tracker into a pluggable strategy list.

mod strategies;

pub use strategies::{
    ConnectionAware, ErrorAware, Random, Strategy, StrategyName, TraceAware, Weight,
    WeightRoundRobin,
};

use crate::connection::ConnectionTracker;
use crate::model::ChannelModelsCandidate;
use crate::storage::Storage;
use std::sync::Arc;
use std::time::Instant;

/// Context passed to every strategy for one selection call.
pub struct ScoringContext<'a> {
    pub model: &'a str,
    pub trace_id: Option<&'a str>,
    pub storage: &'a dyn Storage,
    pub connections: Option<&'a ConnectionTracker>,
}

/// Per-strategy score plus, when debug tracing is enabled, timing and a
/// free-form detail map — mirrors the debug vector `routing.rs` builds
/// before logging tier order at `debug!` level.
#[derive(Debug, Clone)]
pub struct StrategyTrace {
    pub strategy: StrategyName,
    pub score: f64,
    pub duration: std::time::Duration,
    pub detail: serde_json::Value,
}

#[derive(Debug, Clone, Default)]
pub struct ScoredCandidate {
    pub total_score: f64,
    pub traces: Vec<StrategyTrace>,
}

/// Holds an ordered list of strategies and sums their per-channel scores.
pub struct LoadBalancer {
    strategies: Vec<Arc<dyn Strategy>>,
}

impl LoadBalancer {
    pub fn new(strategies: Vec<Arc<dyn Strategy>>) -> Self {
        Self { strategies }
    }

    /// Default composite balancer: {TraceAware, ErrorAware,
    /// WeightRoundRobin, ConnectionAware}.
    pub fn adaptive() -> Self {
        Self::new(vec![
            Arc::new(TraceAware),
            Arc::new(ErrorAware),
            Arc::new(WeightRoundRobin),
            Arc::new(ConnectionAware),
        ])
    }

    /// Alternate balancer using only pure ordering weight.
    pub fn weighted() -> Self {
        Self::new(vec![Arc::new(Weight)])
    }

    pub async fn score(&self, ctx: &ScoringContext<'_>, candidate: &ChannelModelsCandidate, debug: bool) -> ScoredCandidate {
        let mut total = 0.0;
        let mut traces = Vec::new();
        for strategy in &self.strategies {
            let start = Instant::now();
            let outcome = strategy.score(ctx, candidate).await;
            total += outcome.score;
            if debug {
                traces.push(StrategyTrace {
                    strategy: strategy.name(),
                    score: outcome.score,
                    duration: start.elapsed(),
                    detail: outcome.detail,
                });
            }
        }
        ScoredCandidate {
            total_score: total,
            traces,
        }
    }

    /// `Sort(ctx, candidates, model)`: descending total score, ties broken
    /// by stable input order.
    pub async fn sort(
        &self,
        ctx: &ScoringContext<'_>,
        candidates: Vec<ChannelModelsCandidate>,
        debug: bool,
    ) -> Vec<(ChannelModelsCandidate, ScoredCandidate)> {
        let mut scored = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let score = self.score(ctx, &candidate, debug).await;
            scored.push((candidate, score));
        }
        // `sort_by` is stable, preserving original order on ties.
        scored.sort_by(|a, b| b.1.total_score.partial_cmp(&a.1.total_score).unwrap_or(std::cmp::Ordering::Equal));
        scored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Channel, ChannelModelEntry, ChannelType, EntrySource};
    use crate::storage::MemoryStore;
    use std::collections::HashSet;

    fn candidate(id: u64, weight: u32) -> ChannelModelsCandidate {
        ChannelModelsCandidate {
            channel: Arc::new(Channel {
                id,
                name: format!("ch{id}"),
                channel_type: ChannelType::OpenAi,
                base_url: "https://example.com".into(),
                api_key: "sk".into(),
                models: vec!["gpt-4".into()],
                model_mappings: vec![],
                extra_prefix: None,
                auto_trim_prefix: None,
                weight,
                tags: HashSet::new(),
                enabled: true,
                settings: Default::default(),
                max_connections: 0,
                updated_at: 0,
            }),
            priority: 0,
            models: vec![ChannelModelEntry {
                request_model: "gpt-4".into(),
                actual_model: "gpt-4".into(),
                source: EntrySource::Direct,
            }],
        }
    }

    #[tokio::test]
    async fn weighted_balancer_orders_by_weight_descending() {
        let store = MemoryStore::new();
        let ctx = ScoringContext {
            model: "gpt-4",
            trace_id: None,
            storage: &store,
            connections: None,
        };
        let candidates = vec![candidate(1, 25), candidate(2, 100), candidate(3, 50)];
        let balancer = LoadBalancer::weighted();
        let sorted = balancer.sort(&ctx, candidates, false).await;
        let ids: Vec<u64> = sorted.iter().map(|(c, _)| c.channel.id).collect();
        assert_eq!(ids, vec![2, 3, 1]);
    }

    #[tokio::test]
    async fn trace_affinity_overrides_weight_ordering() {
        let store = MemoryStore::new();
        store.record_trace_success("trace-1", 2).await;
        let ctx = ScoringContext {
            model: "gpt-4",
            trace_id: Some("trace-1"),
            storage: &store,
            connections: None,
        };
        let candidates = vec![candidate(1, 100), candidate(2, 10)];
        let balancer = LoadBalancer::adaptive();
        let sorted = balancer.sort(&ctx, candidates, false).await;
        assert_eq!(sorted[0].0.channel.id, 2);
    }
}
