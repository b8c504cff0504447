use super::ScoringContext;
use crate::model::ChannelModelsCandidate;
use async_trait::async_trait;
use rand::Rng;
use serde_json::json;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrategyName {
    TraceAware,
    ErrorAware,
    WeightRoundRobin,
    ConnectionAware,
    Weight,
    Random,
}

pub struct StrategyOutcome {
    pub score: f64,
    pub detail: serde_json::Value,
}

impl StrategyOutcome {
    fn plain(score: f64) -> Self {
        Self {
            score,
            detail: serde_json::Value::Null,
        }
    }
}

#[async_trait]
pub trait Strategy: Send + Sync {
    fn name(&self) -> StrategyName;
    async fn score(&self, ctx: &ScoringContext<'_>, candidate: &ChannelModelsCandidate) -> StrategyOutcome;
}

/// Range 0..1000: boosts the channel that last served this trace
/// successfully, so a follow-up turn in a multi-step agent conversation
/// tends to land on the same backend.
pub struct TraceAware;

#[async_trait]
impl Strategy for TraceAware {
    fn name(&self) -> StrategyName {
        StrategyName::TraceAware
    }

    async fn score(&self, ctx: &ScoringContext<'_>, candidate: &ChannelModelsCandidate) -> StrategyOutcome {
        let Some(trace_id) = ctx.trace_id else {
            return StrategyOutcome::plain(0.0);
        };
        let last = ctx.storage.last_successful_channel_in_trace(trace_id).await;
        let score = if last == Some(candidate.channel.id) { 1000.0 } else { 0.0 };
        StrategyOutcome {
            score,
            detail: json!({ "trace_id": trace_id, "last_successful_channel": last }),
        }
    }
}

/// Range 0..200: penalizes channels with recent or frequent failures.
/// Healthy channels are left untouched (fairness — no boosts on success).
pub struct ErrorAware;

const COOLDOWN_SECS: i64 = 300;

#[async_trait]
impl Strategy for ErrorAware {
    fn name(&self) -> StrategyName {
        StrategyName::ErrorAware
    }

    async fn score(&self, ctx: &ScoringContext<'_>, candidate: &ChannelModelsCandidate) -> StrategyOutcome {
        let metrics = ctx.storage.aggregated_metrics(candidate.channel.id).await;
        let mut score = 200.0_f64;

        score -= 50.0 * metrics.consecutive_failures as f64;

        if let Some(last_failure) = metrics.last_failure_at {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            let age = now - last_failure;
            if age < COOLDOWN_SECS {
                let decay = 1.0 - (age as f64 / COOLDOWN_SECS as f64);
                score -= 100.0 * decay.clamp(0.0, 1.0);
            }
        }

        if metrics.request_count >= 5 && metrics.success_rate() < 0.5 {
            score -= 50.0;
        }

        StrategyOutcome {
            score: score.max(0.0),
            detail: json!({
                "consecutive_failures": metrics.consecutive_failures,
                "success_rate": metrics.success_rate(),
            }),
        }
    }
}

/// Range 10..200: round-robin component decays by request count scaled by
/// weight; weight component is a flat share of ordering weight.
pub struct WeightRoundRobin;

#[async_trait]
impl Strategy for WeightRoundRobin {
    fn name(&self) -> StrategyName {
        StrategyName::WeightRoundRobin
    }

    async fn score(&self, ctx: &ScoringContext<'_>, candidate: &ChannelModelsCandidate) -> StrategyOutcome {
        let metrics = ctx.storage.aggregated_metrics(candidate.channel.id).await;
        let weight_factor = (candidate.channel.weight as f64 / 100.0).max(0.01);

        let round_robin = 150.0 * (-(metrics.request_count as f64) * weight_factor / 10.0).exp();
        let weight_component = (candidate.channel.weight as f64 / 100.0) * 50.0;

        let score = (round_robin + weight_component).max(10.0);
        StrategyOutcome::plain(score)
    }
}

/// Range 0..50: prefers channels with spare connection headroom.
pub struct ConnectionAware;

#[async_trait]
impl Strategy for ConnectionAware {
    fn name(&self) -> StrategyName {
        StrategyName::ConnectionAware
    }

    async fn score(&self, ctx: &ScoringContext<'_>, candidate: &ChannelModelsCandidate) -> StrategyOutcome {
        let Some(tracker) = ctx.connections else {
            return StrategyOutcome::plain(25.0);
        };
        // max == 0 carries the "unlimited" sentinel from spec.md 4.1.
        let max = candidate.channel.max_connections;
        if max == 0 {
            return StrategyOutcome::plain(50.0);
        }
        let active = tracker.active(candidate.channel.id);
        let ratio = 1.0 - (active as f64 / max as f64);
        StrategyOutcome::plain(50.0 * ratio.clamp(0.0, 1.0))
    }
}

/// Range 0..100: pure normalized ordering weight.
pub struct Weight;

#[async_trait]
impl Strategy for Weight {
    fn name(&self) -> StrategyName {
        StrategyName::Weight
    }

    async fn score(&self, _ctx: &ScoringContext<'_>, candidate: &ChannelModelsCandidate) -> StrategyOutcome {
        StrategyOutcome::plain(candidate.channel.weight as f64)
    }
}

/// Range 0..0.5: uniform perturbation to break exact ties.
pub struct Random;

#[async_trait]
impl Strategy for Random {
    fn name(&self) -> StrategyName {
        StrategyName::Random
    }

    async fn score(&self, _ctx: &ScoringContext<'_>, _candidate: &ChannelModelsCandidate) -> StrategyOutcome {
        let jitter = rand::thread_rng().gen_range(0.0..0.5);
        StrategyOutcome::plain(jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Channel, ChannelModelEntry, ChannelType, EntrySource};
    use crate::storage::MemoryStore;
    use std::collections::HashSet;
    use std::sync::Arc;

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
    async fn error_aware_penalizes_consecutive_failures() {
        let store = MemoryStore::new();
        store.record_channel_outcome(1, false).await;
        store.record_channel_outcome(1, false).await;
        let ctx = ScoringContext {
            model: "gpt-4",
            trace_id: None,
            storage: &store,
            connections: None,
        };
        let outcome = ErrorAware.score(&ctx, &candidate(1, 100)).await;
        assert!(outcome.score <= 100.0);
    }

    #[tokio::test]
    async fn error_aware_clamps_at_zero() {
        let store = MemoryStore::new();
        for _ in 0..10 {
            store.record_channel_outcome(1, false).await;
        }
        let ctx = ScoringContext {
            model: "gpt-4",
            trace_id: None,
            storage: &store,
            connections: None,
        };
        let outcome = ErrorAware.score(&ctx, &candidate(1, 100)).await;
        assert_eq!(outcome.score, 0.0);
    }

    #[tokio::test]
    async fn weight_strategy_is_pure_passthrough() {
        let store = MemoryStore::new();
        let ctx = ScoringContext {
            model: "gpt-4",
            trace_id: None,
            storage: &store,
            connections: None,
        };
        let outcome = Weight.score(&ctx, &candidate(1, 77)).await;
        assert_eq!(outcome.score, 77.0);
    }

    #[tokio::test]
    async fn connection_aware_neutral_without_tracker() {
        let store = MemoryStore::new();
        let ctx = ScoringContext {
            model: "gpt-4",
            trace_id: None,
            storage: &store,
            connections: None,
        };
        let outcome = ConnectionAware.score(&ctx, &candidate(1, 100)).await;
        assert_eq!(outcome.score, 25.0);
    }

    #[tokio::test]
    async fn connection_aware_unlimited_when_max_is_zero() {
        let store = MemoryStore::new();
        let tracker = crate::connection::ConnectionTracker::new();
        tracker.increment(1);
        let ctx = ScoringContext {
            model: "gpt-4",
            trace_id: None,
            storage: &store,
            connections: Some(&tracker),
        };
        let outcome = ConnectionAware.score(&ctx, &candidate(1, 100)).await;
        assert_eq!(outcome.score, 50.0);
    }

    #[tokio::test]
    async fn connection_aware_scales_with_headroom() {
        let store = MemoryStore::new();
        let tracker = crate::connection::ConnectionTracker::new();
        tracker.increment(1);
        let ctx = ScoringContext {
            model: "gpt-4",
            trace_id: None,
            storage: &store,
            connections: Some(&tracker),
        };
        let mut c = candidate(1, 100);
        std::sync::Arc::get_mut(&mut c.channel).unwrap().max_connections = 4;
        // active=1, max=4 -> 50 * (1 - 1/4) = 37.5
        let outcome = ConnectionAware.score(&ctx, &c).await;
        assert_eq!(outcome.score, 37.5);
    }

    #[tokio::test]
    async fn random_strategy_stays_in_range() {
        let store = MemoryStore::new();
        let ctx = ScoringContext {
            model: "gpt-4",
            trace_id: None,
            storage: &store,
            connections: None,
        };
        for _ in 0..20 {
            let outcome = Random.score(&ctx, &candidate(1, 100)).await;
            assert!(outcome.score >= 0.0 && outcome.score < 0.5);
        }
    }
}
