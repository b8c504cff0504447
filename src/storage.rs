//! Storage contract and an in-process reference implementation.
//!
//! The durable persistence engine behind this trait is out of scope here;
//! this module defines the trait boundary the orchestrator and the
//! load-balancer strategies consume, plus `MemoryStore`, a
//! `parking_lot`-guarded in-process implementation suitable for the
//! default binary and for integration tests.

use crate::model::ChannelId;
use crate::perf::PerformanceRecord;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    pub id: String,
    pub channel_id: Option<ChannelId>,
    pub original_model: String,
    pub status: RequestStatus,
    pub response_id: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestExecutionRecord {
    pub id: String,
    pub request_id: String,
    pub channel_id: ChannelId,
    pub model: String,
    pub status: RequestStatus,
    pub error: Option<String>,
    pub first_token_latency_ms: Option<u64>,
    pub request_latency_ms: Option<u64>,
    pub total_latency_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageLog {
    pub request_id: String,
    pub channel_id: ChannelId,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Rolling per-channel counters produced by storage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregatedMetrics {
    pub request_count: u64,
    pub success_count: u64,
    pub consecutive_failures: u32,
    pub last_success_at: Option<i64>,
    pub last_failure_at: Option<i64>,
    pub last_selected_at: Option<i64>,
}

impl AggregatedMetrics {
    pub fn success_rate(&self) -> f64 {
        if self.request_count == 0 {
            1.0
        } else {
            self.success_count as f64 / self.request_count as f64
        }
    }
}

#[async_trait]
pub trait Storage: Send + Sync {
    async fn create_request(&self, record: RequestRecord) -> anyhow::Result<()>;
    async fn create_request_execution(&self, record: RequestExecutionRecord) -> anyhow::Result<()>;
    async fn update_request_completed(&self, request_id: &str, response_id: &str) -> anyhow::Result<()>;
    async fn update_request_execution_completed(
        &self,
        execution_id: &str,
        perf: &PerformanceRecord,
    ) -> anyhow::Result<()>;
    async fn update_request_status_from_error(&self, request_id: &str, error: &str) -> anyhow::Result<()>;
    async fn update_request_execution_failed(&self, execution_id: &str, error: &str) -> anyhow::Result<()>;
    async fn save_request_chunks(&self, request_id: &str, chunks: Vec<Vec<u8>>) -> anyhow::Result<()>;
    async fn save_request_execution_chunks(&self, execution_id: &str, chunks: Vec<Vec<u8>>) -> anyhow::Result<()>;
    async fn create_usage_log(&self, usage: UsageLog) -> anyhow::Result<()>;
    async fn update_request_channel_id(&self, request_id: &str, channel_id: ChannelId) -> anyhow::Result<()>;
    async fn aggregated_metrics(&self, channel_id: ChannelId) -> AggregatedMetrics;
    async fn last_successful_channel_in_trace(&self, trace_id: &str) -> Option<ChannelId>;
    async fn record_trace_success(&self, trace_id: &str, channel_id: ChannelId);
    async fn record_channel_outcome(&self, channel_id: ChannelId, success: bool);
}

#[derive(Default)]
pub struct MemoryStore {
    requests: RwLock<HashMap<String, RequestRecord>>,
    executions: RwLock<HashMap<String, RequestExecutionRecord>>,
    chunks: RwLock<HashMap<String, Vec<Vec<u8>>>>,
    usage_logs: RwLock<Vec<UsageLog>>,
    metrics: RwLock<HashMap<ChannelId, AggregatedMetrics>>,
    trace_success: RwLock<HashMap<String, ChannelId>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of one request record, for tests asserting terminal state.
    pub fn request(&self, request_id: &str) -> Option<RequestRecord> {
        self.requests.read().get(request_id).cloned()
    }

    /// Snapshot of one execution record, for tests asserting terminal state.
    pub fn execution(&self, execution_id: &str) -> Option<RequestExecutionRecord> {
        self.executions.read().get(execution_id).cloned()
    }

    /// All request records recorded so far; tests that only ever drive one
    /// request through an `Orchestrator` can pull its terminal state
    /// without knowing the generated request id up front.
    pub fn requests(&self) -> Vec<RequestRecord> {
        self.requests.read().values().cloned().collect()
    }

    /// All execution records recorded so far, see `requests`.
    pub fn executions(&self) -> Vec<RequestExecutionRecord> {
        self.executions.read().values().cloned().collect()
    }

    /// All usage logs recorded so far, in insertion order.
    pub fn usage_logs(&self) -> Vec<UsageLog> {
        self.usage_logs.read().clone()
    }

    fn now_secs() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }
}

#[async_trait]
impl Storage for MemoryStore {
    async fn create_request(&self, record: RequestRecord) -> anyhow::Result<()> {
        self.requests.write().insert(record.id.clone(), record);
        Ok(())
    }

    async fn create_request_execution(&self, record: RequestExecutionRecord) -> anyhow::Result<()> {
        self.executions.write().insert(record.id.clone(), record);
        Ok(())
    }

    async fn update_request_completed(&self, request_id: &str, response_id: &str) -> anyhow::Result<()> {
        if let Some(r) = self.requests.write().get_mut(request_id) {
            r.status = RequestStatus::Completed;
            r.response_id = Some(response_id.to_string());
        }
        Ok(())
    }

    async fn update_request_execution_completed(
        &self,
        execution_id: &str,
        perf: &PerformanceRecord,
    ) -> anyhow::Result<()> {
        if let Some(e) = self.executions.write().get_mut(execution_id) {
            e.status = RequestStatus::Completed;
            e.first_token_latency_ms = perf.first_token_latency_ms();
            e.request_latency_ms = perf.request_latency_ms();
            e.total_latency_ms = perf.total_latency_ms();
        }
        Ok(())
    }

    async fn update_request_status_from_error(&self, request_id: &str, error: &str) -> anyhow::Result<()> {
        if let Some(r) = self.requests.write().get_mut(request_id) {
            r.status = RequestStatus::Failed;
            r.error = Some(error.to_string());
        }
        Ok(())
    }

    async fn update_request_execution_failed(&self, execution_id: &str, error: &str) -> anyhow::Result<()> {
        if let Some(e) = self.executions.write().get_mut(execution_id) {
            e.status = RequestStatus::Failed;
            e.error = Some(error.to_string());
        }
        Ok(())
    }

    async fn save_request_chunks(&self, request_id: &str, chunks: Vec<Vec<u8>>) -> anyhow::Result<()> {
        self.chunks.write().insert(request_id.to_string(), chunks);
        Ok(())
    }

    async fn save_request_execution_chunks(&self, execution_id: &str, chunks: Vec<Vec<u8>>) -> anyhow::Result<()> {
        self.chunks.write().insert(execution_id.to_string(), chunks);
        Ok(())
    }

    async fn create_usage_log(&self, usage: UsageLog) -> anyhow::Result<()> {
        self.usage_logs.write().push(usage);
        Ok(())
    }

    async fn update_request_channel_id(&self, request_id: &str, channel_id: ChannelId) -> anyhow::Result<()> {
        if let Some(r) = self.requests.write().get_mut(request_id) {
            r.channel_id = Some(channel_id);
        }
        Ok(())
    }

    async fn aggregated_metrics(&self, channel_id: ChannelId) -> AggregatedMetrics {
        self.metrics.read().get(&channel_id).cloned().unwrap_or_default()
    }

    async fn last_successful_channel_in_trace(&self, trace_id: &str) -> Option<ChannelId> {
        self.trace_success.read().get(trace_id).copied()
    }

    async fn record_trace_success(&self, trace_id: &str, channel_id: ChannelId) {
        self.trace_success.write().insert(trace_id.to_string(), channel_id);
    }

    async fn record_channel_outcome(&self, channel_id: ChannelId, success: bool) {
        let mut metrics = self.metrics.write();
        let m = metrics.entry(channel_id).or_default();
        m.request_count += 1;
        let now = Self::now_secs();
        m.last_selected_at = Some(now);
        if success {
            m.success_count += 1;
            m.consecutive_failures = 0;
            m.last_success_at = Some(now);
        } else {
            m.consecutive_failures += 1;
            m.last_failure_at = Some(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_consecutive_failures_and_resets_on_success() {
        let store = MemoryStore::new();
        store.record_channel_outcome(1, false).await;
        store.record_channel_outcome(1, false).await;
        let m = store.aggregated_metrics(1).await;
        assert_eq!(m.consecutive_failures, 2);
        assert_eq!(m.request_count, 2);

        store.record_channel_outcome(1, true).await;
        let m = store.aggregated_metrics(1).await;
        assert_eq!(m.consecutive_failures, 0);
        assert_eq!(m.success_count, 1);
    }

    #[tokio::test]
    async fn trace_success_lookup_round_trips() {
        let store = MemoryStore::new();
        assert_eq!(store.last_successful_channel_in_trace("t1").await, None);
        store.record_trace_success("t1", 5).await;
        assert_eq!(store.last_successful_channel_in_trace("t1").await, Some(5));
    }

    #[tokio::test]
    async fn success_rate_defaults_to_one_when_no_requests() {
        let m = AggregatedMetrics::default();
        assert_eq!(m.success_rate(), 1.0);
    }
}
