//! `PerformanceRecord`: per-execution timing and outcome, captured with
//! `Instant` and with latencies derived on demand rather than stored,
//! threaded through `PersistenceState` across retries.

use crate::model::ChannelId;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct PerformanceRecord {
    pub channel_id: ChannelId,
    pub start_time: Instant,
    pub first_token_time: Option<Instant>,
    pub end_time: Option<Instant>,
    pub stream: bool,
    pub success: bool,
    pub request_completed: bool,
    pub token_count: u64,
    pub error_status_code: Option<u16>,
}

impl PerformanceRecord {
    pub fn start(channel_id: ChannelId, stream: bool) -> Self {
        Self {
            channel_id,
            start_time: Instant::now(),
            first_token_time: None,
            end_time: None,
            stream,
            success: false,
            request_completed: false,
            token_count: 0,
            error_status_code: None,
        }
    }

    pub fn record_first_token(&mut self) {
        if self.first_token_time.is_none() {
            self.first_token_time = Some(Instant::now());
        }
    }

    pub fn finish_success(&mut self, token_count: u64) {
        self.end_time = Some(Instant::now());
        self.success = true;
        self.request_completed = true;
        self.token_count = token_count;
    }

    pub fn finish_failure(&mut self, status_code: Option<u16>) {
        self.end_time = Some(Instant::now());
        self.success = false;
        self.error_status_code = status_code;
    }

    pub fn first_token_latency_ms(&self) -> Option<u64> {
        self.first_token_time
            .map(|t| t.saturating_duration_since(self.start_time).as_millis() as u64)
    }

    /// Time from first byte to completion — meaningful for streams only.
    pub fn request_latency_ms(&self) -> Option<u64> {
        match (self.first_token_time, self.end_time) {
            (Some(first), Some(end)) => Some(end.saturating_duration_since(first).as_millis() as u64),
            _ => None,
        }
    }

    pub fn total_latency_ms(&self) -> Option<u64> {
        self.end_time
            .map(|t| t.saturating_duration_since(self.start_time).as_millis() as u64)
    }

    pub fn elapsed(&self) -> Duration {
        self.end_time
            .unwrap_or_else(Instant::now)
            .saturating_duration_since(self.start_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn total_latency_is_none_until_finished() {
        let record = PerformanceRecord::start(1, false);
        assert!(record.total_latency_ms().is_none());
    }

    #[test]
    fn finish_success_marks_completed_and_records_tokens() {
        let mut record = PerformanceRecord::start(1, false);
        sleep(Duration::from_millis(1));
        record.finish_success(42);
        assert!(record.success);
        assert!(record.request_completed);
        assert_eq!(record.token_count, 42);
        assert!(record.total_latency_ms().unwrap() >= 1);
    }

    #[test]
    fn finish_failure_records_status_code_and_leaves_incomplete() {
        let mut record = PerformanceRecord::start(1, false);
        record.finish_failure(Some(503));
        assert!(!record.success);
        assert!(!record.request_completed);
        assert_eq!(record.error_status_code, Some(503));
    }

    #[test]
    fn first_token_latency_only_set_after_first_token() {
        let mut record = PerformanceRecord::start(1, true);
        assert!(record.first_token_latency_ms().is_none());
        record.record_first_token();
        assert!(record.first_token_latency_ms().is_some());
    }

    #[test]
    fn recording_first_token_twice_keeps_first_timestamp() {
        let mut record = PerformanceRecord::start(1, true);
        record.record_first_token();
        let first = record.first_token_time;
        sleep(Duration::from_millis(1));
        record.record_first_token();
        assert_eq!(record.first_token_time, first);
    }
}
