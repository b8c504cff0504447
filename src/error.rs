use std::time::Duration;

/// Error kinds surfaced by the orchestration core.
///
/// Mirrors the terminal/retryable split `router.rs`'s `TryRequestError` made
/// ad hoc for a single call site; here it is promoted to the crate-wide
/// error type since retryability now has to be decided in more than one
/// place (the retry pipeline, the candidate selector, HTTP status mapping).
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("invalid model: {0}")]
    InvalidModel(String),

    #[error("candidates exhausted")]
    CandidatesExhausted,

    #[error("quota exceeded")]
    QuotaExceeded,

    #[error("upstream returned {status}: {body}")]
    UpstreamHttp { status: u16, body: String },

    #[error("upstream transport error: {0}")]
    UpstreamTransport(String),

    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("request cancelled")]
    Cancelled,

    #[error("persistence error: {0}")]
    Persistence(String),
}

/// Fixed retryable HTTP status set.
const RETRYABLE_STATUS: [u16; 7] = [408, 425, 429, 500, 502, 503, 504];

impl RouterError {
    /// Whether this error, in isolation, is a candidate for retry (ignores
    /// candidate/model exhaustion, which the retry pipeline checks
    /// separately).
    pub fn is_retryable(&self) -> bool {
        match self {
            RouterError::UpstreamHttp { status, .. } => RETRYABLE_STATUS.contains(status),
            RouterError::UpstreamTransport(_) => true,
            RouterError::RateLimited { .. } => true,
            _ => false,
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            RouterError::InvalidModel(_) => 400,
            RouterError::CandidatesExhausted => 503,
            RouterError::QuotaExceeded => 403,
            RouterError::UpstreamHttp { status, .. } => *status,
            RouterError::UpstreamTransport(_) => 502,
            RouterError::RateLimited { .. } => 429,
            RouterError::Cancelled => 499,
            RouterError::Persistence(_) => 500,
        }
    }
}

pub type RouterResult<T> = Result<T, RouterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_status_set_matches_spec() {
        for status in [408, 425, 429, 500, 502, 503, 504] {
            assert!(RouterError::UpstreamHttp {
                status,
                body: String::new()
            }
            .is_retryable());
        }
        for status in [400, 401, 403, 404, 422] {
            assert!(!RouterError::UpstreamHttp {
                status,
                body: String::new()
            }
            .is_retryable());
        }
    }

    #[test]
    fn transport_and_rate_limit_are_retryable() {
        assert!(RouterError::UpstreamTransport("reset".into()).is_retryable());
        assert!(RouterError::RateLimited { retry_after: None }.is_retryable());
    }

    #[test]
    fn terminal_kinds_are_not_retryable() {
        assert!(!RouterError::InvalidModel("gpt-4".into()).is_retryable());
        assert!(!RouterError::CandidatesExhausted.is_retryable());
        assert!(!RouterError::QuotaExceeded.is_retryable());
        assert!(!RouterError::Cancelled.is_retryable());
        assert!(!RouterError::Persistence("write failed".into()).is_retryable());
    }
}
