//! Error types shared across the pipeline.
//!
//! The variants follow how each failure is recovered:
//!
//! - [`SourceError`] - an external lookup failed; retried, then replaced by fallback data
//! - [`ValidationError`] - malformed input; rejected before any external call
//! - [`CacheError`] - cache backend failure; the cache disables itself
//! - [`StoreError`] - durable store unavailable; logged and skipped
//! - [`QueueError`] - queue backend unavailable; surfaced as service-unavailable
//! - [`PipelineError`] - a job could not be processed; routed to the dead-letter list

use std::time::Duration;
use thiserror::Error;

/// Failure of a single external data source call.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("{service} request timed out after {elapsed:?}")]
    Timeout { service: String, elapsed: Duration },

    #[error("{service} transport error: {message}")]
    Transport { service: String, message: String },

    #[error("{service} returned HTTP {status}")]
    Status { service: String, status: u16 },

    #[error("{service} returned a malformed response: {message}")]
    Malformed { service: String, message: String },

    #[error("{service} has no data for {query}")]
    NoData { service: String, query: String },

    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

impl SourceError {
    /// Whether retrying the same call may succeed.
    ///
    /// Connection problems, timeouts, 429 and 5xx responses are transient.
    /// Other 4xx responses, decode failures and missing data are not.
    pub fn is_transient(&self) -> bool {
        match self {
            SourceError::Timeout { .. } | SourceError::Transport { .. } => true,
            SourceError::Status { status, .. } => *status == 429 || (500..600).contains(status),
            SourceError::Malformed { .. } | SourceError::NoData { .. } | SourceError::Invalid(_) => {
                false
            }
        }
    }

    /// `elapsed` is how long the request had been running when it failed.
    pub(crate) fn from_reqwest(service: &str, err: reqwest::Error, elapsed: Duration) -> Self {
        if err.is_timeout() {
            return SourceError::Timeout {
                service: service.to_string(),
                elapsed,
            };
        }
        if let Some(status) = err.status() {
            return SourceError::Status {
                service: service.to_string(),
                status: status.as_u16(),
            };
        }
        if err.is_decode() {
            return SourceError::Malformed {
                service: service.to_string(),
                message: err.to_string(),
            };
        }
        SourceError::Transport {
            service: service.to_string(),
            message: err.to_string(),
        }
    }
}

/// Input that fails the boundary checks.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {field} {value:?}: {reason}")]
pub struct ValidationError {
    pub field: &'static str,
    pub value: String,
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: &'static str, value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field,
            value: value.into(),
            reason: reason.into(),
        }
    }
}

/// Cache backend failure. Never surfaced past [`crate::cache::KeyedCache`].
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        CacheError::Backend(err.to_string())
    }
}

/// Durable store failure. "Not found" is never one of these.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Queue backend failure.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue backend unavailable: {0}")]
    Unavailable(String),

    #[error("queue command failed: {0}")]
    Command(String),

    #[error("job serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            QueueError::Unavailable(err.to_string())
        } else {
            QueueError::Command(err.to_string())
        }
    }
}

/// A pipeline run that could not complete, as opposed to one that fell back.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error("pipeline task aborted: {0}")]
    Aborted(String),
}

/// Errors surfaced to callers of the polling gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    InvalidInput(#[from] ValidationError),

    #[error("{service} is currently unavailable: {reason}")]
    ServiceUnavailable { service: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let timeout = SourceError::Timeout {
            service: "epss".into(),
            elapsed: Duration::from_secs(1),
        };
        assert!(timeout.is_transient());

        let server = SourceError::Status {
            service: "nvd".into(),
            status: 503,
        };
        assert!(server.is_transient());

        let throttled = SourceError::Status {
            service: "nvd".into(),
            status: 429,
        };
        assert!(throttled.is_transient());

        let unauthorized = SourceError::Status {
            service: "agent".into(),
            status: 401,
        };
        assert!(!unauthorized.is_transient());

        let malformed = SourceError::Malformed {
            service: "osv".into(),
            message: "missing field".into(),
        };
        assert!(!malformed.is_transient());
    }

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::new("subject", "", "must not be empty");
        let display = err.to_string();
        assert!(display.contains("subject"));
        assert!(display.contains("must not be empty"));
    }

    #[test]
    fn test_gateway_error_display() {
        let err = GatewayError::ServiceUnavailable {
            service: "queue".into(),
            reason: "failed to submit analysis job".into(),
        };
        assert_eq!(
            err.to_string(),
            "queue is currently unavailable: failed to submit analysis job"
        );
    }
}
