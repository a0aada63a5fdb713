use crate::error::SourceError;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Builds the shared HTTP client used by every adapter.
pub fn http_client(timeout: Duration) -> Result<reqwest::Client, SourceError> {
    let user_agent = format!("vulnflow/{}", env!("CARGO_PKG_VERSION"));
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(user_agent)
        .build()
        .map_err(|e| SourceError::Transport {
            service: "http".to_string(),
            message: e.to_string(),
        })
}

/// Bounded retries with exponential backoff, only for transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(4),
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay after the given failed attempt (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    pub async fn run<T, F, Fut>(&self, service: &str, mut operation: F) -> Result<T, SourceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SourceError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.backoff_for(attempt);
                    debug!(service, attempt, ?delay, error = %e, "retrying transient failure");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Sends a request and decodes a JSON body, mapping every failure onto
/// [`SourceError`].
pub(crate) async fn send_json<T: DeserializeOwned>(
    service: &str,
    request: reqwest::RequestBuilder,
) -> Result<T, SourceError> {
    let started = Instant::now();
    let response = request
        .send()
        .await
        .map_err(|e| SourceError::from_reqwest(service, e, started.elapsed()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(SourceError::Status {
            service: service.to_string(),
            status: status.as_u16(),
        });
    }

    let body = response
        .bytes()
        .await
        .map_err(|e| SourceError::from_reqwest(service, e, started.elapsed()))?;
    serde_json::from_slice(&body).map_err(|e| SourceError::Malformed {
        service: service.to_string(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for(1), Duration::from_secs(1));
        assert_eq!(policy.backoff_for(2), Duration::from_secs(2));
        assert_eq!(policy.backoff_for(3), Duration::from_secs(4));
        assert_eq!(policy.backoff_for(10), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = fast_policy()
            .run("epss", move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(SourceError::Status {
                        service: "epss".into(),
                        status: 503,
                    })
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = fast_policy()
            .run("nvd", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SourceError::Transport {
                    service: "nvd".into(),
                    message: "connection reset".into(),
                })
            })
            .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_request_timeout_reports_elapsed_time() {
        // Accepts connections through the backlog but never answers.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/", listener.local_addr().unwrap());
        let client = http_client(Duration::from_millis(200)).unwrap();

        let err = send_json::<serde_json::Value>("epss", client.get(&url))
            .await
            .unwrap_err();

        assert!(!err.to_string().contains("after 0ns"), "{}", err);
        match err {
            SourceError::Timeout { service, elapsed } => {
                assert_eq!(service, "epss");
                assert!(elapsed >= Duration::from_millis(150), "elapsed {:?}", elapsed);
            }
            other => panic!("expected a timeout, got {:?}", other),
        }
        drop(listener);
    }

    #[tokio::test]
    async fn test_never_retries_client_errors() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = fast_policy()
            .run("agent", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SourceError::Status {
                    service: "agent".into(),
                    status: 404,
                })
            })
            .await;

        assert!(matches!(result, Err(SourceError::Status { status: 404, .. })));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
