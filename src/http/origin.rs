//! Retrying HTTP client for origin fetches.
//!
//! Transport failures, `429` and `5xx` (other than `501`) are retried with
//! exponential backoff.  The whole exchange, retries included, is bounded by
//! [`RetryPolicy::total_timeout`]; the same bound applies to reading the body
//! of the response that is finally returned.

use std::time::Duration;

use axum::http::StatusCode;
use thiserror::Error;
use tracing::{debug, warn};

/// Retry and timeout budget for origin requests.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub max_retries: u32,
    pub total_timeout: Duration,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 4,
            total_timeout: Duration::from_secs(15),
            backoff_min: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.backoff_min
            .saturating_mul(factor)
            .min(self.backoff_max)
    }
}

/// Origin fetch failure after the retry budget is spent.
#[derive(Debug, Error)]
pub enum OriginError {
    #[error("origin responded with {0}")]
    Status(StatusCode),
    #[error("origin request failed: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("origin request exceeded {0:?}")]
    TimedOut(Duration),
}

impl OriginError {
    /// Status returned to the client for this failure.
    pub fn response_status(&self) -> StatusCode {
        match self {
            Self::Status(status) => *status,
            Self::Transport(_) => StatusCode::BAD_GATEWAY,
            Self::TimedOut(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OriginClient {
    http: reqwest::Client,
    policy: RetryPolicy,
}

impl OriginClient {
    /// Build a client whose per-request timeout matches the policy's total
    /// budget, so body streaming is bounded too.
    pub fn new(policy: RetryPolicy) -> reqwest::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("edgecache/", env!("CARGO_PKG_VERSION")))
            .timeout(policy.total_timeout)
            .build()?;
        Ok(Self { http, policy })
    }

    /// `GET url`, retrying per the policy.  Only a 2xx response is returned.
    pub async fn fetch(&self, url: &str) -> Result<reqwest::Response, OriginError> {
        let budget = self.policy.total_timeout;
        match tokio::time::timeout(budget, self.fetch_with_retries(url)).await {
            Ok(result) => result,
            Err(_) => Err(OriginError::TimedOut(budget)),
        }
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<reqwest::Response, OriginError> {
        let mut attempt = 0;
        loop {
            let failure = match self.http.get(url).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) => {
                    let status = resp.status();
                    if !is_retryable_status(status) {
                        return Err(OriginError::Status(status));
                    }
                    OriginError::Status(status)
                }
                Err(e) if e.is_builder() => return Err(OriginError::Transport(e)),
                Err(e) => OriginError::Transport(e),
            };

            if attempt >= self.policy.max_retries {
                warn!(%url, attempts = attempt + 1, error = %failure, "origin retries exhausted");
                return Err(failure);
            }
            let delay = self.policy.backoff(attempt);
            debug!(%url, attempt, delay_ms = delay.as_millis() as u64, error = %failure, "retrying origin request");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || (status.is_server_error() && status != StatusCode::NOT_IMPLEMENTED)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use axum::routing::get;
    use axum::Router;

    use super::*;
    use crate::testutil::spawn_server;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 4,
            total_timeout: Duration::from_secs(5),
            backoff_min: Duration::from_millis(1),
            backoff_max: Duration::from_millis(5),
        }
    }

    /// Origin that fails with `status` until `failures` requests were served.
    async fn flaky_origin(failures: usize, status: StatusCode) -> (String, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let app = Router::new().route(
            "/img",
            get({
                let calls = Arc::clone(&calls);
                move || async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n < failures {
                        (status, "nope")
                    } else {
                        (StatusCode::OK, "image")
                    }
                }
            }),
        );
        (spawn_server(app).await, calls)
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_secs(1));
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(8));
        assert_eq!(policy.backoff(10), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn retries_server_errors_then_succeeds() {
        let (base, calls) = flaky_origin(2, StatusCode::SERVICE_UNAVAILABLE).await;
        let client = OriginClient::new(fast_policy()).unwrap();
        let resp = client.fetch(&format!("{base}/img")).await.unwrap();
        assert_eq!(resp.text().await.unwrap(), "image");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let (base, calls) = flaky_origin(usize::MAX, StatusCode::BAD_GATEWAY).await;
        let client = OriginClient::new(fast_policy()).unwrap();
        let err = client.fetch(&format!("{base}/img")).await.unwrap_err();
        assert_eq!(err.response_status(), StatusCode::BAD_GATEWAY);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let (base, calls) = flaky_origin(usize::MAX, StatusCode::NOT_FOUND).await;
        let client = OriginClient::new(fast_policy()).unwrap();
        let err = client.fetch(&format!("{base}/img")).await.unwrap_err();
        assert!(matches!(err, OriginError::Status(s) if s == StatusCode::NOT_FOUND));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unreachable_origin_is_a_transport_error() {
        let client = OriginClient::new(RetryPolicy {
            max_retries: 1,
            ..fast_policy()
        })
        .unwrap();
        let err = client.fetch("http://127.0.0.1:9/img").await.unwrap_err();
        assert!(matches!(err, OriginError::Transport(_)));
        assert_eq!(err.response_status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn total_budget_bounds_retries() {
        let (base, _calls) = flaky_origin(usize::MAX, StatusCode::SERVICE_UNAVAILABLE).await;
        let client = OriginClient::new(RetryPolicy {
            max_retries: 4,
            total_timeout: Duration::from_millis(200),
            backoff_min: Duration::from_secs(1),
            backoff_max: Duration::from_secs(1),
        })
        .unwrap();
        let err = client.fetch(&format!("{base}/img")).await.unwrap_err();
        assert!(matches!(err, OriginError::TimedOut(_)));
        assert_eq!(err.response_status(), StatusCode::GATEWAY_TIMEOUT);
    }
}
