//! Retry layer for LLM calls.
//!
//! Rate-limit errors back off exponentially with jitter (1 s initial,
//! 60 s cap) until a 300 s per-call deadline. Any other error gets
//! exactly one retry. Deadline expiry surfaces as the last provider
//! error so per-item failure reporting stays meaningful.

use std::time::Duration;

use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tracing::{debug, warn};

use super::{LlmGateway, LlmRequest, LlmResponse};
use crate::error::{Error, Result};

/// Tunables for [`call_with_retry`].
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// First rate-limit backoff delay.
    pub initial_delay: Duration,
    /// Rate-limit backoff cap.
    pub max_delay: Duration,
    /// Wall-clock budget for the whole call including retries.
    pub deadline: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            deadline: Duration::from_secs(300),
        }
    }
}

/// Call the gateway under the retry policy.
pub async fn call_with_retry(
    gateway: &dyn LlmGateway,
    request: LlmRequest,
    policy: RetryPolicy,
) -> Result<LlmResponse> {
    let attempt_loop = async {
        // tokio-retry's base is the exponent: base 2 with the initial
        // delay as factor yields initial, 2x, 4x, ... up to the cap.
        let factor = (policy.initial_delay.as_millis() as u64 / 2).max(1);
        let mut backoff = ExponentialBackoff::from_millis(2)
            .factor(factor)
            .max_delay(policy.max_delay)
            .map(jitter);
        let mut retried_other = false;

        loop {
            match gateway.call(request.clone()).await {
                Ok(response) => return Ok(response),
                Err(err) if err.is_rate_limit() => {
                    let delay = backoff.next().unwrap_or(policy.max_delay);
                    debug!(delay_ms = delay.as_millis() as u64, "rate limited, backing off");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    if retried_other {
                        return Err(err);
                    }
                    retried_other = true;
                    warn!(error = %err, "llm call failed, retrying once");
                }
            }
        }
    };

    match tokio::time::timeout(policy.deadline, attempt_loop).await {
        Ok(result) => result,
        Err(_) => Err(Error::Llm(format!(
            "call deadline of {}s exceeded",
            policy.deadline.as_secs()
        ))),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::CallStats;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails `failures` times with the given error kind, then succeeds.
    struct FlakyGateway {
        failures: usize,
        rate_limited: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LlmGateway for FlakyGateway {
        async fn call(&self, _request: LlmRequest) -> Result<LlmResponse> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(if self.rate_limited {
                    Error::LlmRateLimited("429".into())
                } else {
                    Error::Llm("boom".into())
                });
            }
            Ok(LlmResponse {
                content: "ok".into(),
                stats: CallStats::default(),
            })
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            deadline: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn other_errors_get_exactly_one_retry() {
        let gateway = FlakyGateway {
            failures: 1,
            rate_limited: false,
            calls: AtomicUsize::new(0),
        };
        let response = call_with_retry(&gateway, LlmRequest::text("hi"), fast_policy())
            .await
            .unwrap();
        assert_eq!(response.content, "ok");
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn second_other_error_propagates() {
        let gateway = FlakyGateway {
            failures: 2,
            rate_limited: false,
            calls: AtomicUsize::new(0),
        };
        let err = call_with_retry(&gateway, LlmRequest::text("hi"), fast_policy())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Llm(_)));
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn rate_limits_are_retried_until_success() {
        let gateway = FlakyGateway {
            failures: 4,
            rate_limited: true,
            calls: AtomicUsize::new(0),
        };
        let response = call_with_retry(&gateway, LlmRequest::text("hi"), fast_policy())
            .await
            .unwrap();
        assert_eq!(response.content, "ok");
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn deadline_cuts_off_endless_rate_limits() {
        let gateway = FlakyGateway {
            failures: usize::MAX,
            rate_limited: true,
            calls: AtomicUsize::new(0),
        };
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(10),
            deadline: Duration::from_millis(50),
        };
        let err = call_with_retry(&gateway, LlmRequest::text("hi"), policy)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("deadline"));
    }
}
