//! Retry with exponential backoff for transient model failures.

use crate::{GenerateOptions, LanguageModel};
use async_trait::async_trait;
use concord_core::{ConcordError, ConcordResult, LlmError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff schedule for [`RetryingModel`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-based), capped at `max_backoff`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = f64::from(self.backoff_multiplier.max(1.0)).powi(attempt as i32);
        let millis = self.initial_backoff.as_millis() as f64 * factor;
        let capped = millis.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Wraps a model and retries rate-limited and transient request failures.
///
/// A `RateLimited` error waits at least its `retry_after_ms`.
pub struct RetryingModel<M> {
    inner: M,
    policy: RetryPolicy,
}

impl<M: LanguageModel> RetryingModel<M> {
    pub fn new(inner: M, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl<M: LanguageModel> LanguageModel for RetryingModel<M> {
    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        options: &GenerateOptions,
    ) -> ConcordResult<String> {
        let mut attempt = 0;
        loop {
            match self.inner.generate(model, prompt, options).await {
                Ok(text) => return Ok(text),
                Err(ConcordError::Llm(err))
                    if err.is_transient() && attempt < self.policy.max_retries =>
                {
                    let mut delay = self.policy.backoff_for(attempt);
                    if let LlmError::RateLimited { retry_after_ms, .. } = &err {
                        delay = delay
                            .max(Duration::from_millis(*retry_after_ms))
                            .min(self.policy.max_backoff);
                    }
                    tracing::warn!(
                        provider = self.inner.provider_id(),
                        model,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying language model call"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn provider_id(&self) -> &str {
        self.inner.provider_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails with the given error `failures` times, then succeeds.
    struct FlakyModel {
        failures: u32,
        error: LlmError,
        calls: AtomicU32,
    }

    #[async_trait]
    impl LanguageModel for FlakyModel {
        async fn generate(
            &self,
            _model: &str,
            _prompt: &str,
            _options: &GenerateOptions,
        ) -> ConcordResult<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(self.error.clone().into())
            } else {
                Ok("ok".to_string())
            }
        }

        fn provider_id(&self) -> &str {
            "flaky"
        }
    }

    fn flaky(failures: u32, error: LlmError) -> FlakyModel {
        FlakyModel {
            failures,
            error,
            calls: AtomicU32::new(0),
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
            backoff_multiplier: 2.0,
        };
        assert_eq!(policy.backoff_for(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(400));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let model = RetryingModel::new(
            flaky(
                2,
                LlmError::RequestFailed {
                    provider: "flaky".into(),
                    status: 503,
                    message: "unavailable".into(),
                },
            ),
            fast_policy(3),
        );
        let out = model.generate("m", "p", &GenerateOptions::default()).await;
        assert_eq!(out.unwrap(), "ok");
        assert_eq!(model.inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let model = RetryingModel::new(
            flaky(
                10,
                LlmError::RateLimited {
                    provider: "flaky".into(),
                    retry_after_ms: 1,
                },
            ),
            fast_policy(2),
        );
        let out = model.generate("m", "p", &GenerateOptions::default()).await;
        assert!(matches!(
            out,
            Err(ConcordError::Llm(LlmError::RateLimited { .. }))
        ));
        assert_eq!(model.inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_does_not_retry_permanent_errors() {
        let model = RetryingModel::new(
            flaky(
                1,
                LlmError::InvalidResponse {
                    provider: "flaky".into(),
                    reason: "garbage".into(),
                },
            ),
            fast_policy(3),
        );
        let out = model.generate("m", "p", &GenerateOptions::default()).await;
        assert!(out.is_err());
        assert_eq!(model.inner.calls.load(Ordering::SeqCst), 1);
    }
}
