//! Transport-level retry for LLM calls.
//!
//! Retries rate-limit, connection, and 5xx failures with exponential
//! backoff plus ±20% jitter. Logical failures (bad tool output) are the
//! classifier's problem and pass straight through.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::warn;

use crate::error::LlmError;
use crate::llm::{ChatRequest, ChatResponse, LlmProvider};

/// Backoff base delays per retry attempt.
const RETRY_DELAYS: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
];

/// Decorator adding transient-error retries to any provider.
pub struct RetryingProvider<P> {
    inner: P,
    max_retries: usize,
}

impl<P: LlmProvider> RetryingProvider<P> {
    pub fn new(inner: P) -> Self {
        Self {
            inner,
            max_retries: RETRY_DELAYS.len(),
        }
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// Delay before retry `attempt` (0-based), honoring a server-provided
/// retry-after when present, with ±20% jitter either way.
fn retry_delay(error: &LlmError, attempt: usize) -> Duration {
    let base = match error {
        LlmError::RateLimited {
            retry_after: Some(after),
        } => *after,
        _ => RETRY_DELAYS[attempt.min(RETRY_DELAYS.len() - 1)],
    };
    let jitter_factor = rand::thread_rng().gen_range(-0.2..=0.2);
    let jittered = base.as_secs_f64() * (1.0 + jitter_factor);
    Duration::from_secs_f64(jittered.max(0.0))
}

#[async_trait]
impl<P: LlmProvider> LlmProvider for RetryingProvider<P> {
    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, LlmError> {
        let mut attempt = 0;
        loop {
            match self.inner.complete(request.clone()).await {
                Ok(response) => return Ok(response),
                Err(error) if error.is_transient() && attempt < self.max_retries => {
                    let delay = retry_delay(&error, attempt);
                    warn!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Transient LLM error, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::llm::{ChatMessage, ContentBlock, Usage};

    /// Provider that fails `failures` times, then succeeds.
    struct FlakyProvider {
        failures: Mutex<usize>,
        error_kind: fn() -> LlmError,
        calls: Mutex<usize>,
    }

    impl FlakyProvider {
        fn new(failures: usize, error_kind: fn() -> LlmError) -> Self {
            Self {
                failures: Mutex::new(failures),
                error_kind,
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl LlmProvider for FlakyProvider {
        async fn complete(&self, _request: ChatRequest) -> Result<ChatResponse, LlmError> {
            *self.calls.lock().unwrap() += 1;
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err((self.error_kind)());
            }
            Ok(ChatResponse {
                model: "test".to_string(),
                stop_reason: None,
                content: vec![ContentBlock::Text {
                    text: "ok".to_string(),
                }],
                usage: Usage::default(),
            })
        }
    }

    fn request() -> ChatRequest {
        ChatRequest::new("test", vec![ChatMessage::user("hello")])
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_errors_until_success() {
        let provider = RetryingProvider::new(FlakyProvider::new(2, || LlmError::Status {
            status_code: 503,
            message: "overloaded".to_string(),
        }));
        let response = provider.complete(request()).await.unwrap();
        assert_eq!(response.text(), "ok");
        assert_eq!(provider.inner.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_retries() {
        let provider = RetryingProvider::new(FlakyProvider::new(10, || {
            LlmError::Connection("reset".to_string())
        }));
        let error = provider.complete(request()).await.unwrap_err();
        assert!(matches!(error, LlmError::Connection(_)));
        // 1 initial + 3 retries
        assert_eq!(provider.inner.calls(), 4);
    }

    #[tokio::test]
    async fn non_transient_errors_pass_through_immediately() {
        let provider = RetryingProvider::new(FlakyProvider::new(10, || LlmError::Status {
            status_code: 400,
            message: "bad request".to_string(),
        }));
        let error = provider.complete(request()).await.unwrap_err();
        assert!(matches!(error, LlmError::Status { status_code: 400, .. }));
        assert_eq!(provider.inner.calls(), 1);
    }

    #[test]
    fn delay_stays_within_jitter_band() {
        let error = LlmError::Connection("x".to_string());
        for attempt in 0..3 {
            let base = RETRY_DELAYS[attempt].as_secs_f64();
            for _ in 0..50 {
                let d = retry_delay(&error, attempt).as_secs_f64();
                assert!(d >= base * 0.8 - 1e-9 && d <= base * 1.2 + 1e-9);
            }
        }
    }

    #[test]
    fn delay_honors_retry_after() {
        let error = LlmError::RateLimited {
            retry_after: Some(Duration::from_secs(10)),
        };
        let d = retry_delay(&error, 0).as_secs_f64();
        assert!((8.0..=12.0).contains(&d));
    }

    #[test]
    fn delay_clamps_attempt_beyond_table() {
        let error = LlmError::Connection("x".to_string());
        let d = retry_delay(&error, 99).as_secs_f64();
        assert!((3.2..=4.8).contains(&d));
    }
}
