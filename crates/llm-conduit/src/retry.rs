//! Retry policies.
//!
//! Two independent layers:
//!
//! - [`ContentRetryPolicy`] looks at a finished response and decides
//!   whether it reads like a refusal worth asking again. Long responses
//!   are assumed substantive and never retried.
//! - [`RetryManager`] re-issues a call after transient transport errors
//!   ([`LlmError::is_retryable`]) with exponential backoff, and gives up
//!   with [`LlmError::RetryExhausted`].
//!
//! ```rust
//! use llm_conduit::retry::should_retry;
//!
//! assert!(should_retry("I'm sorry, I cannot help with that.", 200));
//! assert!(!should_retry("Here is the summary you asked for.", 200));
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;
use crate::error::LlmError;

/// Short refusal phrases, matched case-insensitively.
pub const REFUSAL_PHRASES: &[&str] = &[
    "i cannot",
    "i can't",
    "i am unable",
    "i'm unable",
    "as an ai",
    "i apologize",
    "i'm sorry",
    "cannot assist",
    "unable to assist",
    "not able to provide",
];

/// Decides whether a response should be retried on content grounds.
#[derive(Debug, Clone)]
pub struct ContentRetryPolicy {
    phrases: Vec<String>,
}

impl Default for ContentRetryPolicy {
    fn default() -> Self {
        Self::with_phrases(REFUSAL_PHRASES.iter().copied())
    }
}

impl ContentRetryPolicy {
    /// A policy using [`REFUSAL_PHRASES`].
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy using a custom denylist.
    pub fn with_phrases<I, S>(phrases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            phrases: phrases
                .into_iter()
                .map(|p| p.as_ref().to_lowercase())
                .collect(),
        }
    }

    /// Returns `true` if `content` is at most `threshold` characters long
    /// and contains a denylisted phrase.
    pub fn should_retry(&self, content: &str, threshold: usize) -> bool {
        if content.chars().count() > threshold {
            return false;
        }
        let lower = content.to_lowercase();
        self.phrases.iter().any(|p| lower.contains(p.as_str()))
    }
}

/// [`ContentRetryPolicy::should_retry`] with the default denylist.
pub fn should_retry(content: &str, threshold: usize) -> bool {
    ContentRetryPolicy::default().should_retry(content, threshold)
}

/// Re-issues calls that fail with retryable errors.
#[derive(Debug, Clone, Default)]
pub struct RetryManager {
    config: RetryConfig,
}

impl RetryManager {
    /// A manager using `config`.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// The active configuration.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delay before retry number `retry` (1-based), before jitter.
    #[allow(
        clippy::cast_possible_wrap,
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )] // retry counts and millisecond delays are small
    pub fn base_delay(&self, retry: u32) -> Duration {
        let delay_ms = self.config.initial_delay.as_millis() as f64
            * self.config.multiplier.powi(retry.saturating_sub(1) as i32);
        std::cmp::min(Duration::from_millis(delay_ms as u64), self.config.max_delay)
    }

    fn delay(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry);
        if self.config.jitter <= 0.0 {
            return base;
        }
        let min_factor = (1.0 - self.config.jitter).clamp(0.0, 1.0);
        let factor = rand::rng().random_range(min_factor..=1.0);
        base.mul_f64(factor)
    }

    /// Runs `op` until it succeeds, fails permanently, or runs out of retries.
    ///
    /// `op` receives the 1-based attempt number. Non-retryable errors are
    /// returned unchanged; a retryable error on the last attempt is wrapped
    /// in [`LlmError::RetryExhausted`].
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, LlmError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, LlmError>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) if attempt > self.config.max_retries => {
                    tracing::warn!(attempts = attempt, error = %e, "retries exhausted");
                    return Err(LlmError::RetryExhausted {
                        attempts: attempt,
                        last_error: Box::new(e),
                    });
                }
                Err(e) => {
                    let delay = self.delay(attempt);
                    tracing::info!(attempt, delay_ms = delay.as_millis(), error = %e, "retrying request");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::config::DEFAULT_CONTENT_RETRY_THRESHOLD;

    fn padded(phrase: &str, len: usize) -> String {
        let mut s = phrase.to_owned();
        while s.len() < len {
            s.push('.');
        }
        s
    }

    #[test]
    fn test_threshold_boundary() {
        let at = padded("I cannot do that", 200);
        let over = padded("I cannot do that", 201);
        assert_eq!(at.len(), 200);
        assert!(should_retry(&at, 200));
        assert!(!should_retry(&over, 200));
    }

    fn should_retry_at_default(content: &str) -> bool {
        should_retry(content, DEFAULT_CONTENT_RETRY_THRESHOLD)
    }

    #[test]
    fn test_case_insensitive_match() {
        assert!(should_retry_at_default("AS AN AI language model..."));
        assert!(should_retry_at_default("Sorry, I am UNABLE to comply"));
    }

    #[test]
    fn test_short_substantive_answer_not_retried() {
        assert!(!should_retry_at_default("42"));
        assert!(!should_retry_at_default(""));
    }

    #[test]
    fn test_custom_phrases() {
        let policy = ContentRetryPolicy::with_phrases(["Nope"]);
        assert!(policy.should_retry("nope.", 10));
        assert!(!policy.should_retry("I cannot", 10));
    }

    #[test]
    fn test_threshold_counts_characters() {
        let s = format!("i can't {}", "é".repeat(10));
        assert_eq!(s.chars().count(), 18);
        assert!(should_retry(&s, 18));
        assert!(!should_retry(&s, 17));
    }

    #[test]
    fn test_base_delay_grows_and_caps() {
        let m = RetryManager::new(RetryConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            ..RetryConfig::default()
        });
        assert_eq!(m.base_delay(1), Duration::from_millis(100));
        assert_eq!(m.base_delay(2), Duration::from_millis(200));
        assert_eq!(m.base_delay(3), Duration::from_millis(350));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let m = RetryManager::new(RetryConfig {
            initial_delay: Duration::from_millis(1000),
            jitter: 0.5,
            ..RetryConfig::default()
        });
        for _ in 0..50 {
            let d = m.delay(1);
            assert!(d >= Duration::from_millis(500) && d <= Duration::from_millis(1000));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_retries_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = RetryManager::default()
            .run(|attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(LlmError::Timeout { elapsed_ms: 1 })
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_exhausts() {
        let result: Result<(), _> = RetryManager::new(RetryConfig {
            max_retries: 2,
            ..RetryConfig::default()
        })
        .run(|_| async {
            Err(LlmError::Http {
                status: Some(http::StatusCode::SERVICE_UNAVAILABLE),
                message: "busy".into(),
                retryable: true,
            })
        })
        .await;
        let Err(LlmError::RetryExhausted { attempts, last_error }) = result else {
            panic!("expected RetryExhausted");
        };
        assert_eq!(attempts, 3);
        assert!(matches!(*last_error, LlmError::Http { .. }));
    }

    #[tokio::test]
    async fn test_run_does_not_retry_permanent_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = RetryManager::default()
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(LlmError::Auth("bad key".into())) }
            })
            .await;
        assert!(matches!(result, Err(LlmError::Auth(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
