//! Controller, retry and splitter configuration.
//!
//! Every struct implements `Default` with the documented values and
//! deserializes with `#[serde(default)]`, so a host can load a partial
//! config file and override only what it needs:
//!
//! ```rust
//! use llm_conduit::config::ChunkConfig;
//!
//! let config: ChunkConfig = serde_json::from_str(r#"{"max_iterations": 5, "parallel": true}"#).unwrap();
//! assert_eq!(config.max_iterations, 5);
//! assert_eq!(config.retry.max_retries, 3);
//! ```
//!
//! Durations are written as integer milliseconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Dispatch ceiling applied when none is configured.
pub const DEFAULT_MAX_ITERATIONS: u32 = 20;

/// Responses longer than this are never retried on content grounds.
pub const DEFAULT_CONTENT_RETRY_THRESHOLD: usize = 200;

/// Chunk & iteration controller settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkConfig {
    /// Maximum chat/stream dispatches before `ChunkIterationLimit`.
    pub max_iterations: u32,
    /// Dispatch chunks concurrently.
    pub parallel: bool,
    /// Concurrency cap in parallel mode (`None` = all chunks at once).
    pub max_parallel: Option<usize>,
    /// Transport-level retry.
    pub retry: RetryConfig,
    /// Refusal-based retry.
    pub content_retry: ContentRetryConfig,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            parallel: false,
            max_parallel: None,
            retry: RetryConfig::default(),
            content_retry: ContentRetryConfig::default(),
        }
    }
}

/// Exponential backoff for transient transport failures.
///
/// Delay before retry `n` (1-based) is
/// `min(initial_delay * multiplier^(n-1), max_delay)`, optionally scaled
/// by a random factor in `[1 - jitter, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    #[serde(with = "duration_ms")]
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
    /// Growth factor between retries.
    pub multiplier: f64,
    /// Fraction of each delay that may be randomly removed (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }
}

/// Retry on short refusal-like responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentRetryConfig {
    /// Whether content retry is active.
    pub enabled: bool,
    /// Length (in characters) above which content is never retried.
    pub threshold: usize,
    /// Extra dispatches allowed per chunk for refusals.
    pub max_attempts: u32,
}

impl Default for ContentRetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: DEFAULT_CONTENT_RETRY_THRESHOLD,
            max_attempts: 2,
        }
    }
}

/// Budget for the default text splitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitConfig {
    /// Token budget per chunk.
    pub max_tokens: usize,
    /// Characters assumed per token.
    pub chars_per_token: usize,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            max_tokens: 4_000,
            chars_per_token: 4,
        }
    }
}

impl SplitConfig {
    /// Character budget per chunk (never zero).
    pub fn max_chars(&self) -> usize {
        self.max_tokens.saturating_mul(self.chars_per_token).max(1)
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
