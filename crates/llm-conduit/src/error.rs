//! Unified error type for all orchestration operations.
//!
//! Provider adapters map their native errors into [`LlmError`], and the
//! orchestration layer adds its own control-flow failures on top
//! (iteration ceiling, missing capability, missing collaborator).
//!
//! # What is *not* an error
//!
//! Content-shape problems are recovered locally and never surface here:
//! malformed structured output and schema violations are recorded as
//! [`ValidationIssue`](crate::stream::ValidationIssue)s on the terminal
//! increment, and a transport failure in the middle of a stream becomes a
//! terminal increment with [`FinishReason::Error`](crate::chat::FinishReason::Error).
//!
//! # Retryability
//!
//! Several variants include a `retryable` flag that adapters set based
//! on the upstream response (e.g. HTTP 429 or 503). The
//! [`RetryManager`](crate::retry::RetryManager) consults
//! [`LlmError::is_retryable`] to decide whether to re-issue a call:
//!
//! ```rust
//! use llm_conduit::LlmError;
//!
//! let err = LlmError::Timeout { elapsed_ms: 5000 };
//! assert!(err.is_retryable());
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The unified error type returned by all provider and controller operations.
///
/// Variants are `#[non_exhaustive]`, so always include a wildcard arm.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum LlmError {
    /// An HTTP-level failure (transport error, unexpected status code).
    ///
    /// `status` is `None` when the request never received a response
    /// (e.g. DNS failure, connection reset).
    #[error("HTTP error (status={status:?}): {message}")]
    Http {
        /// The HTTP status code, if one was received.
        status: Option<http::StatusCode>,
        /// A human-readable description of the failure.
        message: String,
        /// Whether the caller should retry this request.
        retryable: bool,
    },

    /// The API key or token was rejected.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// The request was malformed (missing fields, invalid parameters).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A provider-specific error that doesn't map to another variant.
    #[error("Provider error ({code}): {message}")]
    Provider {
        /// Provider-defined error code (e.g. `"overloaded"`).
        code: String,
        /// Human-readable error description.
        message: String,
        /// Whether the caller should retry this request.
        retryable: bool,
    },

    /// The response body could not be parsed.
    #[error("Response format error: {message}")]
    ResponseFormat {
        /// What went wrong during parsing.
        message: String,
        /// The raw response body, for diagnostics.
        raw: String,
    },

    /// A structured value failed JSON Schema validation.
    ///
    /// The streaming pipeline never raises this; it records the issues in
    /// increment metadata instead. It is returned by direct calls to
    /// [`JsonSchema::validate`](crate::provider::JsonSchema::validate).
    #[error("Schema validation error: {message}")]
    SchemaValidation {
        /// Concatenated validation error messages.
        message: String,
        /// The schema the value was validated against.
        schema: Value,
        /// The value that failed validation.
        actual: Value,
    },

    /// A tool invocation raised an error outside the tool's own result.
    #[error("Tool execution error ({tool_name}): {source}")]
    ToolExecution {
        /// The name of the tool that failed.
        tool_name: String,
        /// The underlying error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The retry manager exhausted its budget without a successful response.
    #[error("Retry exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted {
        /// How many attempts were made.
        attempts: u32,
        /// The error from the final attempt.
        #[source]
        last_error: Box<LlmError>,
    },

    /// The operation exceeded its deadline.
    #[error("Operation timed out after {elapsed_ms}ms")]
    Timeout {
        /// Milliseconds elapsed before the timeout fired.
        elapsed_ms: u64,
    },

    /// The selected model/provider does not support a requested feature.
    ///
    /// Fatal to the call and never retried.
    #[error("model '{model}' does not support {capability}")]
    Capability {
        /// The missing capability, e.g. `"tool calling"`.
        capability: String,
        /// The model that was asked for it.
        model: String,
    },

    /// The chunk/resubmission loop reached its dispatch ceiling.
    #[error(transparent)]
    ChunkIterationLimit(#[from] ChunkIterationLimitError),

    /// A collaborator required to continue was not configured, e.g. a
    /// tool orchestrator for a response that requests tool resubmission.
    #[error("missing required collaborator: {0}")]
    MissingCollaborator(String),
}

impl LlmError {
    /// Returns `true` if the error is transient and the request may succeed on retry.
    ///
    /// ```rust
    /// use llm_conduit::LlmError;
    ///
    /// let err = LlmError::Auth("bad key".into());
    /// assert!(!err.is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http { retryable, .. } | Self::Provider { retryable, .. } => *retryable,
            Self::Timeout { .. } => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for LlmError {
    fn from(err: serde_json::Error) -> Self {
        Self::ResponseFormat {
            message: err.to_string(),
            raw: String::new(),
        }
    }
}

/// Raised when a controller would exceed its configured dispatch ceiling.
///
/// A flat value type: it carries no source chain, so it serializes to
/// `{"maxIterations": N}` without cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "camelCase")]
#[error("chunk iteration limit of {max_iterations} exceeded")]
pub struct ChunkIterationLimitError {
    /// The configured maximum number of dispatches.
    pub max_iterations: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_http() {
        let err = LlmError::Http {
            status: Some(http::StatusCode::TOO_MANY_REQUESTS),
            message: "rate limited".into(),
            retryable: true,
        };
        let display = format!("{err}");
        assert!(display.contains("429"));
        assert!(display.contains("rate limited"));
    }

    #[test]
    fn test_error_display_capability() {
        let err = LlmError::Capability {
            capability: "tool calling".into(),
            model: "tiny-1".into(),
        };
        let display = format!("{err}");
        assert!(display.contains("tiny-1"));
        assert!(display.contains("tool calling"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_error_display_retry_exhausted() {
        let inner = LlmError::Http {
            status: Some(http::StatusCode::INTERNAL_SERVER_ERROR),
            message: "server error".into(),
            retryable: true,
        };
        let err = LlmError::RetryExhausted {
            attempts: 3,
            last_error: Box::new(inner),
        };
        let display = format!("{err}");
        assert!(display.contains('3'));
        assert!(display.contains("server error"));
    }

    #[test]
    fn test_error_retry_exhausted_source_chain() {
        use std::error::Error;
        let err = LlmError::RetryExhausted {
            attempts: 3,
            last_error: Box::new(LlmError::Auth("expired".into())),
        };
        let source = err.source().expect("RetryExhausted should have a source");
        assert!(format!("{source}").contains("expired"));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<LlmError>();
    }

    #[test]
    fn test_retryable_flags() {
        assert!(LlmError::Timeout { elapsed_ms: 1 }.is_retryable());
        assert!(
            LlmError::Provider {
                code: "overloaded".into(),
                message: "busy".into(),
                retryable: true,
            }
            .is_retryable()
        );
        assert!(!LlmError::InvalidRequest("bad".into()).is_retryable());
        assert!(!LlmError::MissingCollaborator("tool orchestrator".into()).is_retryable());
    }

    #[test]
    fn test_iteration_limit_serializes_flat() {
        let err = ChunkIterationLimitError { max_iterations: 5 };
        let json = serde_json::to_value(err).unwrap();
        assert_eq!(json, serde_json::json!({"maxIterations": 5}));
        let back: ChunkIterationLimitError = serde_json::from_value(json).unwrap();
        assert_eq!(back, err);
    }

    #[test]
    fn test_iteration_limit_converts_into_llm_error() {
        let err: LlmError = ChunkIterationLimitError { max_iterations: 20 }.into();
        assert!(matches!(
            err,
            LlmError::ChunkIterationLimit(ChunkIterationLimitError { max_iterations: 20 })
        ));
        assert!(format!("{err}").contains("20"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<Value>("not valid json").unwrap_err();
        let err: LlmError = json_err.into();
        assert!(matches!(err, LlmError::ResponseFormat { .. }));
    }
}
