use crate::chat::FinishReason;
use crate::error::LlmError;
use crate::provider::JsonSchema;
use crate::repair::parse_lenient;
use crate::stream::{StreamChunk, ValidationIssue};

use super::{ExchangeState, StreamProcessor};

/// Validates structured output on the terminal increment.
///
/// With a schema: the accumulated content is parsed (strictly, then with
/// repair) and validated. Success stores the value in
/// `metadata.parsed`; any failure fills `metadata.validation_errors` and
/// sets the finish reason to [`FinishReason::ContentFilter`]. Nothing is
/// ever raised, so the terminal increment always arrives.
///
/// Without a schema, content passes through as opaque text.
#[derive(Debug, Clone, Default)]
pub struct ResponseValidator {
    schema: Option<JsonSchema>,
}

impl ResponseValidator {
    /// Validates against `schema`, or passes through when `None`.
    pub fn new(schema: Option<JsonSchema>) -> Self {
        Self { schema }
    }
}

impl StreamProcessor for ResponseValidator {
    fn name(&self) -> &'static str {
        "response_validator"
    }

    fn process(
        &mut self,
        mut chunk: StreamChunk,
        state: &mut ExchangeState,
    ) -> Result<StreamChunk, LlmError> {
        let Some(schema) = &self.schema else {
            return Ok(chunk);
        };
        if !chunk.is_complete || chunk.metadata.finish_reason == FinishReason::Error {
            return Ok(chunk);
        }
        // A pure tool-call turn has no structured answer yet.
        if state.content.trim().is_empty() && !state.tool_calls.is_empty() {
            return Ok(chunk);
        }

        let issues = match parse_lenient(&state.content) {
            Ok(value) => match schema.validate_detailed(&value) {
                Ok(()) => {
                    chunk.metadata.parsed = Some(value);
                    return Ok(chunk);
                }
                Err(issues) => issues,
            },
            Err(e) => vec![ValidationIssue::new("", format!("invalid JSON: {e}"))],
        };
        tracing::debug!(count = issues.len(), "structured output failed validation");
        chunk.metadata.validation_errors = issues;
        chunk.metadata.finish_reason = FinishReason::ContentFilter;
        Ok(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> JsonSchema {
        JsonSchema::new(json!({
            "type": "object",
            "properties": {"answer": {"type": "integer"}},
            "required": ["answer"]
        }))
    }

    fn run(validator: &mut ResponseValidator, content: &str) -> StreamChunk {
        let mut state = ExchangeState {
            content: content.into(),
            ..ExchangeState::default()
        };
        validator
            .process(StreamChunk::finish(FinishReason::Stop), &mut state)
            .unwrap()
    }

    #[test]
    fn test_valid_output_is_parsed() {
        let out = run(&mut ResponseValidator::new(Some(schema())), r#"{"answer": 42}"#);
        assert_eq!(out.metadata.parsed, Some(json!({"answer": 42})));
        assert!(out.metadata.validation_errors.is_empty());
        assert_eq!(out.metadata.finish_reason, FinishReason::Stop);
    }

    #[test]
    fn test_repairable_output_is_parsed() {
        let out = run(&mut ResponseValidator::new(Some(schema())), "{answer: 42,}");
        assert_eq!(out.metadata.parsed, Some(json!({"answer": 42})));
    }

    #[cfg(feature = "schema")]
    #[test]
    fn test_schema_failure_fails_closed() {
        let out = run(&mut ResponseValidator::new(Some(schema())), r#"{"answer": "many"}"#);
        assert!(out.is_complete);
        assert!(out.metadata.parsed.is_none());
        assert_eq!(out.metadata.finish_reason, FinishReason::ContentFilter);
        assert_eq!(out.metadata.validation_errors[0].path, "/answer");
    }

    #[test]
    fn test_syntax_failure_fails_closed() {
        let out = run(&mut ResponseValidator::new(Some(schema())), "definitely not json");
        assert_eq!(out.metadata.finish_reason, FinishReason::ContentFilter);
        assert_eq!(out.metadata.validation_errors.len(), 1);
        assert!(out.metadata.validation_errors[0].message.contains("invalid JSON"));
    }

    #[test]
    fn test_no_schema_passes_opaque_text() {
        let out = run(&mut ResponseValidator::new(None), "definitely not json");
        assert_eq!(out.metadata.finish_reason, FinishReason::Stop);
        assert!(out.metadata.validation_errors.is_empty());
        assert!(out.metadata.parsed.is_none());
    }

    #[test]
    fn test_non_terminal_untouched() {
        let mut v = ResponseValidator::new(Some(schema()));
        let mut state = ExchangeState {
            content: "{".into(),
            ..ExchangeState::default()
        };
        let out = v.process(StreamChunk::text("{"), &mut state).unwrap();
        assert!(out.metadata.validation_errors.is_empty());
        assert_eq!(out.metadata.finish_reason, FinishReason::None);
    }
}
