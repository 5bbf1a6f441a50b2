//! Pre-built helpers for testing code that uses `llm-conduit` types.
//!
//! Available when the `test-utils` feature is enabled, so downstream
//! crates can reuse them in their own test suites. Also compiled during
//! `#[cfg(test)]` for this crate's own tests.

use std::collections::{HashMap, HashSet};

use futures::StreamExt;

use crate::chat::{ChatResponse, FinishReason, ToolCall};
use crate::error::LlmError;
use crate::mock::MockProvider;
use crate::provider::{Capability, ProviderMetadata};
use crate::stream::{ChatStream, StreamChunk};
use crate::usage::{TokenUsage, Usage};

/// Metadata for a model that supports every capability.
pub fn metadata_for(provider_name: &str, model: &str) -> ProviderMetadata {
    ProviderMetadata {
        name: provider_name.to_owned().into(),
        model: model.into(),
        context_window: 128_000,
        capabilities: HashSet::from([
            Capability::Tools,
            Capability::StructuredOutput,
            Capability::Reasoning,
            Capability::Vision,
            Capability::Caching,
            Capability::Streaming,
        ]),
    }
}

/// Creates a [`MockProvider`] with [`metadata_for`].
pub fn mock_for(provider_name: &str, model: &str) -> MockProvider {
    MockProvider::new(metadata_for(provider_name, model))
}

/// Builds a finished text [`ChatResponse`] with [`sample_usage`].
pub fn sample_response(text: &str) -> ChatResponse {
    ChatResponse {
        content: text.into(),
        finish_reason: FinishReason::Stop,
        usage: sample_usage(),
        model: "test-model".into(),
        metadata: HashMap::new(),
        ..ChatResponse::default()
    }
}

/// Builds a [`ChatResponse`] requesting the given tool calls.
pub fn sample_tool_response(calls: Vec<ToolCall>) -> ChatResponse {
    ChatResponse {
        tool_calls: calls,
        finish_reason: FinishReason::ToolCalls,
        ..sample_response("")
    }
}

/// Returns a [`Usage`] with 100 input / 50 output tokens and no cost.
pub fn sample_usage() -> Usage {
    Usage::from_tokens(TokenUsage::from_counts(100, 50))
}

/// Collects every stream item, errors included.
pub async fn collect_stream(stream: ChatStream) -> Vec<Result<StreamChunk, LlmError>> {
    stream.collect::<Vec<_>>().await
}
