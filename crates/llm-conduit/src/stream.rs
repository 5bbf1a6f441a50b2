//! Canonical streaming increments.
//!
//! Every provider adapter produces a [`ChatStream`] of [`StreamChunk`]s,
//! whatever its wire protocol looks like. An increment carries a text
//! fragment, tool-call argument fragments ([`ToolCallDelta`]), or both,
//! plus [`IncrementMetadata`] that the
//! [`StreamPipeline`](crate::pipeline::StreamPipeline) enriches as it
//! passes through.
//!
//! # Terminal increment
//!
//! Exactly one increment per exchange has `is_complete == true`. It is the
//! only one that carries final usage totals, completed tool calls and
//! validation results. All earlier increments carry only what is new.
//!
//! ```rust
//! use futures::StreamExt;
//! use llm_conduit::{ChatStream, StreamChunk};
//!
//! async fn print_stream(mut stream: ChatStream) {
//!     while let Some(item) = stream.next().await {
//!         match item {
//!             Ok(chunk) if chunk.is_complete => {
//!                 println!("\n[done: {:?}]", chunk.metadata.finish_reason);
//!             }
//!             Ok(chunk) => print!("{}", chunk.content),
//!             Err(e) => eprintln!("stream error: {e}"),
//!         }
//!     }
//! }
//! ```

use std::pin::Pin;

use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::chat::{FinishReason, ToolCall};
use crate::error::LlmError;
use crate::usage::Usage;

/// A pinned, boxed, `Send` stream of [`StreamChunk`] results.
pub type ChatStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, LlmError>> + Send>>;

/// A fragment of one tool call's name or arguments.
///
/// Vendors that key calls by an opaque item identifier set `item_id`;
/// the reconstructor maps those to stable indices in first-seen order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ToolCallDelta {
    /// Position of the call within the exchange.
    pub index: u32,
    /// Vendor item identifier, used instead of `index` when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    /// Call identifier, usually sent once with the first fragment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Tool name, usually sent once with the first fragment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// A piece of the JSON arguments text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

impl ToolCallDelta {
    /// Announces a new call.
    pub fn start(index: u32, id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            index,
            id: Some(id.into()),
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// An arguments fragment for an announced call.
    pub fn arguments(index: u32, fragment: impl Into<String>) -> Self {
        Self {
            index,
            arguments: Some(fragment.into()),
            ..Self::default()
        }
    }
}

/// A single `{path, message}` structured-output problem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// JSON pointer to the offending value (empty for the root).
    pub path: String,
    /// What is wrong there.
    pub message: String,
}

impl ValidationIssue {
    /// Creates an issue.
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Position of an increment within a multi-chunk dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    /// One-based chunk number.
    pub current_chunk: usize,
    /// Number of chunks in the dispatch.
    pub total_chunks: usize,
}

/// Per-increment annotations.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct IncrementMetadata {
    /// `None` until the exchange finishes.
    #[serde(default)]
    pub finish_reason: FinishReason,
    /// Usage attached by the accountant (cumulative on the terminal increment).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    /// Model that produced the increment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Structured-output problems found on the terminal increment.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validation_errors: Vec<ValidationIssue>,
    /// Parsed structured output, when requested and valid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parsed: Option<Value>,
    /// Chunk position, set by the chunk controller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_info: Option<ProcessInfo>,
    /// Error message for increments closing a failed stream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Length of the content accumulated so far.
    #[serde(default)]
    pub accumulated_len: usize,
    /// Tool calls announced but not yet complete.
    #[serde(default)]
    pub pending_tool_calls: usize,
    /// Raw buffers of tool calls discarded at finish.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_call_warnings: Vec<String>,
}

/// One canonical streamed update.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StreamChunk {
    /// New text since the previous increment.
    #[serde(default)]
    pub content: String,
    /// Completed tool calls (all of them, on the terminal increment).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Raw tool-call fragments received with this increment.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_call_deltas: Vec<ToolCallDelta>,
    /// Whether this is the terminal increment.
    #[serde(default)]
    pub is_complete: bool,
    /// New reasoning text since the previous increment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    /// Annotations.
    #[serde(default)]
    pub metadata: IncrementMetadata,
}

impl StreamChunk {
    /// A non-terminal text increment.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    /// A non-terminal increment carrying tool-call fragments.
    pub fn deltas(deltas: Vec<ToolCallDelta>) -> Self {
        Self {
            tool_call_deltas: deltas,
            ..Self::default()
        }
    }

    /// A terminal increment with the given finish reason.
    pub fn finish(reason: FinishReason) -> Self {
        Self {
            is_complete: true,
            metadata: IncrementMetadata {
                finish_reason: reason,
                ..IncrementMetadata::default()
            },
            ..Self::default()
        }
    }

    /// A terminal increment closing a failed stream.
    pub fn failed(error: &LlmError) -> Self {
        let mut chunk = Self::finish(FinishReason::Error);
        chunk.metadata.error = Some(error.to_string());
        chunk
    }

    /// Attaches provider-reported usage.
    #[must_use]
    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.metadata.usage = Some(usage);
        self
    }

    /// Attaches the model name.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.metadata.model = Some(model.into());
        self
    }
}
