use crate::chat::{FinishReason, ToolCall};
use crate::error::LlmError;
use crate::reconstruct::ToolCallReconstructor;
use crate::stream::StreamChunk;

use super::{ExchangeState, StreamProcessor};

/// Concatenates content and reassembles tool calls.
///
/// Every outgoing increment is annotated with the accumulated content
/// length and the number of still-open tool calls. On the terminal
/// increment the reconstructor gets a final completion pass, its warnings
/// are attached, and `tool_calls` is set to every completed call of the
/// exchange. An `Error` terminal carries no calls: open buffers are
/// reported as warnings and dropped.
#[derive(Debug, Default)]
pub struct ContentAccumulator {
    reconstructor: ToolCallReconstructor,
    /// Fully formed calls sent by adapters that do not stream arguments.
    direct_calls: Vec<ToolCall>,
}

impl ContentAccumulator {
    /// A fresh accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses a custom reconstructor (e.g. with a different timeout).
    pub fn with_reconstructor(reconstructor: ToolCallReconstructor) -> Self {
        Self {
            reconstructor,
            direct_calls: Vec::new(),
        }
    }

    fn all_calls(&self) -> Vec<ToolCall> {
        let mut calls = self.reconstructor.completed();
        for call in &self.direct_calls {
            if !calls.iter().any(|c| c.id == call.id) {
                calls.push(call.clone());
            }
        }
        calls
    }
}

impl StreamProcessor for ContentAccumulator {
    fn name(&self) -> &'static str {
        "content_accumulator"
    }

    fn process(
        &mut self,
        mut chunk: StreamChunk,
        state: &mut ExchangeState,
    ) -> Result<StreamChunk, LlmError> {
        state.content.push_str(&chunk.content);
        if let Some(reasoning) = &chunk.reasoning {
            state.reasoning.push_str(reasoning);
        }

        for delta in &chunk.tool_call_deltas {
            if let Some(call) = self.reconstructor.push_delta(delta) {
                tracing::debug!(id = %call.id, name = %call.name, "tool call complete");
            }
        }
        self.reconstructor.expire();

        for call in &chunk.tool_calls {
            if !self.direct_calls.iter().any(|c| c.id == call.id) {
                self.direct_calls.push(call.clone());
            }
        }

        if chunk.is_complete {
            let discarded = if chunk.metadata.finish_reason == FinishReason::Error {
                // A failed exchange yields no calls, finished or partial.
                let dropped = self.reconstructor.abandon();
                self.reconstructor.reset();
                self.direct_calls.clear();
                dropped
            } else {
                self.reconstructor.finish().discarded
            };
            let warnings: Vec<String> = discarded.iter().map(ToString::to_string).collect();
            state.warnings.extend(warnings.iter().cloned());
            chunk.metadata.tool_call_warnings.extend(warnings);
            chunk.tool_calls = self.all_calls();
        }

        state.tool_calls = self.all_calls();
        state.pending_tool_calls = self.reconstructor.pending();
        chunk.metadata.accumulated_len = state.content.len();
        chunk.metadata.pending_tool_calls = state.pending_tool_calls;
        Ok(chunk)
    }

    fn reset(&mut self) {
        self.reconstructor.reset();
        self.direct_calls.clear();
    }
}
