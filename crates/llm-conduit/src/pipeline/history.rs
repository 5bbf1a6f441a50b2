use crate::chat::{ChatMessage, FinishReason};
use crate::error::LlmError;
use crate::history::{self, SharedHistory};
use crate::stream::StreamChunk;

use super::{ExchangeState, StreamProcessor};

/// Appends the assistant turn to a conversation history.
///
/// Writes exactly once per exchange, on the terminal increment, using the
/// accumulated content and completed tool calls. Failed exchanges
/// ([`FinishReason::Error`]) are not recorded.
#[derive(Debug)]
pub struct HistoryCapture {
    history: SharedHistory,
    captured: bool,
}

impl HistoryCapture {
    /// Captures into `history`.
    pub fn new(history: SharedHistory) -> Self {
        Self {
            history,
            captured: false,
        }
    }
}

impl StreamProcessor for HistoryCapture {
    fn name(&self) -> &'static str {
        "history_capture"
    }

    fn process(
        &mut self,
        chunk: StreamChunk,
        state: &mut ExchangeState,
    ) -> Result<StreamChunk, LlmError> {
        if !chunk.is_complete
            || self.captured
            || chunk.metadata.finish_reason == FinishReason::Error
        {
            return Ok(chunk);
        }
        self.captured = true;
        let message = if state.tool_calls.is_empty() {
            ChatMessage::assistant(state.content.clone())
        } else {
            ChatMessage::assistant_with_tool_calls(state.content.clone(), state.tool_calls.clone())
        };
        history::lock(&self.history).push(message);
        Ok(chunk)
    }

    fn reset(&mut self) {
        self.captured = false;
    }
}
