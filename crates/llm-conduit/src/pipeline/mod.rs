//! Ordered stream-processing pipeline.
//!
//! A [`StreamPipeline`] is an ordered list of [`StreamProcessor`]s that
//! every increment of one exchange passes through. Processors share an
//! owned, resettable [`ExchangeState`] (accumulated content, completed
//! tool calls, warnings) instead of reaching for globals.
//!
//! The default order is:
//!
//! | # | Processor | Effect |
//! |---|-----------|--------|
//! | 1 | [`ContentAccumulator`] | concatenates content, reassembles tool calls |
//! | 2 | [`HistoryCapture`] | appends one assistant message on the terminal increment |
//! | 3 | [`UsageAccountant`] | estimates usage, fires batched callbacks |
//! | 4 | [`ResponseValidator`] | parses/repairs/validates structured output |
//!
//! # Wrapping a stream
//!
//! [`StreamPipeline::wrap`] turns a raw adapter stream into an enriched
//! one. Increments come out in the order they went in, one for one. The
//! wrapped stream always ends with exactly one terminal increment:
//!
//! - a transport error from the raw stream becomes a terminal increment
//!   with [`FinishReason::Error`] and the error message;
//! - a raw stream that ends without a terminal increment gets one
//!   synthesized the same way;
//! - an error returned by a processor is yielded as `Err` and ends the
//!   stream.

mod accumulator;
mod history;
mod usage;
mod validation;

pub use accumulator::ContentAccumulator;
pub use history::HistoryCapture;
pub use usage::{AccountingPhase, UsageAccountant, UsageCallback, UsageUpdate};
pub use validation::ResponseValidator;

use futures::StreamExt;

use crate::chat::{FinishReason, ToolCall};
use crate::error::LlmError;
use crate::stream::{ChatStream, StreamChunk};

/// One stage of a [`StreamPipeline`].
///
/// `process` receives every increment in arrival order and must return
/// it (possibly annotated). Returning `Err` aborts the stream.
pub trait StreamProcessor: Send {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Handles one increment.
    fn process(
        &mut self,
        chunk: StreamChunk,
        state: &mut ExchangeState,
    ) -> Result<StreamChunk, LlmError>;

    /// Clears per-exchange state. Called before each new stream.
    fn reset(&mut self) {}
}

/// State shared by the processors of one exchange.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExchangeState {
    /// Content accumulated so far.
    pub content: String,
    /// Reasoning accumulated so far.
    pub reasoning: String,
    /// Completed tool calls, in index order.
    pub tool_calls: Vec<ToolCall>,
    /// Tool calls still accumulating.
    pub pending_tool_calls: usize,
    /// Discarded tool-call warnings.
    pub warnings: Vec<String>,
    /// Finish reason of the terminal increment, once seen.
    pub finish_reason: FinishReason,
}

/// An ordered chain of processors.
#[derive(Default)]
pub struct StreamPipeline {
    processors: Vec<Box<dyn StreamProcessor>>,
    state: ExchangeState,
}

impl std::fmt::Debug for StreamPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.processors.iter().map(|p| p.name()).collect();
        f.debug_struct("StreamPipeline")
            .field("processors", &names)
            .field("state", &self.state)
            .finish()
    }
}

impl StreamPipeline {
    /// An empty pipeline (increments pass through untouched).
    pub fn new() -> Self {
        Self::default()
    }

    /// The default four-stage pipeline.
    pub fn standard(
        history: HistoryCapture,
        accountant: UsageAccountant,
        validator: ResponseValidator,
    ) -> Self {
        Self::new()
            .with(ContentAccumulator::new())
            .with(history)
            .with(accountant)
            .with(validator)
    }

    /// Appends a processor.
    #[must_use]
    pub fn with(mut self, processor: impl StreamProcessor + 'static) -> Self {
        self.processors.push(Box::new(processor));
        self
    }

    /// Appends a boxed processor.
    pub fn push(&mut self, processor: Box<dyn StreamProcessor>) {
        self.processors.push(processor);
    }

    /// Processor names, in order.
    pub fn processor_names(&self) -> Vec<&'static str> {
        self.processors.iter().map(|p| p.name()).collect()
    }

    /// Runs one increment through every processor.
    pub fn process(&mut self, chunk: StreamChunk) -> Result<StreamChunk, LlmError> {
        let mut chunk = chunk;
        for processor in &mut self.processors {
            chunk = processor.process(chunk, &mut self.state)?;
        }
        if chunk.is_complete {
            self.state.finish_reason = chunk.metadata.finish_reason;
        }
        Ok(chunk)
    }

    /// Clears the exchange state and every processor.
    pub fn reset(&mut self) {
        self.state = ExchangeState::default();
        for processor in &mut self.processors {
            processor.reset();
        }
    }

    /// State as of the most recently processed increment.
    pub fn state(&self) -> &ExchangeState {
        &self.state
    }

    /// Content accumulated so far.
    pub fn accumulated_content(&self) -> &str {
        &self.state.content
    }

    /// Tool calls completed so far.
    pub fn completed_tool_calls(&self) -> &[ToolCall] {
        &self.state.tool_calls
    }

    /// Resets the pipeline and applies it to `raw`.
    pub fn wrap(mut self, raw: ChatStream) -> ChatStream {
        self.reset();
        let stream = futures::stream::unfold(Some((self, raw)), |slot| async move {
            let (mut pipeline, mut raw) = slot?;
            let chunk = match raw.next().await {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "stream failed mid-exchange");
                    StreamChunk::failed(&e)
                }
                None => {
                    tracing::warn!("stream ended without a terminal increment");
                    let mut chunk = StreamChunk::finish(FinishReason::Error);
                    chunk.metadata.error = Some("stream ended without a terminal increment".into());
                    chunk
                }
            };
            match pipeline.process(chunk) {
                Ok(out) if out.is_complete => Some((Ok(out), None)),
                Ok(out) => Some((Ok(out), Some((pipeline, raw)))),
                Err(e) => Some((Err(e), None)),
            }
        });
        Box::pin(stream)
    }
}
