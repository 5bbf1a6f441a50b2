//! Streaming chunk dispatch.
//!
//! Each chunk runs as a small state machine (`Open → Streaming →
//! (Open → Streaming)* → Finishing → Done`) producing `ChunkEvent`s. The
//! per-chunk streams are then either flattened (sequential mode, yielding
//! live) or collected and released in chunk order (parallel mode).
//! A final pass commits each chunk's messages to the controller history
//! and fixes up `is_complete` so only the last increment of the whole
//! sequence is terminal.

use std::sync::Arc;

use futures::{Stream, StreamExt};

use super::ChunkController;
use super::controller::{continuation, open_stream};
use crate::chat::{ChatMessage, FinishReason};
use crate::error::LlmError;
use crate::history::{self, ConversationHistory, SharedHistory};
use crate::provider::ChatParams;
use crate::split::DataChunk;
use crate::stream::{ChatStream, ProcessInfo, StreamChunk};

/// Output of one chunk's state machine.
enum ChunkEvent {
    /// An increment (or a fatal error) to forward.
    Increment(Result<StreamChunk, LlmError>),
    /// The chunk finished; its messages are ready to commit.
    Finished(Vec<ChatMessage>),
}

enum Phase {
    Open,
    Streaming(ChatStream),
    Finishing,
    Done,
}

/// What follows a chunk's terminal increment.
enum AfterExchange {
    Resubmit,
    Finished,
}

/// Everything one chunk needs, apart from the live stream.
struct ChunkContext {
    controller: ChunkController,
    base: ChatParams,
    staged: SharedHistory,
    info: ProcessInfo,
}

impl ChunkContext {
    async fn open(&self) -> Result<ChatStream, LlmError> {
        let request = continuation(&self.base, &history::lock(&self.staged));
        open_stream(&self.controller, &request, Arc::clone(&self.staged)).await
    }

    /// Runs tools for a terminal increment and decides what comes next.
    async fn after_exchange(&self, terminal: &StreamChunk) -> Result<AfterExchange, LlmError> {
        if terminal.metadata.finish_reason == FinishReason::Error || terminal.tool_calls.is_empty()
        {
            return Ok(AfterExchange::Finished);
        }
        let round = self.controller.execute_tools(&terminal.tool_calls).await?;
        if !round.requires_resubmission {
            return Ok(AfterExchange::Finished);
        }
        tracing::debug!(
            chunk = self.info.current_chunk,
            calls = round.new_tool_calls,
            "resubmitting with tool results"
        );
        history::lock(&self.staged).extend(round.results.iter().map(ChatMessage::tool_result));
        Ok(AfterExchange::Resubmit)
    }
}

struct ChunkRun {
    ctx: ChunkContext,
    phase: Phase,
}

impl ChunkRun {
    fn into_stream(self) -> impl Stream<Item = ChunkEvent> + Send {
        futures::stream::unfold(self, |mut run| async move {
            loop {
                match std::mem::replace(&mut run.phase, Phase::Done) {
                    Phase::Done => return None,
                    Phase::Open => match run.ctx.open().await {
                        Ok(stream) => run.phase = Phase::Streaming(stream),
                        Err(e) => return Some((ChunkEvent::Increment(Err(e)), run)),
                    },
                    Phase::Finishing => {
                        let messages = history::lock(&run.ctx.staged).messages().to_vec();
                        return Some((ChunkEvent::Finished(messages), run));
                    }
                    Phase::Streaming(mut stream) => {
                        let mut chunk = match stream.next().await {
                            None => return None,
                            Some(Err(e)) => return Some((ChunkEvent::Increment(Err(e)), run)),
                            Some(Ok(chunk)) => chunk,
                        };
                        chunk.metadata.process_info = Some(run.ctx.info);
                        if !chunk.is_complete {
                            run.phase = Phase::Streaming(stream);
                            return Some((ChunkEvent::Increment(Ok(chunk)), run));
                        }
                        match run.ctx.after_exchange(&chunk).await {
                            Ok(AfterExchange::Resubmit) => {
                                chunk.is_complete = false;
                                run.phase = Phase::Open;
                            }
                            Ok(AfterExchange::Finished) => run.phase = Phase::Finishing,
                            Err(e) => return Some((ChunkEvent::Increment(Err(e)), run)),
                        }
                        return Some((ChunkEvent::Increment(Ok(chunk)), run));
                    }
                }
            }
        })
    }
}

impl ChunkController {
    /// Streams every chunk's increments as one ordered sequence.
    ///
    /// Increments carry `process_info` with their chunk position. Only the
    /// final increment of the whole sequence has `is_complete` set; the
    /// terminal increments of earlier chunks (and of tool rounds that are
    /// resubmitted) are passed on as incomplete.
    ///
    /// Sequential mode yields increments as they arrive. Parallel mode runs
    /// all chunks concurrently and releases each chunk's increments, in
    /// chunk order, once that chunk (including its tool rounds) is done.
    ///
    /// A stream failure arrives as a terminal increment with
    /// [`FinishReason::Error`] and ends the sequence. Control-flow errors
    /// (iteration limit, missing capability or orchestrator) are yielded as
    /// `Err` and also end it. Dropping the stream stops further dispatch.
    #[tracing::instrument(skip_all, fields(chunks = chunks.len(), parallel = self.config.parallel))]
    pub fn stream_chunks(&self, chunks: Vec<DataChunk>, params: &ChatParams) -> ChatStream {
        if let Err(e) = self.preflight(params) {
            return Box::pin(futures::stream::once(async move { Err(e) }));
        }
        let total = chunks.len();
        let base = self.base_params(params);
        let runs: Vec<_> = chunks
            .iter()
            .enumerate()
            .map(|(position, chunk)| {
                let mut staged = ConversationHistory::new();
                staged.push(ChatMessage::user(chunk.prompt()));
                ChunkRun {
                    ctx: ChunkContext {
                        controller: self.clone(),
                        base: base.clone(),
                        staged: history::shared(staged),
                        info: ProcessInfo {
                            current_chunk: position + 1,
                            total_chunks: total,
                        },
                    },
                    phase: Phase::Open,
                }
            })
            .collect();

        let events: std::pin::Pin<Box<dyn Stream<Item = ChunkEvent> + Send>> =
            if self.config.parallel {
                let limit = self.concurrency(total);
                Box::pin(
                    futures::stream::iter(runs)
                        .map(|run| run.into_stream().collect::<Vec<_>>())
                        .buffered(limit)
                        .flat_map(futures::stream::iter),
                )
            } else {
                Box::pin(futures::stream::iter(runs).flat_map(ChunkRun::into_stream))
            };

        let committed = self.history();
        let sequenced = events
            .scan(false, move |ended, event| {
                let item = if *ended {
                    None
                } else {
                    Some(match event {
                        ChunkEvent::Finished(messages) => {
                            history::lock(&committed).extend(messages);
                            None
                        }
                        ChunkEvent::Increment(Err(e)) => {
                            *ended = true;
                            Some(Err(e))
                        }
                        ChunkEvent::Increment(Ok(mut chunk)) => {
                            if chunk.is_complete {
                                let failed = chunk.metadata.finish_reason == FinishReason::Error;
                                let last = chunk
                                    .metadata
                                    .process_info
                                    .is_some_and(|p| p.current_chunk == p.total_chunks);
                                *ended = failed;
                                chunk.is_complete = failed || last;
                            }
                            Some(Ok(chunk))
                        }
                    })
                };
                futures::future::ready(item)
            })
            .filter_map(futures::future::ready);
        Box::pin(sequenced)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::chat::ChatRole;
    use crate::config::ChunkConfig;
    use crate::mock::{MockError, MockProvider};
    use crate::provider::{JsonSchema, ToolDefinition};
    use crate::stream::ToolCallDelta;
    use crate::test_helpers::{collect_stream, metadata_for};
    use crate::tool::{RegistryOrchestrator, ToolRegistry, tool_fn};

    fn chunks(n: usize) -> Vec<DataChunk> {
        (0..n).map(|i| DataChunk::new(i, format!("part {i}"), "")).collect()
    }

    fn text_stream(parts: &[&str]) -> Vec<StreamChunk> {
        let mut out: Vec<_> = parts.iter().map(|p| StreamChunk::text(*p)).collect();
        out.push(StreamChunk::finish(FinishReason::Stop));
        out
    }

    #[tokio::test]
    async fn test_only_last_increment_is_complete() {
        let mock = MockProvider::new(metadata_for("mock", "m1"));
        mock.queue_stream(text_stream(&["a", "b"]));
        mock.queue_stream(text_stream(&["c"]));
        let c = ChunkController::new(Arc::new(mock.clone()));

        let out = collect_stream(c.stream_chunks(chunks(2), &ChatParams::default())).await;
        let out: Vec<_> = out.into_iter().map(Result::unwrap).collect();
        assert_eq!(out.len(), 5);
        let complete: Vec<_> = out.iter().map(|c| c.is_complete).collect();
        assert_eq!(complete, [false, false, false, false, true]);
        let positions: Vec<_> = out
            .iter()
            .map(|c| c.metadata.process_info.unwrap().current_chunk)
            .collect();
        assert_eq!(positions, [1, 1, 1, 2, 2]);
        assert!(out.iter().all(|c| c.metadata.process_info.unwrap().total_chunks == 2));

        let history = history::lock(&c.history);
        let contents: Vec<_> = history.messages().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["part 0", "ab", "part 1", "c"]);
    }

    #[tokio::test]
    async fn test_stream_failure_ends_sequence() {
        let mock = MockProvider::new(metadata_for("mock", "m1"));
        mock.queue_stream_error(
            vec![StreamChunk::text("par")],
            MockError::Http {
                status: None,
                message: "connection reset".into(),
                retryable: false,
            },
        );
        mock.queue_stream(text_stream(&["never"]));
        let c = ChunkController::new(Arc::new(mock.clone()));

        let out = collect_stream(c.stream_chunks(chunks(2), &ChatParams::default())).await;
        assert_eq!(out.len(), 2);
        let last = out[1].as_ref().unwrap();
        assert!(last.is_complete);
        assert_eq!(last.metadata.finish_reason, FinishReason::Error);
        assert_eq!(mock.recorded_calls().len(), 1);
        assert!(history::lock(&c.history).is_empty());
    }

    #[tokio::test]
    async fn test_stream_iteration_limit_is_error() {
        let mock = MockProvider::new(metadata_for("mock", "m1"));
        mock.queue_stream(text_stream(&["a"]));
        mock.queue_stream(text_stream(&["b"]));
        let c = ChunkController::new(Arc::new(mock.clone())).with_config(ChunkConfig {
            max_iterations: 1,
            ..ChunkConfig::default()
        });

        let out = collect_stream(c.stream_chunks(chunks(2), &ChatParams::default())).await;
        assert!(matches!(out.last(), Some(Err(LlmError::ChunkIterationLimit(_)))));
        assert_eq!(mock.recorded_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_streamed_tool_round() {
        let mock = MockProvider::new(metadata_for("mock", "m1"));
        mock.queue_stream(vec![
            StreamChunk::deltas(vec![ToolCallDelta::start(0, "call_1", "lookup")]),
            StreamChunk::deltas(vec![ToolCallDelta::arguments(0, r#"{"key":"a"}"#)]),
            StreamChunk::finish(FinishReason::ToolCalls),
        ]);
        mock.queue_stream(text_stream(&["value-a it is"]));

        let mut registry = ToolRegistry::new();
        registry.register(tool_fn(
            ToolDefinition {
                name: "lookup".into(),
                description: String::new(),
                parameters: JsonSchema::new(json!({"type": "object"})),
            },
            |_| async { Ok("value-a") },
        ));
        let c = ChunkController::new(Arc::new(mock.clone()))
            .with_orchestrator(Arc::new(RegistryOrchestrator::new(registry)));

        let out = collect_stream(c.stream_chunks(chunks(1), &ChatParams::default())).await;
        let out: Vec<_> = out.into_iter().map(Result::unwrap).collect();
        assert_eq!(out.len(), 5);
        assert!(!out[2].is_complete);
        assert_eq!(out[2].tool_calls[0].arguments, json!({"key": "a"}));
        assert!(out[4].is_complete);
        assert_eq!(c.iteration_count(), 2);

        let second = &mock.recorded_calls()[1];
        assert_eq!(second.messages.last().unwrap().role, ChatRole::Tool);

        let roles: Vec<_> = history::lock(&c.history).messages().iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            [ChatRole::User, ChatRole::Assistant, ChatRole::Tool, ChatRole::Assistant]
        );
    }

    #[tokio::test]
    async fn test_empty_chunk_list_yields_nothing() {
        let mock = MockProvider::new(metadata_for("mock", "m1"));
        let c = ChunkController::new(Arc::new(mock));
        let out = collect_stream(c.stream_chunks(Vec::new(), &ChatParams::default())).await;
        assert!(out.is_empty());
    }
}
