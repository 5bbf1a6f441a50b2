use std::fmt;
use std::sync::Arc;

use futures::StreamExt;

use super::IterationCounter;
use crate::chat::{ChatMessage, ChatResponse, FinishReason, ToolCall};
use crate::config::ChunkConfig;
use crate::error::LlmError;
use crate::history::{self, ConversationHistory, SharedHistory};
use crate::pipeline::{
    HistoryCapture, ResponseValidator, StreamPipeline, UsageAccountant, UsageCallback,
};
use crate::provider::{Capability, ChatParams, DynProvider};
use crate::retry::{ContentRetryPolicy, RetryManager};
use crate::split::DataChunk;
use crate::stream::{ChatStream, StreamChunk};
use crate::tool::{ToolOrchestrator, ToolRound};
use crate::usage::{ModelPricing, UsageTracker, estimate_tokens};

/// Dispatches chunks to a provider and drives the tool resubmission loop.
///
/// One controller owns one conversation history and one iteration counter.
/// Clones share both, so a clone is the same controller, not a new one.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
///
/// use llm_conduit::chunk::ChunkController;
/// use llm_conduit::config::{ChunkConfig, SplitConfig};
/// use llm_conduit::split::{DataSplitter, TextSplitter};
/// use llm_conduit::{ChatParams, DynProvider};
///
/// # async fn example(provider: Arc<dyn DynProvider>, report: &str) -> Result<(), llm_conduit::LlmError> {
/// let controller = ChunkController::new(provider).with_config(ChunkConfig {
///     parallel: true,
///     ..ChunkConfig::default()
/// });
/// let chunks = TextSplitter::new(SplitConfig::default()).split(report, "Summarize this section");
/// let responses = controller.process_chunks(&chunks, &ChatParams::default()).await?;
/// for response in responses {
///     println!("{}", response.content);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ChunkController {
    pub(super) provider: Arc<dyn DynProvider>,
    pub(super) orchestrator: Option<Arc<dyn ToolOrchestrator>>,
    pub(super) config: ChunkConfig,
    pub(super) history: SharedHistory,
    pub(super) pricing: ModelPricing,
    pub(super) usage_callback: Option<(u64, UsageCallback)>,
    pub(super) counter: Arc<IterationCounter>,
    pub(super) retry: RetryManager,
    pub(super) content_policy: ContentRetryPolicy,
}

impl fmt::Debug for ChunkController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkController")
            .field("provider", &self.provider.metadata().name)
            .field("has_orchestrator", &self.orchestrator.is_some())
            .field("config", &self.config)
            .field("iterations", &self.counter.count())
            .finish_non_exhaustive()
    }
}

impl ChunkController {
    /// A controller over `provider` with default settings and an empty history.
    pub fn new(provider: Arc<dyn DynProvider>) -> Self {
        let config = ChunkConfig::default();
        Self {
            provider,
            orchestrator: None,
            counter: Arc::new(IterationCounter::new(config.max_iterations)),
            retry: RetryManager::new(config.retry.clone()),
            config,
            history: history::shared(ConversationHistory::new()),
            pricing: ModelPricing::default(),
            usage_callback: None,
            content_policy: ContentRetryPolicy::default(),
        }
    }

    /// Replaces the configuration. Resets the iteration counter.
    #[must_use]
    pub fn with_config(mut self, config: ChunkConfig) -> Self {
        self.counter = Arc::new(IterationCounter::new(config.max_iterations));
        self.retry = RetryManager::new(config.retry.clone());
        self.config = config;
        self
    }

    /// Executes tool calls between turns.
    #[must_use]
    pub fn with_orchestrator(mut self, orchestrator: Arc<dyn ToolOrchestrator>) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }

    /// Uses an existing conversation history.
    #[must_use]
    pub fn with_history(mut self, history: SharedHistory) -> Self {
        self.history = history;
        self
    }

    /// Prices usage with `pricing`.
    #[must_use]
    pub fn with_pricing(mut self, pricing: ModelPricing) -> Self {
        self.pricing = pricing;
        self
    }

    /// Reports usage every `batch_size` output tokens of each exchange.
    #[must_use]
    pub fn with_usage_callback(mut self, batch_size: u64, callback: UsageCallback) -> Self {
        self.usage_callback = Some((batch_size, callback));
        self
    }

    /// Replaces the refusal denylist.
    #[must_use]
    pub fn with_content_policy(mut self, policy: ContentRetryPolicy) -> Self {
        self.content_policy = policy;
        self
    }

    /// The active configuration.
    pub fn config(&self) -> &ChunkConfig {
        &self.config
    }

    /// The conversation history this controller writes to.
    pub fn history(&self) -> SharedHistory {
        Arc::clone(&self.history)
    }

    /// Dispatches issued since construction or the last reset.
    pub fn iteration_count(&self) -> u32 {
        self.counter.count()
    }

    /// Zeroes the dispatch counter, allowing a new logical session.
    pub fn reset_iteration_count(&self) {
        tracing::debug!(previous = self.counter.count(), "resetting iteration count");
        self.counter.reset();
    }

    /// Sends every chunk and returns one response per chunk, in chunk order.
    ///
    /// In parallel mode all chunks are in flight at once (up to
    /// `max_parallel`), but results and history writes still follow chunk
    /// order. The first error in chunk order is returned and stops any
    /// further dispatch.
    #[tracing::instrument(skip_all, fields(chunks = chunks.len(), parallel = self.config.parallel))]
    pub async fn process_chunks(
        &self,
        chunks: &[DataChunk],
        params: &ChatParams,
    ) -> Result<Vec<ChatResponse>, LlmError> {
        self.preflight(params)?;
        let base = self.base_params(params);
        let base = &base;

        let mut pending = futures::stream::iter(chunks)
            .map(|chunk| self.run_chunk(chunk, base))
            .buffered(self.concurrency(chunks.len()));

        let mut responses = Vec::with_capacity(chunks.len());
        while let Some(result) = pending.next().await {
            let (response, messages) = result?;
            history::lock(&self.history).extend(messages);
            responses.push(response);
        }
        Ok(responses)
    }

    pub(super) fn concurrency(&self, chunks: usize) -> usize {
        if self.config.parallel {
            self.config.max_parallel.unwrap_or(chunks).max(1)
        } else {
            1
        }
    }

    /// Fails fast when the request needs something the model lacks.
    pub(super) fn preflight(&self, params: &ChatParams) -> Result<(), LlmError> {
        let metadata = self.provider.metadata();
        let required = [
            (params.has_tools(), Capability::Tools),
            (params.structured_output.is_some(), Capability::StructuredOutput),
        ];
        for (needed, capability) in required {
            if needed && !metadata.supports(capability) {
                return Err(LlmError::Capability {
                    capability: capability.label().into(),
                    model: metadata.model,
                });
            }
        }
        Ok(())
    }

    /// Caller params plus the recorded conversation, shared by every chunk.
    pub(super) fn base_params(&self, params: &ChatParams) -> ChatParams {
        let history = history::lock(&self.history);
        let mut base = params.clone();
        if base.system.is_none() {
            base.system = history.system().map(str::to_owned);
        }
        base.messages.extend(history.messages().iter().cloned());
        base
    }

    pub(super) fn reserve(&self) -> Result<u32, LlmError> {
        self.counter.reserve().map_err(|e| {
            tracing::warn!(max_iterations = e.max_iterations, "chunk iteration limit reached");
            LlmError::from(e)
        })
    }

    /// The standard pipeline for one exchange of `request`.
    pub(super) fn pipeline(&self, request: &ChatParams, capture: SharedHistory) -> StreamPipeline {
        let mut accountant =
            UsageAccountant::new(self.pricing).with_input_tokens(prompt_tokens(request), 0);
        if let Some((batch_size, callback)) = &self.usage_callback {
            accountant = accountant.with_callback(*batch_size, Arc::clone(callback));
        }
        StreamPipeline::standard(
            HistoryCapture::new(capture),
            accountant,
            ResponseValidator::new(request.structured_output.clone()),
        )
    }

    /// Runs the tool calls of a finished exchange.
    pub(super) async fn execute_tools(
        &self,
        calls: &[ToolCall],
    ) -> Result<ToolRound, LlmError> {
        let Some(orchestrator) = &self.orchestrator else {
            return Err(LlmError::MissingCollaborator(format!(
                "tool orchestrator required to continue after {} tool call(s)",
                calls.len()
            )));
        };
        orchestrator.execute(calls).await
    }

    /// One chunk on the chat path: dispatch, content retry, tool loop.
    ///
    /// Returns the final response (usage summed over every dispatch) and
    /// the messages to commit to history.
    async fn run_chunk(
        &self,
        chunk: &DataChunk,
        base: &ChatParams,
    ) -> Result<(ChatResponse, Vec<ChatMessage>), LlmError> {
        tracing::debug!(chunk = chunk.index, tokens = chunk.token_estimate, "dispatching chunk");
        let mut staged = ConversationHistory::new();
        staged.push(ChatMessage::user(chunk.prompt()));
        let mut usage = UsageTracker::new();
        let mut refusals = 0;

        loop {
            let request = continuation(base, &staged);
            let (mut response, captured) = self.exchange(&request).await?;
            usage.record(response.usage);

            let content_retry = &self.config.content_retry;
            if content_retry.enabled
                && response.tool_calls.is_empty()
                && refusals < content_retry.max_attempts
                && self
                    .content_policy
                    .should_retry(&response.content, content_retry.threshold)
            {
                refusals += 1;
                tracing::info!(chunk = chunk.index, attempt = refusals, "retrying refused response");
                continue;
            }
            staged.extend(captured);

            if response.wants_tools() {
                let round = self.execute_tools(&response.tool_calls).await?;
                if round.requires_resubmission {
                    tracing::debug!(chunk = chunk.index, calls = round.new_tool_calls, "resubmitting with tool results");
                    staged.extend(round.results.iter().map(ChatMessage::tool_result));
                    continue;
                }
            }

            tracing::debug!(chunk = chunk.index, dispatches = usage.call_count(), "chunk finished");
            response.usage = *usage.total();
            return Ok((response, staged.into_messages()));
        }
    }

    /// One chat dispatch passed through the pipeline.
    async fn exchange(
        &self,
        request: &ChatParams,
    ) -> Result<(ChatResponse, Vec<ChatMessage>), LlmError> {
        self.reserve()?;
        let raw = self
            .retry
            .run(|_| self.provider.generate_boxed(request))
            .await?;

        let capture = history::shared(ConversationHistory::new());
        let mut pipeline = self.pipeline(request, Arc::clone(&capture));
        let terminal = pipeline.process(terminal_increment(&raw))?;
        let state = pipeline.state();

        let response = ChatResponse {
            content: state.content.clone(),
            tool_calls: state.tool_calls.clone(),
            reasoning: raw.reasoning,
            finish_reason: terminal.metadata.finish_reason,
            usage: terminal.metadata.usage.unwrap_or_default(),
            model: raw.model,
            validation_errors: terminal.metadata.validation_errors,
            parsed: terminal.metadata.parsed,
            metadata: raw.metadata,
        };
        let captured = history::lock(&capture).messages().to_vec();
        Ok((response, captured))
    }
}

/// Presents a complete chat response as the single terminal increment of
/// an exchange, so it goes through the same processors as a stream.
fn terminal_increment(response: &ChatResponse) -> StreamChunk {
    let reason = match response.finish_reason {
        FinishReason::None => FinishReason::Stop,
        other => other,
    };
    let mut chunk = StreamChunk::finish(reason);
    chunk.content.clone_from(&response.content);
    chunk.tool_calls.clone_from(&response.tool_calls);
    chunk.reasoning.clone_from(&response.reasoning);
    if !response.usage.tokens.is_zero() {
        chunk.metadata.usage = Some(response.usage);
    }
    if !response.model.is_empty() {
        chunk.metadata.model = Some(response.model.clone());
    }
    chunk
}

/// `base` followed by everything staged for the current chunk.
pub(super) fn continuation(base: &ChatParams, staged: &ConversationHistory) -> ChatParams {
    let mut request = base.clone();
    request.messages.extend(staged.messages().iter().cloned());
    request
}

/// Estimated prompt size of `request`.
pub(super) fn prompt_tokens(request: &ChatParams) -> u64 {
    let system = request.system.as_deref().map_or(0, estimate_tokens);
    request
        .messages
        .iter()
        .map(|m| estimate_tokens(&m.content))
        .sum::<u64>()
        + system
}

/// Opens one stream dispatch and wraps it in the pipeline.
///
/// Failing to open after transport retries is reported as a failed
/// terminal increment, like a mid-stream failure.
pub(super) async fn open_stream(
    controller: &ChunkController,
    request: &ChatParams,
    capture: SharedHistory,
) -> Result<ChatStream, LlmError> {
    controller.reserve()?;
    let opened = controller
        .retry
        .run(|_| controller.provider.stream_boxed(request))
        .await;
    match opened {
        Ok(raw) => Ok(controller.pipeline(request, capture).wrap(raw)),
        Err(e) => {
            tracing::warn!(error = %e, "could not open stream");
            let failed = StreamChunk::failed(&e);
            Ok(Box::pin(futures::stream::once(async move { Ok(failed) })))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;
    use crate::chat::ChatRole;
    use crate::mock::MockProvider;
    use crate::provider::{JsonSchema, ToolDefinition};
    use crate::test_helpers::{metadata_for, sample_response};
    use crate::tool::{RegistryOrchestrator, ToolRegistry, tool_fn};
    use crate::usage::{TokenUsage, Usage};

    fn chunks(n: usize) -> Vec<DataChunk> {
        (0..n)
            .map(|i| DataChunk::new(i, format!("part {i}"), "Summarize"))
            .collect()
    }

    fn controller(mock: &MockProvider) -> ChunkController {
        ChunkController::new(Arc::new(mock.clone()))
    }

    fn tool_call_response(id: &str) -> ChatResponse {
        ChatResponse {
            tool_calls: vec![ToolCall {
                id: id.into(),
                name: "lookup".into(),
                arguments: json!({"key": "a"}),
            }],
            finish_reason: FinishReason::ToolCalls,
            ..ChatResponse::default()
        }
    }

    fn lookup_orchestrator() -> Arc<dyn ToolOrchestrator> {
        let mut registry = ToolRegistry::new();
        registry.register(tool_fn(
            ToolDefinition {
                name: "lookup".into(),
                description: "Look up a key".into(),
                parameters: JsonSchema::new(json!({"type": "object"})),
            },
            |_| async { Ok("value-a") },
        ));
        Arc::new(RegistryOrchestrator::new(registry))
    }

    #[tokio::test]
    async fn test_sequential_responses_and_history() {
        let mock = MockProvider::new(metadata_for("mock", "m1"));
        mock.queue_response(sample_response("first"));
        mock.queue_response(sample_response("second"));
        let c = controller(&mock);

        let responses = c.process_chunks(&chunks(2), &ChatParams::default()).await.unwrap();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].content, "first");
        assert_eq!(responses[1].content, "second");
        assert_eq!(c.iteration_count(), 2);

        let history = history::lock(&c.history);
        let roles: Vec<_> = history.messages().iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            [ChatRole::User, ChatRole::Assistant, ChatRole::User, ChatRole::Assistant]
        );
        assert_eq!(history.messages()[0].content, "Summarize\n\npart 0");
    }

    #[tokio::test]
    async fn test_request_includes_system_and_history() {
        let mock = MockProvider::new(metadata_for("mock", "m1"));
        mock.queue_response(sample_response("ok"));
        let c = controller(&mock).with_history(history::shared(ConversationHistory::with_system(
            "You are terse.",
        )));
        history::lock(&c.history).push(ChatMessage::user("earlier"));

        let params = ChatParams {
            messages: vec![ChatMessage::user("context")],
            ..ChatParams::default()
        };
        c.process_chunks(&chunks(1), &params).await.unwrap();

        let calls = mock.recorded_calls();
        assert_eq!(calls[0].system.as_deref(), Some("You are terse."));
        let contents: Vec<_> = calls[0].messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["context", "earlier", "Summarize\n\npart 0"]);
    }

    #[tokio::test]
    async fn test_capability_preflight() {
        let mut metadata = metadata_for("mock", "plain");
        metadata.capabilities.remove(&Capability::Tools);
        let mock = MockProvider::new(metadata);
        let c = controller(&mock);
        let params = ChatParams {
            tools: Some(vec![ToolDefinition {
                name: "lookup".into(),
                description: String::new(),
                parameters: JsonSchema::new(json!({"type": "object"})),
            }]),
            ..ChatParams::default()
        };
        let err = c.process_chunks(&chunks(1), &params).await.unwrap_err();
        assert!(matches!(err, LlmError::Capability { ref capability, .. } if capability == "tool calling"));
        assert!(mock.recorded_calls().is_empty());
        assert_eq!(c.iteration_count(), 0);
    }

    #[tokio::test]
    async fn test_iteration_ceiling_and_reset() {
        let mock = MockProvider::new(metadata_for("mock", "m1"));
        for _ in 0..4 {
            mock.queue_response(sample_response("ok"));
        }
        let c = controller(&mock).with_config(ChunkConfig {
            max_iterations: 2,
            ..ChunkConfig::default()
        });

        let err = c.process_chunks(&chunks(3), &ChatParams::default()).await.unwrap_err();
        let LlmError::ChunkIterationLimit(limit) = err else {
            panic!("expected iteration limit, got {err:?}");
        };
        assert_eq!(limit.max_iterations, 2);
        assert_eq!(mock.recorded_calls().len(), 2);

        c.reset_iteration_count();
        assert_eq!(c.iteration_count(), 0);
        assert!(c.process_chunks(&chunks(1), &ChatParams::default()).await.is_ok());
    }

    #[tokio::test]
    async fn test_content_retry_on_refusal() {
        let mock = MockProvider::new(metadata_for("mock", "m1"));
        mock.queue_response(sample_response("I'm sorry, I cannot help with that."));
        mock.queue_response(sample_response("Here you go."));
        let c = controller(&mock);

        let responses = c.process_chunks(&chunks(1), &ChatParams::default()).await.unwrap();
        assert_eq!(responses[0].content, "Here you go.");
        assert_eq!(c.iteration_count(), 2);
        // The refused answer is not kept.
        let history = history::lock(&c.history);
        assert_eq!(history.len(), 2);
        assert_eq!(history.messages()[1].content, "Here you go.");
    }

    #[tokio::test]
    async fn test_content_retry_gives_up_after_max_attempts() {
        let mock = MockProvider::new(metadata_for("mock", "m1"));
        for _ in 0..3 {
            mock.queue_response(sample_response("As an AI, I cannot."));
        }
        let c = controller(&mock);
        let responses = c.process_chunks(&chunks(1), &ChatParams::default()).await.unwrap();
        assert_eq!(responses[0].content, "As an AI, I cannot.");
        assert_eq!(mock.recorded_calls().len(), 3);
    }

    #[tokio::test]
    async fn test_tool_loop_resubmits_with_results() {
        let mock = MockProvider::new(metadata_for("mock", "m1"));
        mock.queue_response(tool_call_response("call_1"));
        mock.queue_response(sample_response("The value is value-a."));
        let c = controller(&mock).with_orchestrator(lookup_orchestrator());

        let responses = c.process_chunks(&chunks(1), &ChatParams::default()).await.unwrap();
        assert_eq!(responses[0].content, "The value is value-a.");
        assert_eq!(c.iteration_count(), 2);

        let calls = mock.recorded_calls();
        let last = calls[1].messages.last().unwrap();
        assert_eq!(last.role, ChatRole::Tool);
        assert_eq!(last.tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(last.content, "value-a");

        let roles: Vec<_> = history::lock(&c.history).messages().iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            [ChatRole::User, ChatRole::Assistant, ChatRole::Tool, ChatRole::Assistant]
        );
    }

    #[tokio::test]
    async fn test_tool_calls_without_orchestrator() {
        let mock = MockProvider::new(metadata_for("mock", "m1"));
        mock.queue_response(tool_call_response("call_1"));
        let err = controller(&mock)
            .process_chunks(&chunks(1), &ChatParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::MissingCollaborator(_)));
    }

    #[tokio::test]
    async fn test_usage_summed_over_tool_loop() {
        let mock = MockProvider::new(metadata_for("mock", "m1"));
        let mut first = tool_call_response("call_1");
        first.usage = Usage::from_tokens(TokenUsage::from_counts(10, 5));
        let mut second = sample_response("done");
        second.usage = Usage::from_tokens(TokenUsage::from_counts(20, 3));
        mock.queue_response(first);
        mock.queue_response(second);

        let c = controller(&mock)
            .with_orchestrator(lookup_orchestrator())
            .with_pricing(ModelPricing::new(1.0, 2.0));
        let responses = c.process_chunks(&chunks(1), &ChatParams::default()).await.unwrap();
        let tokens = responses[0].usage.tokens;
        assert_eq!(tokens.input.total, 30);
        assert_eq!(tokens.output.total, 8);
        assert!(responses[0].usage.costs.total > 0.0);
    }

    #[tokio::test]
    async fn test_structured_output_validated() {
        let mock = MockProvider::new(metadata_for("mock", "m1"));
        mock.queue_response(sample_response("```json\n{\"score\": 7}\n```"));
        let c = controller(&mock);
        let params = ChatParams {
            structured_output: Some(JsonSchema::new(json!({
                "type": "object",
                "properties": {"score": {"type": "integer"}},
                "required": ["score"]
            }))),
            ..ChatParams::default()
        };
        let responses = c.process_chunks(&chunks(1), &params).await.unwrap();
        assert_eq!(responses[0].parsed, Some(json!({"score": 7})));
        assert_eq!(responses[0].finish_reason, FinishReason::Stop);
    }

    #[tokio::test]
    async fn test_usage_callback_fires_per_exchange() {
        let mock = MockProvider::new(metadata_for("mock", "m1"));
        mock.queue_response(sample_response("ok"));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let c = controller(&mock).with_usage_callback(
            1,
            Arc::new(move |u: &crate::pipeline::UsageUpdate| {
                sink.lock().unwrap().push(u.incremental);
            }),
        );
        c.process_chunks(&chunks(1), &ChatParams::default()).await.unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_prompt_tokens() {
        let params = ChatParams {
            system: Some("abcd".into()),
            messages: vec![ChatMessage::user("abcdefgh")],
            ..ChatParams::default()
        };
        assert_eq!(prompt_tokens(&params), 3);
    }
}
