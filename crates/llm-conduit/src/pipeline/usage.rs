use std::fmt;
use std::sync::Arc;

use crate::error::LlmError;
use crate::stream::StreamChunk;
use crate::usage::{InputTokens, ModelPricing, OutputTokens, TokenUsage, Usage, estimate_tokens};

use super::{ExchangeState, StreamProcessor};

/// Whether the accountant has reported anything yet this exchange.
///
/// Input tokens (and their cost) are reported only while `First`; every
/// later report carries output contributions alone, so input is never
/// counted twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccountingPhase {
    /// Nothing reported yet.
    #[default]
    First,
    /// At least one report has been made.
    Continuation,
}

/// Payload handed to a [`UsageCallback`].
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct UsageUpdate {
    /// Usage since the previous callback.
    pub incremental: Usage,
    /// Usage since the start of the exchange.
    pub cumulative: Usage,
}

/// Receives batched usage updates.
pub type UsageCallback = Arc<dyn Fn(&UsageUpdate) + Send + Sync>;

/// Estimates token usage and cost as content streams in.
///
/// Output tokens are estimated from the accumulated content (and any
/// reasoning the provider reports), and never drop below what the
/// provider itself reports. When a callback is registered with a positive
/// batch size it fires whenever the unreported output reaches the batch
/// size, and once more on the terminal increment if anything is left.
///
/// The terminal increment's `metadata.usage` is the cumulative total.
/// Non-terminal increments that triggered a callback carry the
/// incremental usage of that callback.
pub struct UsageAccountant {
    pricing: ModelPricing,
    configured_input: InputTokens,
    input: InputTokens,
    batch_size: Option<u64>,
    callback: Option<UsageCallback>,
    phase: AccountingPhase,
    output_estimate: u64,
    reasoning: u64,
    output_image: Option<u64>,
    reported_output: u64,
    reported_reasoning: u64,
    reported_output_image: u64,
    cumulative: Usage,
}

impl fmt::Debug for UsageAccountant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsageAccountant")
            .field("pricing", &self.pricing)
            .field("input", &self.input)
            .field("batch_size", &self.batch_size)
            .field("has_callback", &self.callback.is_some())
            .field("phase", &self.phase)
            .field("output_estimate", &self.output_estimate)
            .field("cumulative", &self.cumulative)
            .finish()
    }
}

impl Default for UsageAccountant {
    fn default() -> Self {
        Self::new(ModelPricing::default())
    }
}

impl UsageAccountant {
    /// An accountant pricing with `pricing` and no callback.
    pub fn new(pricing: ModelPricing) -> Self {
        Self {
            pricing,
            configured_input: InputTokens::default(),
            input: InputTokens::default(),
            batch_size: None,
            callback: None,
            phase: AccountingPhase::First,
            output_estimate: 0,
            reasoning: 0,
            output_image: None,
            reported_output: 0,
            reported_reasoning: 0,
            reported_output_image: 0,
            cumulative: Usage::default(),
        }
    }

    /// Sets the prompt size known before the exchange starts.
    ///
    /// A provider-reported input count replaces it as long as nothing has
    /// been reported yet.
    #[must_use]
    pub fn with_input(mut self, input: InputTokens) -> Self {
        self.configured_input = input;
        self.input = input;
        self
    }

    /// Shorthand for [`with_input`](Self::with_input) with plain and cached counts.
    #[must_use]
    pub fn with_input_tokens(self, total: u64, cached: u64) -> Self {
        self.with_input(InputTokens {
            total,
            cached,
            image: None,
        })
    }

    /// Registers a callback fired every `batch_size` output tokens.
    ///
    /// A zero batch size leaves callbacks disabled.
    #[must_use]
    pub fn with_callback(mut self, batch_size: u64, callback: UsageCallback) -> Self {
        self.batch_size = Some(batch_size);
        self.callback = Some(callback);
        self
    }

    /// Current reporting phase.
    pub fn phase(&self) -> AccountingPhase {
        self.phase
    }

    /// Everything reported so far.
    pub fn cumulative(&self) -> Usage {
        self.cumulative
    }

    fn callbacks_enabled(&self) -> bool {
        self.callback.is_some() && self.batch_size.is_some_and(|b| b > 0)
    }

    /// Folds in a provider-reported usage record.
    fn observe(&mut self, reported: &TokenUsage) {
        if self.phase == AccountingPhase::First && reported.input.total > 0 {
            self.input = reported.input;
        }
        // Providers report reasoning as a running total.
        if reported.output.reasoning > 0 {
            self.reasoning = reported.output.reasoning;
        }
        if reported.output.image.is_some() {
            self.output_image = reported.output.image;
        }
        self.output_estimate = self.output_estimate.max(reported.output.total);
    }

    fn unreported(&self) -> bool {
        self.output_estimate > self.reported_output
            || self.reasoning > self.reported_reasoning
            || self.output_image.unwrap_or(0) > self.reported_output_image
    }

    fn settle(&mut self) -> UsageUpdate {
        let input = match self.phase {
            AccountingPhase::First => self.input,
            AccountingPhase::Continuation => InputTokens::default(),
        };
        let output = OutputTokens {
            total: self.output_estimate.saturating_sub(self.reported_output),
            reasoning: self.reasoning.saturating_sub(self.reported_reasoning),
            image: self
                .output_image
                .map(|n| n.saturating_sub(self.reported_output_image)),
        };
        let incremental = Usage::priced(TokenUsage::new(input, output), &self.pricing);
        self.cumulative += &incremental;
        self.reported_output = self.output_estimate;
        self.reported_reasoning = self.reasoning;
        self.reported_output_image = self.output_image.unwrap_or(0);
        self.phase = AccountingPhase::Continuation;
        UsageUpdate {
            incremental,
            cumulative: self.cumulative,
        }
    }

    fn notify(&self, update: &UsageUpdate) {
        if let Some(callback) = &self.callback {
            callback(update);
        }
    }
}

impl StreamProcessor for UsageAccountant {
    fn name(&self) -> &'static str {
        "usage_accountant"
    }

    fn process(
        &mut self,
        mut chunk: StreamChunk,
        state: &mut ExchangeState,
    ) -> Result<StreamChunk, LlmError> {
        if let Some(reported) = chunk.metadata.usage.take() {
            self.observe(&reported.tokens);
        }
        let estimate = estimate_tokens(&state.content).saturating_add(self.reasoning);
        self.output_estimate = self.output_estimate.max(estimate);

        let enabled = self.callbacks_enabled();
        if chunk.is_complete {
            if self.phase == AccountingPhase::First || self.unreported() {
                let update = self.settle();
                if enabled {
                    self.notify(&update);
                }
            }
            chunk.metadata.usage = Some(self.cumulative);
        } else if enabled {
            let pending = self.output_estimate.saturating_sub(self.reported_output);
            if self.batch_size.is_some_and(|b| pending >= b) {
                let update = self.settle();
                tracing::debug!(output = update.incremental.tokens.output.total, "usage batch reported");
                self.notify(&update);
                chunk.metadata.usage = Some(update.incremental);
            }
        }
        Ok(chunk)
    }

    fn reset(&mut self) {
        self.input = self.configured_input;
        self.phase = AccountingPhase::First;
        self.output_estimate = 0;
        self.reasoning = 0;
        self.output_image = None;
        self.reported_output = 0;
        self.reported_reasoning = 0;
        self.reported_output_image = 0;
        self.cumulative = Usage::default();
    }
}
