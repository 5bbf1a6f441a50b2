//! Token usage and cost vocabulary.
//!
//! Every response carries a [`Usage`] record: nested token counts
//! ([`TokenUsage`]) and a mirrored [`CostBreakdown`] derived from a
//! [`ModelPricing`] table. Costs are plain USD `f64`s computed from
//! per-million rates; they are derived and never authoritative.
//!
//! # Invariant
//!
//! `TokenUsage::total == input.total + output.total`. Sub-counts
//! (cached input, reasoning output, image tokens) are already included in
//! the bucket totals; they only change which rate a portion is priced at.
//! [`TokenUsage::new`] and every arithmetic operation recompute the total.

use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};

/// Prompt-side token counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InputTokens {
    /// All prompt tokens, including cached and image tokens.
    pub total: u64,
    /// Tokens served from the provider's prompt cache.
    #[serde(default)]
    pub cached: u64,
    /// Tokens attributed to image inputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<u64>,
}

/// Completion-side token counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OutputTokens {
    /// All generated tokens, including reasoning and image tokens.
    pub total: u64,
    /// Tokens spent on chain-of-thought reasoning.
    #[serde(default)]
    pub reasoning: u64,
    /// Tokens attributed to image outputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<u64>,
}

/// Token counts for one request/response pair, or an aggregate of several.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Prompt-side counts.
    pub input: InputTokens,
    /// Completion-side counts.
    pub output: OutputTokens,
    /// `input.total + output.total`.
    pub total: u64,
}

impl TokenUsage {
    /// Builds a usage record, computing `total`.
    pub fn new(input: InputTokens, output: OutputTokens) -> Self {
        Self {
            input,
            output,
            total: input.total.saturating_add(output.total),
        }
    }

    /// Shorthand for plain text usage with no sub-counts.
    ///
    /// ```rust
    /// use llm_conduit::usage::TokenUsage;
    ///
    /// let u = TokenUsage::from_counts(10, 5);
    /// assert_eq!(u.total, 15);
    /// ```
    pub fn from_counts(input: u64, output: u64) -> Self {
        Self::new(
            InputTokens {
                total: input,
                ..InputTokens::default()
            },
            OutputTokens {
                total: output,
                ..OutputTokens::default()
            },
        )
    }

    /// Returns `true` when nothing was counted.
    pub fn is_zero(&self) -> bool {
        self.total == 0 && self.input.cached == 0 && self.output.reasoning == 0
    }
}

fn add_optional(a: Option<u64>, b: Option<u64>) -> Option<u64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.saturating_add(y)),
        (Some(x), None) | (None, Some(x)) => Some(x),
        (None, None) => None,
    }
}

impl AddAssign<&TokenUsage> for TokenUsage {
    fn add_assign(&mut self, rhs: &Self) {
        self.input.total = self.input.total.saturating_add(rhs.input.total);
        self.input.cached = self.input.cached.saturating_add(rhs.input.cached);
        self.input.image = add_optional(self.input.image, rhs.input.image);
        self.output.total = self.output.total.saturating_add(rhs.output.total);
        self.output.reasoning = self.output.reasoning.saturating_add(rhs.output.reasoning);
        self.output.image = add_optional(self.output.image, rhs.output.image);
        self.total = self.input.total.saturating_add(self.output.total);
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        *self += &rhs;
    }
}

impl Add for TokenUsage {
    type Output = Self;

    fn add(mut self, rhs: Self) -> Self {
        self += &rhs;
        self
    }
}

/// Prompt-side costs in USD, mirroring [`InputTokens`].
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct InputCosts {
    /// Cost of all prompt tokens.
    pub total: f64,
    /// Portion of `total` charged at the cached rate.
    #[serde(default)]
    pub cached: f64,
    /// Portion of `total` charged at the image rate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<f64>,
}

/// Completion-side costs in USD, mirroring [`OutputTokens`].
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct OutputCosts {
    /// Cost of all generated tokens.
    pub total: f64,
    /// Portion of `total` charged at the reasoning rate.
    #[serde(default)]
    pub reasoning: f64,
    /// Portion of `total` charged at the image rate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<f64>,
}

/// Monetary cost in USD, mirroring [`TokenUsage`].
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CostBreakdown {
    /// Prompt-side costs.
    pub input: InputCosts,
    /// Completion-side costs.
    pub output: OutputCosts,
    /// `input.total + output.total`.
    pub total: f64,
}

impl AddAssign<&CostBreakdown> for CostBreakdown {
    fn add_assign(&mut self, rhs: &Self) {
        fn add_opt(a: Option<f64>, b: Option<f64>) -> Option<f64> {
            match (a, b) {
                (Some(x), Some(y)) => Some(x + y),
                (Some(x), None) | (None, Some(x)) => Some(x),
                (None, None) => None,
            }
        }
        self.input.total += rhs.input.total;
        self.input.cached += rhs.input.cached;
        self.input.image = add_opt(self.input.image, rhs.input.image);
        self.output.total += rhs.output.total;
        self.output.reasoning += rhs.output.reasoning;
        self.output.image = add_opt(self.output.image, rhs.output.image);
        self.total = self.input.total + self.output.total;
    }
}

/// Token counts plus the costs derived from them.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Usage {
    /// Token counts.
    pub tokens: TokenUsage,
    /// Derived costs (zero until priced).
    pub costs: CostBreakdown,
}

impl Usage {
    /// Usage with counts only; costs stay zero.
    pub fn from_tokens(tokens: TokenUsage) -> Self {
        Self {
            tokens,
            costs: CostBreakdown::default(),
        }
    }

    /// Prices `tokens` with the given table.
    pub fn priced(tokens: TokenUsage, pricing: &ModelPricing) -> Self {
        Self {
            tokens,
            costs: pricing.compute_cost(&tokens),
        }
    }
}

impl AddAssign<&Usage> for Usage {
    fn add_assign(&mut self, rhs: &Self) {
        self.tokens += &rhs.tokens;
        self.costs += &rhs.costs;
    }
}

impl AddAssign for Usage {
    fn add_assign(&mut self, rhs: Self) {
        *self += &rhs;
    }
}

/// Per-model pricing in **USD per million tokens**.
///
/// Optional rates fall back to the base text rate of the same side
/// (cached and image input to `input_per_million`; reasoning and image
/// output to `output_per_million`).
///
/// ```rust
/// use llm_conduit::usage::{ModelPricing, TokenUsage};
///
/// let pricing = ModelPricing::new(3.0, 15.0);
/// let cost = pricing.compute_cost(&TokenUsage::from_counts(1_000_000, 100_000));
/// assert!((cost.total - 4.5).abs() < 1e-9);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelPricing {
    /// Base prompt rate.
    pub input_per_million: f64,
    /// Rate for cache hits.
    pub cached_input_per_million: Option<f64>,
    /// Base completion rate.
    pub output_per_million: f64,
    /// Rate for reasoning tokens.
    pub reasoning_per_million: Option<f64>,
    /// Rate for image input tokens.
    pub image_input_per_million: Option<f64>,
    /// Rate for image output tokens.
    pub image_output_per_million: Option<f64>,
}

#[allow(clippy::cast_precision_loss)] // token counts fit the f64 mantissa
fn bucket_cost(tokens: u64, per_million: f64) -> f64 {
    tokens as f64 * (per_million / 1_000_000.0)
}

impl ModelPricing {
    /// Text-only pricing.
    pub fn new(input_per_million: f64, output_per_million: f64) -> Self {
        Self {
            input_per_million,
            output_per_million,
            ..Self::default()
        }
    }

    /// Computes the cost of every bucket present in `tokens`.
    pub fn compute_cost(&self, tokens: &TokenUsage) -> CostBreakdown {
        let cached_rate = self.cached_input_per_million.unwrap_or(self.input_per_million);
        let image_in_rate = self.image_input_per_million.unwrap_or(self.input_per_million);
        let reasoning_rate = self.reasoning_per_million.unwrap_or(self.output_per_million);
        let image_out_rate = self.image_output_per_million.unwrap_or(self.output_per_million);

        let input = &tokens.input;
        let image_in = input.image.unwrap_or(0);
        let base_in = input
            .total
            .saturating_sub(input.cached)
            .saturating_sub(image_in);
        let cached_cost = bucket_cost(input.cached, cached_rate);
        let image_in_cost = input.image.map(|n| bucket_cost(n, image_in_rate));
        let input_total =
            bucket_cost(base_in, self.input_per_million) + cached_cost + image_in_cost.unwrap_or(0.0);

        let output = &tokens.output;
        let image_out = output.image.unwrap_or(0);
        let base_out = output
            .total
            .saturating_sub(output.reasoning)
            .saturating_sub(image_out);
        let reasoning_cost = bucket_cost(output.reasoning, reasoning_rate);
        let image_out_cost = output.image.map(|n| bucket_cost(n, image_out_rate));
        let output_total = bucket_cost(base_out, self.output_per_million)
            + reasoning_cost
            + image_out_cost.unwrap_or(0.0);

        CostBreakdown {
            input: InputCosts {
                total: input_total,
                cached: cached_cost,
                image: image_in_cost,
            },
            output: OutputCosts {
                total: output_total,
                reasoning: reasoning_cost,
                image: image_out_cost,
            },
            total: input_total + output_total,
        }
    }
}

/// Accumulates usage across multiple calls.
///
/// ```rust
/// use llm_conduit::usage::{TokenUsage, Usage, UsageTracker};
///
/// let mut tracker = UsageTracker::new();
/// tracker.record(Usage::from_tokens(TokenUsage::from_counts(100, 20)));
/// tracker.record(Usage::from_tokens(TokenUsage::from_counts(50, 10)));
/// assert_eq!(tracker.total().tokens.total, 180);
/// assert_eq!(tracker.call_count(), 2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct UsageTracker {
    total: Usage,
    by_call: Vec<Usage>,
}

impl UsageTracker {
    /// An empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one call's usage to the running total.
    pub fn record(&mut self, usage: Usage) {
        self.total += &usage;
        self.by_call.push(usage);
    }

    /// Accumulated usage across all recorded calls.
    pub fn total(&self) -> &Usage {
        &self.total
    }

    /// Per-call usage, in record order.
    pub fn calls(&self) -> &[Usage] {
        &self.by_call
    }

    /// Number of recorded calls.
    pub fn call_count(&self) -> usize {
        self.by_call.len()
    }

    /// Clears all recorded usage.
    pub fn reset(&mut self) {
        self.total = Usage::default();
        self.by_call.clear();
    }
}

/// Estimates the token count of `text` at roughly 4 characters per token.
///
/// Returns 0 for empty text and at least 1 otherwise.
pub fn estimate_tokens(text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }
    let chars = text.chars().count() as u64;
    chars.div_ceil(4).max(1)
}
