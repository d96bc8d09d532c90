//! Token usage normalization and per-turn accumulation.
//!
//! Each adapter reports a provider-shaped [`Usage`]; [`TokenUsage`] is the
//! normalized prompt/completion view the accumulator works with, so nothing
//! downstream branches on provider internals.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::cost::PriceTable;
use crate::types::Usage;

/// Normalized token counts for one invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens sent to the model, including cached prompt tokens.
    pub prompt_tokens: u64,
    /// Tokens generated by the model.
    pub completion_tokens: u64,
}

impl TokenUsage {
    /// Create normalized usage.
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }

    /// Prompt + completion.
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

impl From<&Usage> for TokenUsage {
    fn from(usage: &Usage) -> Self {
        Self {
            prompt_tokens: u64::from(usage.input_tokens)
                + u64::from(usage.cache_creation_input_tokens)
                + u64::from(usage.cache_read_input_tokens),
            completion_tokens: u64::from(usage.output_tokens),
        }
    }
}

/// Aggregated usage and cost, as persisted with a turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Prompt tokens across all invocations.
    pub prompt_tokens: u64,
    /// Completion tokens across all invocations.
    pub completion_tokens: u64,
    /// Tokens billed for generated images.
    pub image_tokens: u64,
    /// Sum of the three counters above.
    pub total_tokens: u64,
    /// Derived cost in USD.
    pub cost: f64,
}

impl UsageRecord {
    /// Add another record into this one.
    pub fn merge(&mut self, other: &UsageRecord) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.image_tokens += other.image_tokens;
        self.total_tokens += other.total_tokens;
        self.cost += other.cost;
    }
}

#[derive(Debug, Default)]
struct AccumulatorState {
    prompt_tokens: u64,
    completion_tokens: u64,
    image_tokens: u64,
    cost: f64,
    invocations: u32,
}

/// Mutable usage counter for one turn.
///
/// Model adapters feed it after every completion; tools that bill their own
/// tokens (image generation) record into it through the invocation context.
#[derive(Debug)]
pub struct UsageAccumulator {
    prices: PriceTable,
    state: Mutex<AccumulatorState>,
}

impl Default for UsageAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl UsageAccumulator {
    /// Create an accumulator priced by the built-in table.
    pub fn new() -> Self {
        Self::with_prices(PriceTable::global().clone())
    }

    /// Create an accumulator with a custom price table.
    pub fn with_prices(prices: PriceTable) -> Self {
        Self {
            prices,
            state: Mutex::new(AccumulatorState::default()),
        }
    }

    /// Create a shareable accumulator.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Record one model invocation.
    pub fn record(&self, model: &str, usage: TokenUsage) {
        let cost = self
            .prices
            .cost(model, usage.prompt_tokens, usage.completion_tokens);
        let mut state = self.state.lock();
        state.prompt_tokens += usage.prompt_tokens;
        state.completion_tokens += usage.completion_tokens;
        state.cost += cost;
        state.invocations += 1;

        tracing::trace!(
            model,
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            cost,
            "Recorded usage"
        );
    }

    /// Record a provider-shaped usage report.
    pub fn record_usage(&self, model: &str, usage: &Usage) {
        self.record(model, TokenUsage::from(usage));
    }

    /// Record image tokens, priced at the image model's completion rate.
    pub fn record_image(&self, model: &str, image_tokens: u64) {
        let cost = self.prices.cost(model, 0, image_tokens);
        let mut state = self.state.lock();
        state.image_tokens += image_tokens;
        state.cost += cost;
    }

    /// Number of model invocations recorded.
    pub fn invocations(&self) -> u32 {
        self.state.lock().invocations
    }

    /// Current totals.
    pub fn snapshot(&self) -> UsageRecord {
        let state = self.state.lock();
        UsageRecord {
            prompt_tokens: state.prompt_tokens,
            completion_tokens: state.completion_tokens,
            image_tokens: state.image_tokens,
            total_tokens: state.prompt_tokens + state.completion_tokens + state.image_tokens,
            cost: state.cost,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost::ModelPrice;

    #[test]
    fn test_normalize_anthropic_usage() {
        let usage = Usage {
            input_tokens: 100,
            output_tokens: 40,
            cache_creation_input_tokens: 20,
            cache_read_input_tokens: 5,
        };
        assert_eq!(TokenUsage::from(&usage), TokenUsage::new(125, 40));
    }

    #[test]
    fn test_accumulates_across_invocations() {
        let prices = PriceTable::empty(ModelPrice::new(1.0, 2.0));
        let acc = UsageAccumulator::with_prices(prices);

        acc.record("m", TokenUsage::new(1_000_000, 0));
        acc.record_usage("m", &Usage::new(0, 500_000));

        let snap = acc.snapshot();
        assert_eq!(snap.prompt_tokens, 1_000_000);
        assert_eq!(snap.completion_tokens, 500_000);
        assert_eq!(snap.total_tokens, 1_500_000);
        assert!((snap.cost - 2.0).abs() < 1e-9);
        assert_eq!(acc.invocations(), 2);
    }

    #[test]
    fn test_image_tokens() {
        let prices = PriceTable::empty(ModelPrice::new(0.0, 0.0))
            .with_price("dall-e-3", ModelPrice::new(0.0, 40.0));
        let acc = UsageAccumulator::with_prices(prices);

        acc.record_image("dall-e-3", 1_000);
        let snap = acc.snapshot();
        assert_eq!(snap.image_tokens, 1_000);
        assert_eq!(snap.total_tokens, 1_000);
        assert!((snap.cost - 0.04).abs() < 1e-9);
        assert_eq!(acc.invocations(), 0);
    }

    #[test]
    fn test_usage_record_merge() {
        let mut a = UsageRecord {
            prompt_tokens: 1,
            completion_tokens: 2,
            image_tokens: 0,
            total_tokens: 3,
            cost: 0.5,
        };
        a.merge(&a.clone());
        assert_eq!(a.total_tokens, 6);
        assert!((a.cost - 1.0).abs() < 1e-9);
    }
}
