//! Cost ledger: model name + token counts → USD.
//!
//! Prices are illustrative data, not a billing contract. Lookups are fuzzy:
//! an exact (case-insensitive) match wins, then the longest table key
//! contained in the model name, then the default rate.

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

/// Price of one model, in USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    /// Prompt (input) tokens.
    pub prompt_per_million: f64,
    /// Completion (output) tokens.
    pub completion_per_million: f64,
}

impl ModelPrice {
    /// Create a price entry.
    pub const fn new(prompt_per_million: f64, completion_per_million: f64) -> Self {
        Self {
            prompt_per_million,
            completion_per_million,
        }
    }
}

/// Rate used when no table entry matches.
pub const DEFAULT_PRICE: ModelPrice = ModelPrice::new(1.0, 2.0);

const DEFAULT_TABLE: &[(&str, ModelPrice)] = &[
    ("gpt-4o-mini", ModelPrice::new(0.15, 0.60)),
    ("gpt-4o", ModelPrice::new(2.50, 10.00)),
    ("gpt-4-turbo", ModelPrice::new(10.00, 30.00)),
    ("gpt-4", ModelPrice::new(30.00, 60.00)),
    ("gpt-3.5-turbo", ModelPrice::new(0.50, 1.50)),
    ("o1-mini", ModelPrice::new(3.00, 12.00)),
    ("o1", ModelPrice::new(15.00, 60.00)),
    ("o3-mini", ModelPrice::new(1.10, 4.40)),
    ("claude-3-5-sonnet", ModelPrice::new(3.00, 15.00)),
    ("claude-3-5-haiku", ModelPrice::new(0.80, 4.00)),
    ("claude-3-opus", ModelPrice::new(15.00, 75.00)),
    ("claude-3-haiku", ModelPrice::new(0.25, 1.25)),
    ("claude-sonnet-4", ModelPrice::new(3.00, 15.00)),
    ("claude-opus-4", ModelPrice::new(15.00, 75.00)),
    ("llama-3.1-70b", ModelPrice::new(0.59, 0.79)),
    ("llama-3.1-8b", ModelPrice::new(0.05, 0.08)),
    ("llama3", ModelPrice::new(0.0, 0.0)),
    ("mixtral-8x7b", ModelPrice::new(0.24, 0.24)),
    ("gemma", ModelPrice::new(0.20, 0.20)),
    ("dall-e-3", ModelPrice::new(0.0, 40.00)),
    ("gpt-image-1", ModelPrice::new(5.00, 40.00)),
];

/// A lookup table of model prices.
#[derive(Debug, Clone)]
pub struct PriceTable {
    entries: Vec<(String, ModelPrice)>,
    default: ModelPrice,
}

impl Default for PriceTable {
    fn default() -> Self {
        Self {
            entries: DEFAULT_TABLE
                .iter()
                .map(|(name, price)| (name.to_string(), *price))
                .collect(),
            default: DEFAULT_PRICE,
        }
    }
}

impl PriceTable {
    /// An empty table that prices everything at `default`.
    pub fn empty(default: ModelPrice) -> Self {
        Self {
            entries: Vec::new(),
            default,
        }
    }

    /// The shared built-in table.
    pub fn global() -> &'static PriceTable {
        static TABLE: OnceLock<PriceTable> = OnceLock::new();
        TABLE.get_or_init(PriceTable::default)
    }

    /// Add or replace an entry.
    pub fn with_price(mut self, model: impl Into<String>, price: ModelPrice) -> Self {
        let model = model.into().to_lowercase();
        self.entries.retain(|(name, _)| *name != model);
        self.entries.push((model, price));
        self
    }

    /// Resolve the price for a model name.
    pub fn price_for(&self, model: &str) -> ModelPrice {
        let model = model.to_lowercase();

        if let Some((_, price)) = self.entries.iter().find(|(name, _)| *name == model) {
            return *price;
        }

        self.entries
            .iter()
            .filter(|(name, _)| model.contains(name.as_str()))
            .max_by_key(|(name, _)| name.len())
            .map(|(_, price)| *price)
            .unwrap_or(self.default)
    }

    /// Cost in USD of one invocation.
    pub fn cost(&self, model: &str, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        let price = self.price_for(model);
        (prompt_tokens as f64 * price.prompt_per_million
            + completion_tokens as f64 * price.completion_per_million)
            / 1_000_000.0
    }
}

/// Cost in USD using the built-in table.
pub fn calculate_cost(model: &str, prompt_tokens: u64, completion_tokens: u64) -> f64 {
    PriceTable::global().cost(model, prompt_tokens, completion_tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn test_exact_match() {
        let table = PriceTable::default();
        assert_eq!(table.price_for("gpt-4o"), ModelPrice::new(2.50, 10.00));
        assert_eq!(table.price_for("GPT-4O"), ModelPrice::new(2.50, 10.00));
    }

    #[test]
    fn test_longest_contained_key_wins() {
        let table = PriceTable::default();
        // Contains gpt-4, gpt-4o and gpt-4o-mini
        assert_eq!(
            table.price_for("gpt-4o-mini-2024-07-18"),
            ModelPrice::new(0.15, 0.60)
        );
        assert_eq!(
            table.price_for("claude-3-5-haiku-latest"),
            ModelPrice::new(0.80, 4.00)
        );
        assert_eq!(
            table.price_for("llama-3.1-70b-versatile"),
            ModelPrice::new(0.59, 0.79)
        );
    }

    #[test]
    fn test_unknown_model_uses_default() {
        let table = PriceTable::default();
        assert_eq!(table.price_for("mystery-model"), DEFAULT_PRICE);
    }

    #[test]
    fn test_cost_calculation() {
        let table = PriceTable::default();
        let cost = table.cost("gpt-4o", 1_000_000, 500_000);
        assert!(approx(cost, 2.50 + 5.00));
        assert_eq!(table.cost("gpt-4o", 0, 0), 0.0);
    }

    #[test]
    fn test_custom_price_overrides() {
        let table = PriceTable::empty(ModelPrice::new(0.0, 0.0))
            .with_price("House-Model", ModelPrice::new(1.0, 1.0));
        assert!(approx(table.cost("house-model-v2", 500_000, 500_000), 1.0));
        assert_eq!(table.cost("other", 1_000, 1_000), 0.0);
    }

    #[test]
    fn test_calculate_cost_global() {
        assert!(calculate_cost("claude-3-haiku-20240307", 4_000_000, 0) > 0.99);
    }
}
