//! Per-model token pricing.
//!
//! Prices are USD per million tokens. Lookup lower-cases the model name and
//! returns the first table entry whose key is a substring of it, so entry
//! order matters: `gpt-4o-mini` must be listed before `gpt-4o`.

/// A row of the pricing table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PricingEntry {
    /// Substring matched against the lower-cased model name.
    pub match_key: &'static str,
    /// Price per million input tokens ($/M).
    pub input_price_per_million: f64,
    /// Price per million output tokens ($/M).
    pub output_price_per_million: f64,
}

impl PricingEntry {
    pub fn pricing(&self) -> ModelPricing {
        ModelPricing {
            input_price_per_million: self.input_price_per_million,
            output_price_per_million: self.output_price_per_million,
        }
    }
}

/// Input/output price pair resolved for a model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    pub input_price_per_million: f64,
    pub output_price_per_million: f64,
}

impl ModelPricing {
    /// Cost in USD of the given token counts.
    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 * self.input_price_per_million
            + output_tokens as f64 * self.output_price_per_million)
            / 1_000_000.0
    }
}

/// Known models, in match priority order.
pub const PRICING_TABLE: &[PricingEntry] = &[
    entry("gpt-4o-mini", 0.15, 0.60),
    entry("gpt-4o", 2.50, 10.00),
    entry("gpt-4-turbo", 10.00, 30.00),
    entry("gpt-3.5-turbo", 0.50, 1.50),
    entry("claude-3-5-haiku", 0.80, 4.00),
    entry("claude-sonnet", 3.00, 15.00),
    entry("claude-opus", 15.00, 75.00),
];

/// Conservative price used when no table entry matches.
pub const FALLBACK_PRICING: ModelPricing = ModelPricing {
    input_price_per_million: 1.00,
    output_price_per_million: 3.00,
};

const fn entry(match_key: &'static str, input: f64, output: f64) -> PricingEntry {
    PricingEntry {
        match_key,
        input_price_per_million: input,
        output_price_per_million: output,
    }
}

/// The table entry a model name resolves to, if any.
pub fn matching_entry(model: &str) -> Option<&'static PricingEntry> {
    let model = model.to_lowercase();
    PRICING_TABLE
        .iter()
        .find(|entry| model.contains(entry.match_key))
}

/// Pricing for a model, falling back to [`FALLBACK_PRICING`].
pub fn lookup_pricing(model: &str) -> ModelPricing {
    matching_entry(model)
        .map(PricingEntry::pricing)
        .unwrap_or(FALLBACK_PRICING)
}
