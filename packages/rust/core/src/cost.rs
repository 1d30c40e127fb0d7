//! Session token accounting and the pre-enrichment cost estimate.
//!
//! The accountant is shared by every stage of a run. Collaborators report
//! usage from whatever task made the LLM call; the controller resets it at
//! the start of each run and snapshots it around the summarize stage.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::pricing::lookup_pricing;

/// Assumed prompt size per summarized item.
pub const ESTIMATED_INPUT_TOKENS_PER_ITEM: f64 = 4000.0;

/// Assumed completion size per summarized item.
pub const ESTIMATED_OUTPUT_TOKENS_PER_ITEM: f64 = 500.0;

/// Multiplier applied to the raw estimate so the figure shown for approval
/// errs high.
pub const ESTIMATE_ANCHOR_FACTOR: f64 = 2.0;

/// A snapshot of input/output token counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    /// Usage accumulated since `earlier`.
    pub fn since(&self, earlier: TokenUsage) -> TokenUsage {
        TokenUsage {
            input_tokens: self.input_tokens.saturating_sub(earlier.input_tokens),
            output_tokens: self.output_tokens.saturating_sub(earlier.output_tokens),
        }
    }

    /// Cost in USD at `model`'s prices.
    pub fn cost(&self, model: &str) -> f64 {
        lookup_pricing(model).cost(self.input_tokens, self.output_tokens)
    }
}

/// Lock-free accumulator of the tokens spent by the current run.
#[derive(Debug, Default)]
pub struct SessionCostAccountant {
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
}

impl SessionCostAccountant {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add usage from one LLM call. Safe from any thread or task.
    pub fn add_tokens(&self, input_tokens: u64, output_tokens: u64) {
        self.input_tokens.fetch_add(input_tokens, Ordering::AcqRel);
        self.output_tokens.fetch_add(output_tokens, Ordering::AcqRel);
    }

    /// Current counters.
    pub fn get_tokens(&self) -> TokenUsage {
        TokenUsage {
            input_tokens: self.input_tokens.load(Ordering::Acquire),
            output_tokens: self.output_tokens.load(Ordering::Acquire),
        }
    }

    /// Zero both counters.
    pub fn reset(&self) {
        self.input_tokens.store(0, Ordering::Release);
        self.output_tokens.store(0, Ordering::Release);
    }

    /// Cost in USD of everything recorded since the last reset.
    pub fn get_session_cost(&self, model: &str) -> f64 {
        self.get_tokens().cost(model)
    }
}

/// Estimated USD cost of summarizing `pending_count` items with `model`.
///
/// The raw figure assumes 4000 input and 500 output tokens per item and is
/// then doubled.
pub fn estimate_summarization_cost(pending_count: usize, model: &str) -> f64 {
    let pricing = lookup_pricing(model);
    let per_item = ESTIMATED_INPUT_TOKENS_PER_ITEM * pricing.input_price_per_million
        + ESTIMATED_OUTPUT_TOKENS_PER_ITEM * pricing.output_price_per_million;
    let raw = pending_count as f64 * per_item / 1_000_000.0;
    raw * ESTIMATE_ANCHOR_FACTOR
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn estimate_for_ten_mini_items() {
        let cost = estimate_summarization_cost(10, "gpt-4o-mini");
        assert!(approx(cost, 0.018), "got {cost}");
    }

    #[test]
    fn estimate_is_zero_for_no_items() {
        assert_eq!(estimate_summarization_cost(0, "gpt-4o"), 0.0);
    }

    #[test]
    fn estimate_uses_fallback_for_unknown_model() {
        // (4000 * 1.0 + 500 * 3.0) / 1e6 * 2
        let cost = estimate_summarization_cost(1, "some-local-model");
        assert!(approx(cost, 0.011), "got {cost}");
    }

    #[test]
    fn reset_then_read_is_zero() {
        let accountant = SessionCostAccountant::new();
        accountant.add_tokens(120, 40);
        accountant.reset();
        assert_eq!(accountant.get_tokens(), TokenUsage::new(0, 0));
    }

    #[test]
    fn concurrent_adds_sum_exactly() {
        let accountant = Arc::new(SessionCostAccountant::new());
        let handles: Vec<_> = (0..16u64)
            .map(|i| {
                let accountant = Arc::clone(&accountant);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        accountant.add_tokens(i, 2 * i);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("worker thread");
        }

        let expected_in: u64 = (0..16u64).map(|i| i * 1000).sum();
        assert_eq!(
            accountant.get_tokens(),
            TokenUsage::new(expected_in, 2 * expected_in)
        );
    }

    #[test]
    fn session_cost_uses_model_pricing() {
        let accountant = SessionCostAccountant::new();
        accountant.add_tokens(1_000_000, 1_000_000);
        assert!(approx(accountant.get_session_cost("gpt-4o-mini"), 0.75));
        assert!(approx(accountant.get_session_cost("unknown"), 4.0));
    }

    #[test]
    fn usage_delta_saturates() {
        let before = TokenUsage::new(100, 50);
        let after = TokenUsage::new(350, 80);
        assert_eq!(after.since(before), TokenUsage::new(250, 30));
        assert_eq!(before.since(after), TokenUsage::new(0, 0));
    }
}
