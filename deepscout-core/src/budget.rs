//! Token budget accounting for the evidence list.
//!
//! The working set must fit inside the model's context window minus a
//! reserved response headroom. Only 90% of that is actually spent; the
//! remaining 10% absorbs tokenizer drift between counting and the real
//! provider-side count.

use crate::llm::TokenCounter;
use crate::types::EvidenceItem;

/// Fraction of the raw limit the evidence list may occupy.
pub const EFFECTIVE_BUDGET_RATIO: f64 = 0.9;

/// Fraction of the enforced limit the compressor is asked to aim for.
pub const COMPRESSION_TARGET_RATIO: f64 = 0.8;

/// Tracks evidence token totals against the session budget.
pub struct BudgetAccountant {
    counter: TokenCounter,
    /// Raw limit: context window minus reserved response headroom.
    limit: usize,
}

impl BudgetAccountant {
    /// Create an accountant for a model context window and reserve.
    ///
    /// The reserve is assumed already clamped by config validation.
    pub fn new(counter: TokenCounter, context_window: usize, reserve_tokens: usize) -> Self {
        Self {
            counter,
            limit: context_window.saturating_sub(reserve_tokens),
        }
    }

    /// Raw limit (context window minus reserve).
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// The enforced budget: raw limit scaled by [`EFFECTIVE_BUDGET_RATIO`].
    pub fn effective_limit(&self) -> usize {
        (self.limit as f64 * EFFECTIVE_BUDGET_RATIO) as usize
    }

    /// Token target handed to the compressor.
    pub fn compression_target(&self) -> usize {
        (self.effective_limit() as f64 * COMPRESSION_TARGET_RATIO) as usize
    }

    /// Count tokens in a string.
    pub fn count(&self, text: &str) -> usize {
        self.counter.count(text)
    }

    /// Sum of content token counts across the evidence list.
    pub fn total(&self, items: &[EvidenceItem]) -> usize {
        items.iter().map(|item| self.count(&item.content)).sum()
    }

    /// Whether admitting `new_tokens` on top of `current_total` would
    /// exceed the effective budget.
    pub fn would_overflow(&self, current_total: usize, new_tokens: usize) -> bool {
        current_total + new_tokens > self.effective_limit()
    }

    /// Truncate text so it counts at most `max_tokens`.
    ///
    /// Binary search over the character prefix; the BPE count is monotonic
    /// in prefix length.
    pub fn truncate_to_tokens(&self, text: &str, max_tokens: usize) -> String {
        if self.count(text) <= max_tokens {
            return text.to_string();
        }
        let chars: Vec<char> = text.chars().collect();
        let (mut lo, mut hi) = (0usize, chars.len());
        while lo < hi {
            let mid = (lo + hi + 1) / 2;
            let prefix: String = chars[..mid].iter().collect();
            if self.count(&prefix) <= max_tokens {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }
        chars[..lo].iter().collect()
    }
}
