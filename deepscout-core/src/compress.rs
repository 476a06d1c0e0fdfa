//! Evidence compression.
//!
//! When admitting a new item would overflow the token budget, the
//! accumulated evidence plus the new item are handed to the LLM with a
//! target size. The model returns a plan describing which items survive
//! and in what form. The plan is applied, the budget re-counted, and a
//! hard enforcement pass guarantees the result actually fits.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::budget::BudgetAccountant;
use crate::llm::LanguageModel;
use crate::prompts::compression_prompt;
use crate::types::{CompressionPlan, EvidenceItem};

/// When the fallback path runs, keep at least this many existing items.
const FALLBACK_MIN_KEPT: usize = 2;

pub struct ContentCompressor {
    model: Arc<dyn LanguageModel>,
}

impl ContentCompressor {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }

    /// Compresses `existing` plus `new_item` so the total fits the
    /// accountant's effective budget. The result is non-empty whenever
    /// `new_item` has content, and is always within budget on return.
    pub async fn compress(
        &self,
        query: &str,
        existing: Vec<EvidenceItem>,
        new_item: EvidenceItem,
        budget: &BudgetAccountant,
    ) -> Vec<EvidenceItem> {
        let target = budget.compression_target();
        let prompt = compression_prompt(query, &existing, &new_item, target);

        let compressed = match self.model.generate_structured(&prompt).await {
            Ok(value) => match serde_json::from_value::<CompressionPlan>(value) {
                Ok(plan) => apply_plan(plan, &existing, &new_item),
                Err(e) => {
                    warn!(error = %e, "compression plan did not match the expected shape");
                    None
                }
            },
            Err(e) => {
                warn!(error = %e, "compression request failed");
                None
            }
        };

        let items = compressed.unwrap_or_else(|| fallback(existing, new_item));
        enforce_budget(items, budget)
    }
}

/// Materializes a compression plan. Returns `None` when the plan is
/// unusable (no entries with content), which sends the caller down the
/// fallback path.
fn apply_plan(
    plan: CompressionPlan,
    existing: &[EvidenceItem],
    new_item: &EvidenceItem,
) -> Option<Vec<EvidenceItem>> {
    if let Some(notes) = &plan.decisions {
        debug!(strategy = %notes.strategy, reasoning = %notes.reasoning, "compression plan");
    }

    let mut result: Vec<EvidenceItem> = Vec::new();
    let mut urls: HashSet<String> = HashSet::new();
    for entry in plan.compressed_results {
        if entry.content.trim().is_empty() {
            continue;
        }
        let base = if entry.original_index >= 0 {
            match existing.get(entry.original_index as usize) {
                Some(item) => item,
                None => {
                    warn!(index = entry.original_index, "plan references unknown item");
                    continue;
                }
            }
        } else {
            new_item
        };

        let mut item = base.clone();
        if !entry.url.is_empty() {
            item.url = entry.url;
        }
        if !entry.title.is_empty() {
            item.title = entry.title;
        }
        item.compressed = entry.compressed || item.content != entry.content;
        item.content = entry.content;

        if urls.insert(item.url.clone()) {
            result.push(item);
        }
    }

    if result.is_empty() { None } else { Some(result) }
}

/// Plan-free fallback: keep the newest half of the existing evidence (at
/// least two items when available) plus the new item, unmodified.
fn fallback(existing: Vec<EvidenceItem>, new_item: EvidenceItem) -> Vec<EvidenceItem> {
    warn!(
        existing = existing.len(),
        "no usable compression plan, keeping newest evidence"
    );
    let keep = (existing.len() / 2)
        .max(FALLBACK_MIN_KEPT)
        .min(existing.len());
    let mut items: Vec<EvidenceItem> =
        existing.into_iter().rev().take(keep).rev().collect();
    items.push(new_item);
    items
}

/// Hard budget enforcement: drop the oldest items while the total exceeds
/// the effective budget; if a single over-budget item remains, truncate its
/// content to fit. Never returns an empty list for non-empty input.
pub fn enforce_budget(
    mut items: Vec<EvidenceItem>,
    budget: &BudgetAccountant,
) -> Vec<EvidenceItem> {
    let limit = budget.effective_limit();
    while items.len() > 1 && budget.total(&items) > limit {
        let dropped = items.remove(0);
        debug!(url = %dropped.url, "evidence over budget, dropping oldest item");
    }
    if let Some(item) = items.first_mut() {
        if budget.count(&item.content) > limit {
            debug!(url = %item.url, "truncating single over-budget item");
            item.content = budget.truncate_to_tokens(&item.content, limit);
            item.compressed = true;
        }
    }
    items
}
