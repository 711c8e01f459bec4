//! Budget-aware model selection.
//!
//! Picks the cheapest model whose estimated cost fits within a fraction of
//! the remaining budget. When the budget is nearly exhausted, or nothing fits,
//! the cheapest model is used regardless of task size.

use std::fmt;
use std::sync::Arc;

use crate::budget::{BudgetLedger, ModelCostTable, cost_for_tokens};
use crate::error::{Error, Result};

/// Floor for [`estimate_tokens`].
pub const MIN_ESTIMATED_TOKENS: u64 = 10;

/// Approximate characters per token for natural-language text.
pub const CHARS_PER_TOKEN: u64 = 4;

/// Rough token count for `text`: `max(10, chars / 4)`.
///
/// This is an estimate for model selection only, not for billing.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64 / CHARS_PER_TOKEN).max(MIN_ESTIMATED_TOKENS)
}

/// Which rule produced a [`Selection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionRule {
    /// Remaining budget was under the low-budget threshold.
    LowBudget,
    /// The model's estimated cost fit within the safety fraction.
    Fits,
    /// No model fit; the cheapest is used anyway.
    BestEffort,
}

impl fmt::Display for SelectionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SelectionRule::LowBudget => "low-budget",
            SelectionRule::Fits => "fits",
            SelectionRule::BestEffort => "best-effort",
        };
        f.write_str(s)
    }
}

/// A chosen model and why it was chosen.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub model: String,
    pub rate_per_1k: f64,
    /// Estimated cost of the call on this model.
    pub estimated_cost: f64,
    pub rule: SelectionRule,
}

/// Chooses a model from a [`ModelCostTable`] given an estimate and a budget.
#[derive(Debug, Clone)]
pub struct ModelSelector {
    costs: Arc<ModelCostTable>,
    low_budget_threshold: f64,
    safety_fraction: f64,
}

impl ModelSelector {
    /// `safety_fraction` must lie in `(0, 1]` and the threshold must be >= 0.
    pub fn new(
        costs: Arc<ModelCostTable>,
        low_budget_threshold: f64,
        safety_fraction: f64,
    ) -> Result<Self> {
        if !low_budget_threshold.is_finite() || low_budget_threshold < 0.0 {
            return Err(Error::Config(format!(
                "low_budget_threshold must be >= 0, got {low_budget_threshold}"
            )));
        }
        if !(safety_fraction > 0.0 && safety_fraction <= 1.0) {
            return Err(Error::Config(format!(
                "safety_fraction must be in (0, 1], got {safety_fraction}"
            )));
        }
        Ok(Self {
            costs,
            low_budget_threshold,
            safety_fraction,
        })
    }

    pub fn costs(&self) -> &ModelCostTable {
        &self.costs
    }

    pub fn low_budget_threshold(&self) -> f64 {
        self.low_budget_threshold
    }

    pub fn safety_fraction(&self) -> f64 {
        self.safety_fraction
    }

    /// Select a model for a call of `estimated_tokens` given `remaining_budget`.
    pub fn select(&self, estimated_tokens: u64, remaining_budget: f64) -> Selection {
        // NaN compares false, so it falls through to the low-budget rail too.
        if !(remaining_budget >= self.low_budget_threshold) {
            return self.cheapest(estimated_tokens, SelectionRule::LowBudget);
        }

        let allowance = remaining_budget * self.safety_fraction;
        self.costs
            .ranked()
            .iter()
            .map(|(model, rate)| (model, *rate, cost_for_tokens(estimated_tokens, *rate)))
            .find(|(_, _, cost)| *cost <= allowance)
            .map(|(model, rate_per_1k, estimated_cost)| Selection {
                model: model.clone(),
                rate_per_1k,
                estimated_cost,
                rule: SelectionRule::Fits,
            })
            .unwrap_or_else(|| self.cheapest(estimated_tokens, SelectionRule::BestEffort))
    }

    /// [`select`](Self::select) against the ledger's default budget.
    pub fn select_with_ledger(&self, estimated_tokens: u64, ledger: &BudgetLedger) -> Selection {
        self.select(estimated_tokens, ledger.remaining_default())
    }

    fn cheapest(&self, estimated_tokens: u64, rule: SelectionRule) -> Selection {
        let (model, rate_per_1k) = self.costs.cheapest();
        Selection {
            model: model.to_string(),
            rate_per_1k,
            estimated_cost: cost_for_tokens(estimated_tokens, rate_per_1k),
            rule,
        }
    }
}
