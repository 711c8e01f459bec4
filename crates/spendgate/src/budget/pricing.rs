//! Per-model pricing used for cost computation and model selection.
//!
//! Rates are USD per 1000 tokens. The table is validated once at
//! construction and never mutated afterwards.

use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// Built-in rates used when no cost table is configured.
pub const DEFAULT_COST_TABLE: &[(&str, f64)] = &[
    ("gpt-4o-mini", 0.15),
    ("gpt-4o", 2.5),
    ("gpt-4-turbo", 10.0),
];

/// Cost of `tokens` at `rate_per_1k`.
pub fn cost_for_tokens(tokens: u64, rate_per_1k: f64) -> f64 {
    (tokens as f64 / 1000.0) * rate_per_1k
}

fn check_rate(model: &str, rate: f64) -> Result<()> {
    if !rate.is_finite() || rate < 0.0 {
        return Err(Error::Config(format!(
            "rate for '{model}' must be a non-negative number, got {rate}"
        )));
    }
    Ok(())
}

/// Ascending by cost, ties broken by model id.
fn rank(rates: &BTreeMap<String, f64>) -> Vec<(String, f64)> {
    let mut ranked: Vec<(String, f64)> = rates.iter().map(|(k, &v)| (k.clone(), v)).collect();
    ranked.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    ranked
}

/// Immutable model id → cost-per-1k mapping, pre-sorted by ascending cost.
#[derive(Debug, Clone)]
pub struct ModelCostTable {
    rates: BTreeMap<String, f64>,
    ranked: Vec<(String, f64)>,
    fallback_rate: Option<f64>,
}

impl ModelCostTable {
    /// Build a table. Fails if it is empty or any rate is negative/non-finite.
    pub fn new<K, I>(rates: I) -> Result<Self>
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, f64)>,
    {
        let rates: BTreeMap<String, f64> = rates.into_iter().map(|(k, v)| (k.into(), v)).collect();
        if rates.is_empty() {
            return Err(Error::Config("model cost table is empty".into()));
        }
        for (model, &rate) in &rates {
            check_rate(model, rate)?;
        }

        let ranked = rank(&rates);

        Ok(Self {
            rates,
            ranked,
            fallback_rate: None,
        })
    }

    /// Charge unknown models at `rate` instead of rejecting them.
    pub fn with_fallback_rate(mut self, rate: f64) -> Result<Self> {
        check_rate("<fallback>", rate)?;
        self.fallback_rate = Some(rate);
        Ok(self)
    }

    /// Rate for `model`, the fallback rate, or [`Error::UnknownModel`].
    pub fn rate_for(&self, model: &str) -> Result<f64> {
        self.rates
            .get(model)
            .copied()
            .or(self.fallback_rate)
            .ok_or_else(|| Error::UnknownModel(model.to_string()))
    }

    /// Cost of `tokens` on `model`.
    pub fn cost_for(&self, tokens: u64, model: &str) -> Result<f64> {
        Ok(cost_for_tokens(tokens, self.rate_for(model)?))
    }

    /// Models in ascending cost order.
    pub fn ranked(&self) -> &[(String, f64)] {
        &self.ranked
    }

    /// The single cheapest model and its rate.
    pub fn cheapest(&self) -> (&str, f64) {
        // `new` rejects empty tables, so `ranked` always has a first entry.
        let (model, rate) = &self.ranked[0];
        (model.as_str(), *rate)
    }

    pub fn contains(&self, model: &str) -> bool {
        self.rates.contains_key(model)
    }

    pub fn fallback_rate(&self) -> Option<f64> {
        self.fallback_rate
    }

    pub fn len(&self) -> usize {
        self.rates.len()
    }
}

impl Default for ModelCostTable {
    fn default() -> Self {
        let rates: BTreeMap<String, f64> = DEFAULT_COST_TABLE
            .iter()
            .map(|&(k, v)| (k.to_string(), v))
            .collect();
        let ranked = rank(&rates);
        Self {
            rates,
            ranked,
            fallback_rate: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_is_linear_in_tokens() {
        assert!((cost_for_tokens(1000, 0.15) - 0.15).abs() < 1e-12);
        assert!((cost_for_tokens(2500, 2.0) - 5.0).abs() < 1e-12);
        assert_eq!(cost_for_tokens(0, 10.0), 0.0);
    }

    #[test]
    fn ranked_ascending_by_cost() {
        let table = ModelCostTable::new([("big", 10.0), ("small", 0.1), ("mid", 1.0)]).unwrap();
        let names: Vec<&str> = table.ranked().iter().map(|(m, _)| m.as_str()).collect();
        assert_eq!(names, ["small", "mid", "big"]);
        assert_eq!(table.cheapest(), ("small", 0.1));
    }

    #[test]
    fn ties_broken_by_name() {
        let table = ModelCostTable::new([("zeta", 1.0), ("alpha", 1.0)]).unwrap();
        assert_eq!(table.cheapest().0, "alpha");
    }

    #[test]
    fn empty_table_rejected() {
        let err = ModelCostTable::new(Vec::<(String, f64)>::new()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn negative_rate_rejected() {
        assert!(ModelCostTable::new([("m", -1.0)]).is_err());
        assert!(ModelCostTable::new([("m", f64::NAN)]).is_err());
    }

    #[test]
    fn unknown_model_fails_without_fallback() {
        let table = ModelCostTable::default();
        let err = table.rate_for("no-such-model").unwrap_err();
        assert!(matches!(err, Error::UnknownModel(ref m) if m == "no-such-model"));
    }

    #[test]
    fn unknown_model_uses_fallback_when_configured() {
        let table = ModelCostTable::default().with_fallback_rate(1.5).unwrap();
        assert_eq!(table.rate_for("no-such-model").unwrap(), 1.5);
        // Known models keep their own rate.
        assert_eq!(table.rate_for("gpt-4o-mini").unwrap(), 0.15);
    }

    #[test]
    fn default_table_cheapest_is_mini() {
        let table = ModelCostTable::default();
        assert_eq!(table.cheapest().0, "gpt-4o-mini");
        assert_eq!(table.len(), DEFAULT_COST_TABLE.len());
    }
}
