//! Dispatcher configuration with sensible defaults.
//!
//! [`DispatcherConfig`] is read from a JSON file where every field is
//! optional, validated once, and converted into runtime objects via
//! [`build_ledger`](DispatcherConfig::build_ledger),
//! [`build_selector`](DispatcherConfig::build_selector) and
//! [`build_dispatcher`](DispatcherConfig::build_dispatcher).
//!
//! ```json
//! {
//!   "ledger_path": ".spendgate/budget.json",
//!   "default_budget": 5.0,
//!   "cost_table": { "gpt-4o-mini": 0.15, "gpt-4o": 2.5 },
//!   "retry": { "max_retries": 3, "jitter": false }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::api::{BackoffInvoker, ModelSelector, RetryConfig};
use crate::budget::{BudgetLedger, DEFAULT_COST_TABLE, ModelCostTable};
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};

/// Default location of the budget record, relative to the working directory.
pub const DEFAULT_LEDGER_PATH: &str = ".spendgate/budget.json";

/// Configuration for a dispatcher and the pieces it is built from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Budget record location. Default: `.spendgate/budget.json`.
    pub ledger_path: PathBuf,
    /// Budget ceiling in USD for the current period. Default: `5.0`.
    pub default_budget: f64,
    /// Below this remaining budget the cheapest model is always used. Default: `0.5`.
    pub low_budget_threshold: f64,
    /// Share of the remaining budget a single call may be estimated to use. Default: `0.5`.
    pub safety_fraction: f64,
    /// Model id → USD per 1000 tokens.
    pub cost_table: BTreeMap<String, f64>,
    /// Rate charged for models missing from the table. Default: none (reject).
    pub fallback_rate: Option<f64>,
    /// Skip the call entirely once the budget is spent. Default: `false`.
    pub skip_when_exhausted: bool,
    pub retry: RetryConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            ledger_path: PathBuf::from(DEFAULT_LEDGER_PATH),
            default_budget: 5.0,
            low_budget_threshold: 0.5,
            safety_fraction: 0.5,
            cost_table: DEFAULT_COST_TABLE
                .iter()
                .map(|&(k, v)| (k.to_string(), v))
                .collect(),
            fallback_rate: None,
            skip_when_exhausted: false,
            retry: RetryConfig::default(),
        }
    }
}

impl DispatcherConfig {
    /// Load and validate a JSON config file. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let config = match std::fs::read_to_string(path) {
            Ok(json) => {
                debug!("Loaded dispatcher config from {}", path.display());
                serde_json::from_str(&json)?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No config at {}, using defaults", path.display());
                Self::default()
            }
            Err(e) => return Err(Error::persistence(path, e)),
        };
        config.validate()?;
        Ok(config)
    }

    /// Fail fast on anything that would otherwise break deep inside a call.
    pub fn validate(&self) -> Result<()> {
        if !self.default_budget.is_finite() || self.default_budget < 0.0 {
            return Err(Error::Config(format!(
                "default_budget must be >= 0, got {}",
                self.default_budget
            )));
        }
        if self.ledger_path.file_name().is_none() {
            return Err(Error::Config(format!(
                "ledger_path must name a file, got {}",
                self.ledger_path.display()
            )));
        }
        self.retry.validate()?;
        // These also check the table, threshold and safety fraction.
        let costs = self.cost_table()?;
        ModelSelector::new(costs, self.low_budget_threshold, self.safety_fraction)?;
        Ok(())
    }

    /// Validated cost table, including the fallback rate if one is set.
    pub fn cost_table(&self) -> Result<Arc<ModelCostTable>> {
        let mut table = ModelCostTable::new(self.cost_table.clone())?;
        if let Some(rate) = self.fallback_rate {
            table = table.with_fallback_rate(rate)?;
        }
        Ok(Arc::new(table))
    }

    pub fn build_ledger(&self) -> Result<BudgetLedger> {
        Ok(BudgetLedger::new(
            self.ledger_path.clone(),
            self.default_budget,
            self.cost_table()?,
        ))
    }

    pub fn build_selector(&self) -> Result<ModelSelector> {
        ModelSelector::new(
            self.cost_table()?,
            self.low_budget_threshold,
            self.safety_fraction,
        )
    }

    /// Build a [`Dispatcher`] whose ledger and selector share one cost table.
    pub fn build_dispatcher(&self) -> Result<Dispatcher> {
        self.validate()?;
        let costs = self.cost_table()?;
        let ledger = BudgetLedger::new(self.ledger_path.clone(), self.default_budget, costs.clone());
        let selector = ModelSelector::new(costs, self.low_budget_threshold, self.safety_fraction)?;
        let invoker = BackoffInvoker::new(self.retry.clone())?;
        Ok(Dispatcher::new(Arc::new(ledger), selector, invoker)
            .with_skip_when_exhausted(self.skip_when_exhausted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = DispatcherConfig::default();
        config.validate().unwrap();
        assert_eq!(config.default_budget, 5.0);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.cost_table["gpt-4o-mini"], 0.15);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: DispatcherConfig = serde_json::from_str(
            r#"{"default_budget": 2.0, "retry": {"max_retries": 3}}"#,
        )
        .unwrap();
        assert_eq!(config.default_budget, 2.0);
        assert_eq!(config.retry.max_retries, 3);
        assert!(config.retry.jitter);
        assert_eq!(config.low_budget_threshold, 0.5);
        assert_eq!(config.ledger_path, PathBuf::from(DEFAULT_LEDGER_PATH));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = DispatcherConfig::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config, DispatcherConfig::default());
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spendgate.json");
        std::fs::write(&path, r#"{"cost_table": {"only-model": 1.0}}"#).unwrap();
        let config = DispatcherConfig::load(&path).unwrap();
        assert_eq!(config.cost_table.len(), 1);
        assert_eq!(config.build_selector().unwrap().costs().cheapest().0, "only-model");
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spendgate.json");
        std::fs::write(&path, "{").unwrap();
        assert!(matches!(
            DispatcherConfig::load(&path),
            Err(Error::Serialize(_))
        ));
    }

    #[test]
    fn empty_cost_table_fails_fast() {
        let config = DispatcherConfig {
            cost_table: BTreeMap::new(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
        assert!(config.build_dispatcher().is_err());
    }

    #[test]
    fn invalid_fields_rejected() {
        let cases = [
            DispatcherConfig {
                default_budget: -1.0,
                ..Default::default()
            },
            DispatcherConfig {
                safety_fraction: 0.0,
                ..Default::default()
            },
            DispatcherConfig {
                low_budget_threshold: -0.5,
                ..Default::default()
            },
            DispatcherConfig {
                fallback_rate: Some(-2.0),
                ..Default::default()
            },
            DispatcherConfig {
                retry: RetryConfig::with_retries(0),
                ..Default::default()
            },
            DispatcherConfig {
                ledger_path: PathBuf::from("/"),
                ..Default::default()
            },
        ];
        for config in cases {
            assert!(config.validate().is_err(), "accepted: {config:?}");
        }
    }

    #[test]
    fn fallback_rate_flows_into_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let config = DispatcherConfig {
            ledger_path: dir.path().join("budget.json"),
            fallback_rate: Some(1.0),
            ..Default::default()
        };
        let ledger = config.build_ledger().unwrap();
        let (_, cost) = ledger.record_usage(2000, "unlisted-model").unwrap();
        assert!((cost - 2.0).abs() < 1e-9);
    }
}
