//! Convenience re-exports for common `spendgate` types.
//!
//! ```ignore
//! use spendgate::prelude::*;
//! ```

pub use crate::api::{
    BackoffInvoker, CallAttempt, CallError, Degraded, ModelSelector, Outcome, RetryConfig,
    Selection, SelectionRule, estimate_tokens,
};
pub use crate::budget::{BudgetLedger, BudgetRecord, ModelCostTable};
pub use crate::config::DispatcherConfig;
pub use crate::dispatch::{CallResponse, DispatchReport, Dispatcher};
pub use crate::error::{Error, Result};
