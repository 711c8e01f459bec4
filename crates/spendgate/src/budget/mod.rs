//! Spend tracking: the durable ledger and the model cost table it charges against.
//!
//! - [`ledger`]: [`BudgetLedger`] persists cumulative spend and call count
//!   with a mutex-guarded, atomically written read-modify-write cycle.
//! - [`pricing`]: [`ModelCostTable`] maps model ids to USD per 1000 tokens.

pub mod ledger;
pub mod pricing;

pub use ledger::{BudgetLedger, BudgetRecord};
pub use pricing::{DEFAULT_COST_TABLE, ModelCostTable, cost_for_tokens};
