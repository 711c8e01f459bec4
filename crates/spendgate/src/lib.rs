//! Rate-limited, budget-aware dispatcher for metered API calls.
//!
//! `spendgate` wraps an opaque outbound call (an LLM completion, a paid
//! search, anything billed per token) with three pieces of discipline:
//!
//! - a durable [`BudgetLedger`](budget::BudgetLedger) that records cumulative
//!   spend and call count in a small JSON file,
//! - a [`ModelSelector`](api::ModelSelector) that picks the cheapest model
//!   whose estimated cost fits the remaining budget,
//! - a [`BackoffInvoker`](api::BackoffInvoker) that retries rate-limited calls
//!   with exponential backoff and jitter, then degrades to a tagged
//!   `{"mock": true}` result instead of failing.
//!
//! The [`Dispatcher`](dispatch::Dispatcher) composes all three.
//!
//! # Getting started
//!
//! ```no_run
//! use spendgate::prelude::*;
//!
//! # async fn run() -> spendgate::Result<()> {
//! let dispatcher = DispatcherConfig::default().build_dispatcher()?;
//!
//! let report = dispatcher
//!     .dispatch("Summarize this thread.", |attempt| async move {
//!         // Call the real backend with `attempt.model` here. Map HTTP 429
//!         // to `CallError::RateLimited` so it is retried.
//!         Ok(CallResponse::new(format!("summary via {}", attempt.model), 850))
//!     })
//!     .await?;
//!
//! if report.is_degraded() {
//!     eprintln!("no real answer: {}", report.summary());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Where to find things
//!
//! - **Track spend:** [`BudgetLedger`](budget::BudgetLedger) with
//!   [`record_usage`](budget::BudgetLedger::record_usage) and
//!   [`remaining`](budget::BudgetLedger::remaining). Prices live in
//!   [`ModelCostTable`](budget::ModelCostTable).
//! - **Choose a model:** [`ModelSelector::select`](api::ModelSelector::select)
//!   and [`estimate_tokens`](api::estimate_tokens).
//! - **Retry on rate limits:** [`RetryConfig`](api::RetryConfig) for timing,
//!   [`CallError`](api::CallError) to classify failures,
//!   [`BackoffInvoker`](api::BackoffInvoker) to run the loop.
//! - **Configure everything:** [`DispatcherConfig`](config::DispatcherConfig).
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`budget`] | Ledger persistence and the model cost table |
//! | [`api`] | Model selection, backoff policy, invoker state machine |
//! | [`dispatch`] | [`Dispatcher`](dispatch::Dispatcher) composing selection, invocation and accounting |
//! | [`config`] | JSON configuration with defaults and fail-fast validation |
//! | [`error`] | [`Error`] and [`Result`] |

pub mod api;
pub mod budget;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod prelude;

pub use error::{Error, Result};
