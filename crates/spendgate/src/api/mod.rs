//! Call-side machinery: model selection, backoff policy, and invocation.
//!
//! These modules sit between the caller and the outbound call:
//!
//! - [`selector`]: [`ModelSelector`] picks the cheapest model that fits the
//!   remaining budget, with a hard low-budget rail.
//! - [`retry`]: [`RetryConfig`] backoff timing and rate-limit
//!   classification. Only rate limits are retried.
//! - [`invoker`]: [`BackoffInvoker`] runs one call through the
//!   attempt/backoff state machine and degrades to a tagged sentinel.

pub mod invoker;
pub mod retry;
pub mod selector;

// Re-export commonly used items at the module level.
pub use invoker::{BackoffInvoker, CallAttempt, Degraded, Outcome};
pub use retry::{CallError, RetryConfig, is_rate_limit_error};
pub use selector::{ModelSelector, Selection, SelectionRule, estimate_tokens};
