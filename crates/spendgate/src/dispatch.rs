//! Budget-aware dispatch: select → check → invoke → record.
//!
//! A [`Dispatcher`] ties the three pieces together for one outbound call:
//!
//! 1. estimate tokens and pick a model from the ledger's remaining budget,
//! 2. optionally skip the call when the budget is already spent,
//! 3. run the call through the [`BackoffInvoker`],
//! 4. charge the tokens the call reports against the chosen model.
//!
//! Degraded outcomes are never charged. The dispatcher is `Send + Sync` and is
//! meant to be shared as `Arc<Dispatcher>` across tasks; the ledger serializes
//! concurrent spend updates.
//!
//! An unreadable or corrupt ledger stops the dispatch before the call goes
//! out. If the call succeeds and only the charge fails, the value comes back
//! inside [`Error::Unrecorded`].

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::api::{
    BackoffInvoker, CallAttempt, CallError, Degraded, ModelSelector, Outcome, Selection,
    estimate_tokens,
};
use crate::budget::{BudgetLedger, BudgetRecord};
use crate::error::{Error, Result};

/// Correlation ID for one dispatch: `dx-<unix secs>-<pid>-<sequence>`.
fn next_trace_id() -> String {
    static SEQUENCE: AtomicU64 = AtomicU64::new(0);
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs());
    format!("dx-{secs:x}-{:x}-{seq}", std::process::id())
}

/// What a wrapped call returns on success: its value and the tokens it used.
#[derive(Debug, Clone, PartialEq)]
pub struct CallResponse<T> {
    pub value: T,
    /// Actual tokens consumed, charged to the ledger.
    pub tokens_used: u64,
}

impl<T> CallResponse<T> {
    pub fn new(value: T, tokens_used: u64) -> Self {
        Self { value, tokens_used }
    }
}

/// Everything a caller needs to know about one dispatch.
#[derive(Debug, Clone)]
pub struct DispatchReport<T> {
    /// Correlation ID present in this dispatch's log lines.
    pub trace_id: String,
    pub estimated_tokens: u64,
    pub selection: Selection,
    pub outcome: Outcome<T>,
    /// Tokens charged. Zero for degraded outcomes.
    pub tokens_used: u64,
    /// Cost charged. Zero for degraded outcomes.
    pub cost: f64,
    /// Ledger state after this dispatch.
    pub record: BudgetRecord,
}

impl<T> DispatchReport<T> {
    pub fn is_degraded(&self) -> bool {
        self.outcome.is_degraded()
    }

    /// Format as a short summary string.
    pub fn summary(&self) -> String {
        let status = match &self.outcome {
            Outcome::Succeeded(_) => "ok".to_string(),
            Outcome::Degraded(d) => format!("degraded ({})", d.reason),
        };
        format!(
            "[{}] model: {} ({}), status: {}, tokens: {}, cost: ${:.4}",
            self.trace_id,
            self.selection.model,
            self.selection.rule,
            status,
            self.tokens_used,
            self.cost,
        )
    }
}

/// Rate-limited, budget-aware call dispatcher.
#[derive(Debug)]
pub struct Dispatcher {
    ledger: Arc<BudgetLedger>,
    selector: ModelSelector,
    invoker: BackoffInvoker,
    skip_when_exhausted: bool,
}

impl Dispatcher {
    pub fn new(ledger: Arc<BudgetLedger>, selector: ModelSelector, invoker: BackoffInvoker) -> Self {
        Self {
            ledger,
            selector,
            invoker,
            skip_when_exhausted: false,
        }
    }

    /// Return a degraded result without calling once remaining budget is <= 0.
    pub fn with_skip_when_exhausted(mut self, skip: bool) -> Self {
        self.skip_when_exhausted = skip;
        self
    }

    pub fn ledger(&self) -> &Arc<BudgetLedger> {
        &self.ledger
    }

    pub fn selector(&self) -> &ModelSelector {
        &self.selector
    }

    pub fn invoker(&self) -> &BackoffInvoker {
        &self.invoker
    }

    /// Dispatch a call whose size is estimated from `prompt`.
    pub async fn dispatch<T, F, Fut>(&self, prompt: &str, call: F) -> Result<DispatchReport<T>>
    where
        T: Send + Sync + 'static,
        F: FnMut(CallAttempt) -> Fut,
        Fut: Future<Output = std::result::Result<CallResponse<T>, CallError>>,
    {
        self.dispatch_with(estimate_tokens(prompt), None, call).await
    }

    /// Dispatch with a caller-supplied estimate and an optional deadline for
    /// the retry loop.
    pub async fn dispatch_with<T, F, Fut>(
        &self,
        estimated_tokens: u64,
        deadline: Option<Instant>,
        call: F,
    ) -> Result<DispatchReport<T>>
    where
        T: Send + Sync + 'static,
        F: FnMut(CallAttempt) -> Fut,
        Fut: Future<Output = std::result::Result<CallResponse<T>, CallError>>,
    {
        let trace_id = next_trace_id();
        let before = self.ledger.try_load()?;
        let remaining = before.remaining(self.ledger.default_budget());
        let selection = self.selector.select(estimated_tokens, remaining);
        info!(
            trace_id = %trace_id,
            model = %selection.model,
            rule = %selection.rule,
            estimated_tokens,
            estimated_cost = selection.estimated_cost,
            remaining,
            "Selected model"
        );

        if self.skip_when_exhausted && (remaining <= 0.0 || remaining.is_nan()) {
            warn!(
                trace_id = %trace_id,
                remaining,
                "Budget exhausted; skipping call"
            );
            return Ok(DispatchReport {
                trace_id,
                estimated_tokens,
                selection,
                outcome: Outcome::Degraded(Degraded::new(0, "budget exhausted")),
                tokens_used: 0,
                cost: 0.0,
                record: before,
            });
        }

        let outcome = self
            .invoker
            .invoke_with_deadline(&selection.model, deadline, call)
            .await?;

        match outcome {
            Outcome::Succeeded(response) => {
                let (record, cost) = match self
                    .ledger
                    .record_usage(response.tokens_used, &selection.model)
                {
                    Ok(charged) => charged,
                    Err(source) => {
                        error!(
                            trace_id = %trace_id,
                            model = %selection.model,
                            tokens_used = response.tokens_used,
                            "Call succeeded but usage was not recorded: {source}"
                        );
                        return Err(Error::Unrecorded {
                            model: selection.model,
                            tokens_used: response.tokens_used,
                            value: Box::new(response.value),
                            source: Box::new(source),
                        });
                    }
                };
                info!(
                    trace_id = %trace_id,
                    model = %selection.model,
                    tokens_used = response.tokens_used,
                    cost,
                    spent = record.spent,
                    "Dispatch complete"
                );
                Ok(DispatchReport {
                    trace_id,
                    estimated_tokens,
                    selection,
                    outcome: Outcome::Succeeded(response.value),
                    tokens_used: response.tokens_used,
                    cost,
                    record,
                })
            }
            Outcome::Degraded(degraded) => {
                warn!(
                    trace_id = %trace_id,
                    model = %selection.model,
                    "Dispatch degraded: {}",
                    degraded.reason
                );
                Ok(DispatchReport {
                    trace_id,
                    estimated_tokens,
                    selection,
                    outcome: Outcome::Degraded(degraded),
                    tokens_used: 0,
                    cost: 0.0,
                    record: self.ledger.load(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{RetryConfig, SelectionRule};
    use crate::budget::ModelCostTable;
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn dispatcher(dir: &Path, budget: f64) -> Dispatcher {
        dispatcher_at(&dir.join("budget.json"), budget)
    }

    fn dispatcher_at(ledger_path: &Path, budget: f64) -> Dispatcher {
        let costs = Arc::new(ModelCostTable::default());
        let ledger = BudgetLedger::new(ledger_path, budget, costs.clone());
        let selector = ModelSelector::new(costs, 0.5, 0.5).unwrap();
        let invoker = BackoffInvoker::new(RetryConfig {
            jitter: false,
            ..RetryConfig::default()
        })
        .unwrap();
        Dispatcher::new(Arc::new(ledger), selector, invoker)
    }

    #[tokio::test]
    async fn success_charges_reported_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let d = dispatcher(dir.path(), 5.0);

        let report = d
            .dispatch("Summarize the quarterly numbers.", |attempt| async move {
                Ok(CallResponse::new(format!("answer from {}", attempt.model), 1000))
            })
            .await
            .unwrap();

        assert_eq!(report.selection.model, "gpt-4o-mini");
        assert_eq!(
            report.outcome.value().map(String::as_str),
            Some("answer from gpt-4o-mini")
        );
        assert!((report.cost - 0.15).abs() < 1e-9);
        assert_eq!(report.record.calls, 1);
        assert!((d.ledger().remaining(5.0) - 4.85).abs() < 1e-9);
        assert!(report.summary().contains("status: ok"));
    }

    #[tokio::test(start_paused = true)]
    async fn degraded_dispatch_charges_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let d = dispatcher(dir.path(), 5.0);

        let report = d
            .dispatch("hello", |_| async {
                Err::<CallResponse<()>, _>(CallError::RateLimited("HTTP 429".into()))
            })
            .await
            .unwrap();

        assert!(report.is_degraded());
        assert_eq!(report.cost, 0.0);
        assert_eq!(report.record.calls, 0);
        assert!(!d.ledger().path().exists());
    }

    #[tokio::test]
    async fn hard_failure_propagates_and_charges_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let d = dispatcher(dir.path(), 5.0);

        let err = d
            .dispatch("hello", |_| async {
                Err::<CallResponse<()>, _>(CallError::Failed("HTTP 400: bad request".into()))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Call(_)));
        assert_eq!(d.ledger().load().calls, 0);
    }

    #[tokio::test]
    async fn low_budget_forces_cheapest_model() {
        let dir = tempfile::tempdir().unwrap();
        let d = dispatcher(dir.path(), 0.30);

        let report = d
            .dispatch_with(50_000, None, |_| async { Ok(CallResponse::new((), 10)) })
            .await
            .unwrap();

        assert_eq!(report.selection.model, "gpt-4o-mini");
        assert_eq!(report.selection.rule, SelectionRule::LowBudget);
    }

    #[tokio::test]
    async fn exhausted_budget_skips_call_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let d = dispatcher(dir.path(), 0.10).with_skip_when_exhausted(true);
        d.ledger().record_usage(1000, "gpt-4o-mini").unwrap();

        let calls = AtomicU32::new(0);
        let report = d
            .dispatch("hello", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(CallResponse::new((), 10)) }
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        match &report.outcome {
            Outcome::Degraded(degraded) => {
                assert_eq!(degraded.attempts, 0);
                assert_eq!(degraded.reason, "budget exhausted");
            }
            Outcome::Succeeded(_) => panic!("expected a skipped call"),
        }
        assert_eq!(report.record.calls, 1);
    }

    #[tokio::test]
    async fn exhausted_budget_still_calls_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let d = dispatcher(dir.path(), 0.10);
        d.ledger().record_usage(1000, "gpt-4o-mini").unwrap();

        let report = d
            .dispatch("hello", |_| async { Ok(CallResponse::new((), 1000)) })
            .await
            .unwrap();

        assert!(!report.is_degraded());
        assert_eq!(report.record.calls, 2);
        assert!(d.ledger().remaining(0.10) < 0.0);
    }

    #[test]
    fn trace_ids_are_unique_per_dispatch() {
        let a = next_trace_id();
        let b = next_trace_id();
        assert_ne!(a, b);
        assert!(a.starts_with("dx-"));
        assert!(a.contains(&format!("-{:x}-", std::process::id())));
    }

    #[tokio::test]
    async fn unreadable_ledger_stops_dispatch_before_calling() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "a file, not a directory").unwrap();
        let d = dispatcher_at(&blocker.join("budget.json"), 5.0);

        let calls = AtomicU32::new(0);
        let err = d
            .dispatch("hello", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(CallResponse::new((), 1000)) }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Persistence { .. }), "got: {err:?}");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn corrupt_ledger_stops_dispatch_before_calling() {
        let dir = tempfile::tempdir().unwrap();
        let d = dispatcher(dir.path(), 5.0);
        std::fs::write(d.ledger().path(), r#"{"spent": 4.70, "calls": 31,"#).unwrap();

        let calls = AtomicU32::new(0);
        let err = d
            .dispatch("hello", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(CallResponse::new((), 1000)) }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Corrupt { .. }), "got: {err:?}");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_charge_hands_back_call_value() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("state");
        let d = dispatcher_at(&state.join("budget.json"), 5.0);

        // The store's directory becomes unwritable while the call is in flight.
        let err = d
            .dispatch("hello", |_| {
                std::fs::write(&state, "a file, not a directory").unwrap();
                async { Ok(CallResponse::new(String::from("paid-for answer"), 1000)) }
            })
            .await
            .unwrap_err();

        match &err {
            Error::Unrecorded {
                model,
                tokens_used,
                source,
                ..
            } => {
                assert_eq!(model, "gpt-4o-mini");
                assert_eq!(*tokens_used, 1000);
                assert!(matches!(**source, Error::Persistence { .. }));
            }
            other => panic!("expected Unrecorded, got {other:?}"),
        }
        assert_eq!(
            err.into_unrecorded_value::<String>().as_deref(),
            Some("paid-for answer")
        );
    }
}
