//! Backoff-aware invocation of a single outbound call.
//!
//! Per invocation the invoker moves through:
//!
//! ```text
//!            Ok                         rate limited, attempts left
//! Succeeded <── Attempting ───────────────────────────────> Backoff
//!                  │  ▲                                        │
//!                  │  └────────── sleep(delay), attempt += 1 ──┘
//!                  │
//!                  ├─ rate limited, last attempt or deadline ─> Degraded
//!                  └─ any other error ─────────────────────────> Err(Error::Call)
//! ```
//!
//! `Degraded` is not an error. It is returned as [`Outcome::Degraded`], which
//! serializes with `"mock": true` so consumers can tell that no real answer
//! was obtained.

use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::api::retry::{CallError, RetryConfig};
use crate::error::{Error, Result};

/// Per-attempt context handed to the wrapped call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallAttempt {
    /// Model the call should run against.
    pub model: String,
    /// 0-indexed attempt number.
    pub attempt: u32,
    /// Backoff slept before this attempt, if any.
    pub delay: Option<Duration>,
}

/// Sentinel returned when no genuine result was obtained.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Degraded {
    /// Always `true`.
    pub mock: bool,
    /// Attempts made before giving up (0 when the call was skipped).
    pub attempts: u32,
    pub reason: String,
}

impl Degraded {
    pub fn new(attempts: u32, reason: impl Into<String>) -> Self {
        Self {
            mock: true,
            attempts,
            reason: reason.into(),
        }
    }
}

/// Terminal result of an invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Outcome<T> {
    Succeeded(T),
    Degraded(Degraded),
}

impl<T> Outcome<T> {
    pub fn is_degraded(&self) -> bool {
        matches!(self, Outcome::Degraded(_))
    }

    /// The genuine result, if there is one.
    pub fn value(&self) -> Option<&T> {
        match self {
            Outcome::Succeeded(v) => Some(v),
            Outcome::Degraded(_) => None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            Outcome::Succeeded(v) => Some(v),
            Outcome::Degraded(_) => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Succeeded(v) => Outcome::Succeeded(f(v)),
            Outcome::Degraded(d) => Outcome::Degraded(d),
        }
    }
}

/// Runs a call with bounded retries on rate limiting.
#[derive(Debug, Clone)]
pub struct BackoffInvoker {
    config: RetryConfig,
}

impl BackoffInvoker {
    pub fn new(config: RetryConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Invoke `call` against `model`, retrying rate-limit failures.
    pub async fn invoke<T, F, Fut>(&self, model: &str, call: F) -> Result<Outcome<T>>
    where
        F: FnMut(CallAttempt) -> Fut,
        Fut: Future<Output = std::result::Result<T, CallError>>,
    {
        self.invoke_with_deadline(model, None, call).await
    }

    /// Like [`invoke`](Self::invoke), but degrades early instead of sleeping
    /// past `deadline`.
    pub async fn invoke_with_deadline<T, F, Fut>(
        &self,
        model: &str,
        deadline: Option<Instant>,
        mut call: F,
    ) -> Result<Outcome<T>>
    where
        F: FnMut(CallAttempt) -> Fut,
        Fut: Future<Output = std::result::Result<T, CallError>>,
    {
        let max_attempts = self.config.max_retries;
        let mut current = CallAttempt {
            model: model.to_string(),
            attempt: 0,
            delay: None,
        };

        loop {
            debug!(model, attempt = current.attempt + 1, max_attempts, "Attempting call");
            let message = match call(current.clone()).await {
                Ok(value) => {
                    if current.attempt > 0 {
                        info!(
                            model,
                            attempts = current.attempt + 1,
                            "Call succeeded after backoff"
                        );
                    }
                    return Ok(Outcome::Succeeded(value));
                }
                Err(CallError::Failed(message)) => {
                    warn!(model, attempt = current.attempt + 1, "Call failed: {message}");
                    return Err(Error::Call(message));
                }
                Err(CallError::RateLimited(message)) => message,
            };

            let attempts = current.attempt + 1;
            if attempts >= max_attempts {
                error!(
                    model,
                    attempts, "Rate limited on final attempt; returning degraded result: {message}"
                );
                return Ok(Outcome::Degraded(Degraded::new(
                    attempts,
                    format!("rate limited after {attempts} attempt(s): {message}"),
                )));
            }

            let delay = self.config.delay_for_attempt(current.attempt);
            if let Some(deadline) = deadline
                && Instant::now().checked_add(delay).is_none_or(|wake| wake > deadline)
            {
                error!(
                    model,
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Backoff would pass the deadline; returning degraded result"
                );
                return Ok(Outcome::Degraded(Degraded::new(
                    attempts,
                    format!("deadline reached after {attempts} attempt(s): {message}"),
                )));
            }

            warn!(
                model,
                attempt = attempts,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                "Rate limited: {message}. Retrying in {delay:?}..."
            );
            tokio::time::sleep(delay).await;
            current.attempt += 1;
            current.delay = Some(delay);
        }
    }
}
