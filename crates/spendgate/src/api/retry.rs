//! Backoff policy and rate-limit classification.
//!
//! Only rate-limit failures are retried. The delay before retry `n`
//! (0-indexed) is `base_delay * multiplier^n`, optionally capped, plus a
//! uniform jitter in `[0, 1)` seconds. The defaults give `2^n + jitter`
//! seconds over five attempts.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default number of attempts, including the first.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts before degrading (the first call counts). Must be >= 1.
    pub max_retries: u32,
    /// Delay before the first retry, in seconds.
    pub base_delay_secs: f64,
    /// Backoff multiplier (2.0 for exponential backoff).
    pub multiplier: f64,
    /// Upper bound on the exponential part of the delay.
    pub max_delay_secs: Option<f64>,
    /// Add uniform `[0, 1)` second jitter to every delay.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay_secs: 1.0,
            multiplier: 2.0,
            max_delay_secs: None,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Create a config with the given number of attempts. Uses default timing.
    pub fn with_retries(retries: u32) -> Self {
        Self {
            max_retries: retries,
            ..Default::default()
        }
    }

    /// Retry immediately, without sleeping. Used by load tests.
    pub fn no_delay(retries: u32) -> Self {
        Self {
            max_retries: retries,
            base_delay_secs: 0.0,
            jitter: false,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            return Err(Error::Config("retry.max_retries must be at least 1".into()));
        }
        if !self.base_delay_secs.is_finite() || self.base_delay_secs < 0.0 {
            return Err(Error::Config(format!(
                "retry.base_delay_secs must be >= 0, got {}",
                self.base_delay_secs
            )));
        }
        if !self.multiplier.is_finite() || self.multiplier <= 0.0 {
            return Err(Error::Config(format!(
                "retry.multiplier must be > 0, got {}",
                self.multiplier
            )));
        }
        if let Some(max) = self.max_delay_secs
            && (!max.is_finite() || max < 0.0)
        {
            return Err(Error::Config(format!(
                "retry.max_delay_secs must be >= 0, got {max}"
            )));
        }
        Ok(())
    }

    /// Exponential part of the delay for a given attempt number (0-indexed).
    pub fn base_delay_for_attempt(&self, attempt: u32) -> Duration {
        if self.base_delay_secs == 0.0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let mut secs = self.base_delay_secs * self.multiplier.powi(exponent);
        if let Some(max) = self.max_delay_secs {
            secs = secs.min(max);
        }
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }

    /// Calculate the delay for a given attempt number (0-indexed), jitter included.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay_for_attempt(attempt);
        if self.jitter {
            base.saturating_add(Duration::from_secs_f64(rand::random::<f64>()))
        } else {
            base
        }
    }
}

/// Failure reported by a wrapped call.
///
/// The invoker only needs to tell rate limiting apart from everything else.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    /// The remote side asked us to slow down. Retried with backoff.
    #[error("rate limited: {0}")]
    RateLimited(String),
    /// Any other failure. Propagated immediately.
    #[error("{0}")]
    Failed(String),
}

impl CallError {
    /// Sort a string error into [`RateLimited`](Self::RateLimited) or
    /// [`Failed`](Self::Failed) using [`is_rate_limit_error`].
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        if is_rate_limit_error(&message) {
            Self::RateLimited(message)
        } else {
            Self::Failed(message)
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited(_))
    }
}

/// Whether an error string indicates rate limiting.
pub fn is_rate_limit_error(error: &str) -> bool {
    if error.contains("HTTP 429") || error.contains("status 429") {
        return true;
    }

    let lower = error.to_lowercase();
    [
        "rate limit",
        "ratelimit",
        "rate_limit",
        "too many requests",
        "quota exceeded",
    ]
    .iter()
    .any(|p| lower.contains(p))
}
