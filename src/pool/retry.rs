//! Retry policy for API clients.
//!
//! Both modes retry transient errors (see [`MuninnError::is_transient`])
//! with exponential backoff. Adaptive mode additionally honours
//! `Retry-After` hints from rate-limited responses.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::telemetry;
use crate::{MuninnError, Result};

/// How an API client reacts to transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryMode {
    /// Exponential backoff only.
    Standard,
    /// Exponential backoff, deferring to server `Retry-After` hints.
    #[default]
    Adaptive,
}

impl fmt::Display for RetryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryMode::Standard => f.write_str("standard"),
            RetryMode::Adaptive => f.write_str("adaptive"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseRetryModeError(String);

impl fmt::Display for ParseRetryModeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown retry mode '{}', expected 'standard' or 'adaptive'", self.0)
    }
}

impl std::error::Error for ParseRetryModeError {}

impl FromStr for RetryMode {
    type Err = ParseRetryModeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "standard" => Ok(RetryMode::Standard),
            "adaptive" => Ok(RetryMode::Adaptive),
            _ => Err(ParseRetryModeError(s.to_string())),
        }
    }
}

/// Attempt budget and backoff for one API client.
///
/// ```rust
/// # use muninn::pool::{RetryMode, RetryPolicy};
/// # use std::time::Duration;
/// let policy = RetryPolicy::new(3, RetryMode::Standard)
///     .initial_delay(Duration::from_millis(100));
/// assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts including the first. 1 = no retry.
    pub max_attempts: u32,
    pub mode: RetryMode,
    /// Base delay before the first retry. Default: 500ms.
    pub initial_delay: Duration,
    /// Cap on exponential growth. Default: 20s.
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, mode: RetryMode) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            mode,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(20),
        }
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// `initial_delay * 2^attempt`, capped at `max_delay`. `attempt` is 0-indexed.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.initial_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay)
    }

    /// Backoff for `attempt`, replaced by the server hint in adaptive mode.
    pub fn effective_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        match (self.mode, retry_after) {
            (RetryMode::Adaptive, Some(hint)) => hint.min(self.max_delay),
            _ => self.delay_for_attempt(attempt),
        }
    }
}

/// Run `f` until it succeeds, fails permanently, or the budget is spent.
pub(crate) async fn with_retry<F, Fut, T>(policy: &RetryPolicy, client: &'static str, f: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_err = None;
    for attempt in 0..policy.max_attempts {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_transient() => {
                if attempt + 1 < policy.max_attempts {
                    metrics::counter!(telemetry::API_RETRIES_TOTAL, "client" => client).increment(1);
                    let delay = policy.effective_delay(attempt, e.retry_after());
                    warn!(
                        client,
                        attempt = attempt + 1,
                        max_attempts = policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying after transient error"
                    );
                    tokio::time::sleep(delay).await;
                }
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or(MuninnError::ClientUnavailable(client)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32, mode: RetryMode) -> RetryPolicy {
        RetryPolicy::new(max_attempts, mode).initial_delay(Duration::from_millis(1))
    }

    #[test]
    fn delay_grows_and_caps() {
        let policy = RetryPolicy::new(5, RetryMode::Standard)
            .initial_delay(Duration::from_secs(1))
            .max_delay(Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(5));
    }

    #[test]
    fn only_adaptive_honours_retry_after() {
        let hint = Some(Duration::from_secs(3));
        let standard = RetryPolicy::new(3, RetryMode::Standard);
        let adaptive = RetryPolicy::new(3, RetryMode::Adaptive);
        assert_eq!(standard.effective_delay(0, hint), Duration::from_millis(500));
        assert_eq!(adaptive.effective_delay(0, hint), Duration::from_secs(3));
        assert_eq!(adaptive.effective_delay(0, None), Duration::from_millis(500));
    }

    #[test]
    fn zero_attempts_means_one() {
        assert_eq!(RetryPolicy::new(0, RetryMode::Standard).max_attempts, 1);
    }

    #[test]
    fn retry_mode_parses() {
        assert_eq!("Standard".parse::<RetryMode>().unwrap(), RetryMode::Standard);
        assert_eq!(" adaptive ".parse::<RetryMode>().unwrap(), RetryMode::Adaptive);
        let err = "legacy".parse::<RetryMode>().unwrap_err();
        assert!(err.to_string().contains("legacy"));
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&fast(3, RetryMode::Standard), "generation", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(MuninnError::Http("connection reset".into()))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(&fast(5, RetryMode::Adaptive), "retrieval", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(MuninnError::Api {
                status: 400,
                message: "bad request".into(),
            })
        })
        .await;
        assert!(matches!(result, Err(MuninnError::Api { status: 400, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn budget_exhaustion_returns_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(&fast(2, RetryMode::Standard), "generation", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(MuninnError::Api {
                status: 503,
                message: "unavailable".into(),
            })
        })
        .await;
        assert!(matches!(result, Err(MuninnError::Api { status: 503, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
