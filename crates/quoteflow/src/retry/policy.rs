//! Bounded retry with a fixed exponential backoff schedule.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::{ErrorKind, QuoteError};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BACKOFF_SECS: [u64; 3] = [2, 4, 8];

/// One failed attempt, kept so the final error carries its history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AttemptRecord {
    pub attempt: u32,
    pub kind: ErrorKind,
    pub message: String,
    pub failed_at: DateTime<Utc>,
    /// Backoff applied before this attempt started.
    pub waited_ms: u64,
}

/// Result of running an operation under the policy.
#[derive(Debug)]
pub enum RetryOutcome<T> {
    Succeeded {
        value: T,
        history: Vec<AttemptRecord>,
    },
    Failed {
        error: QuoteError,
        history: Vec<AttemptRecord>,
    },
    Cancelled {
        history: Vec<AttemptRecord>,
    },
}

impl<T> RetryOutcome<T> {
    pub fn history(&self) -> &[AttemptRecord] {
        match self {
            RetryOutcome::Succeeded { history, .. }
            | RetryOutcome::Failed { history, .. }
            | RetryOutcome::Cancelled { history } => history,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            DEFAULT_MAX_ATTEMPTS,
            DEFAULT_BACKOFF_SECS
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
        )
    }
}

impl RetryPolicy {
    /// Creates a policy. At least one attempt is always made; an empty
    /// schedule retries immediately.
    pub fn new(max_attempts: u32, backoff: Vec<Duration>) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// How many retries a failure of `kind` may consume in total.
    pub fn max_retries_for(&self, kind: ErrorKind) -> u32 {
        if !kind.is_recoverable() {
            return 0;
        }
        let budget = self.max_attempts.saturating_sub(1);
        match kind {
            ErrorKind::FormChanged => budget.min(1),
            _ => budget,
        }
    }

    /// Wait before retry number `retry` (1-based). Past the end of the
    /// schedule the last entry repeats.
    pub fn delay_before_retry(&self, retry: u32) -> Duration {
        if self.backoff.is_empty() || retry == 0 {
            return Duration::ZERO;
        }
        let idx = ((retry - 1) as usize).min(self.backoff.len() - 1);
        self.backoff[idx]
    }

    /// Runs `op` until it succeeds, fails with a kind whose retry budget is
    /// spent, or `cancel` fires. `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, QuoteError>>,
    {
        let mut history = Vec::new();
        let mut attempt = 1;
        let mut waited = Duration::ZERO;

        loop {
            if cancel.is_cancelled() {
                return RetryOutcome::Cancelled { history };
            }

            let error = match op(attempt).await {
                Ok(value) => return RetryOutcome::Succeeded { value, history },
                Err(e) => e,
            };

            history.push(AttemptRecord {
                attempt,
                kind: error.kind,
                message: error.message.clone(),
                failed_at: Utc::now(),
                waited_ms: waited.as_millis() as u64,
            });

            let retries_used = attempt - 1;
            if retries_used >= self.max_retries_for(error.kind) {
                debug!(attempt, kind = %error.kind, "retry budget exhausted");
                return RetryOutcome::Failed { error, history };
            }

            waited = self.delay_before_retry(attempt);
            warn!(
                attempt,
                kind = %error.kind,
                delay_ms = waited.as_millis() as u64,
                "attempt failed, retrying: {}",
                error.message
            );

            tokio::select! {
                _ = cancel.cancelled() => return RetryOutcome::Cancelled { history },
                _ = tokio::time::sleep(waited) => {}
            }
            attempt += 1;
        }
    }

    /// Retries an infrastructure call (queue, store, session provider) on
    /// every error, using the same schedule and attempt ceiling.
    pub async fn run_infra<T, E, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, E>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.max_attempts => {
                    let delay = self.delay_before_retry(attempt);
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "infrastructure call failed, retrying: {}",
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
