//! Retry policy with exponential backoff and jitter for transient stage
//! failures.
//!
//! Backoff before attempt `n + 1`, after attempt `n` failed:
//! `min(initial * multiplier^(n-1) * (1 + jitter), max)` with
//! `jitter` drawn from `[0, jitter_ratio)`. Configuration validation
//! enforces `multiplier > 1 + jitter_ratio`, so the worst-case delay for
//! attempt `n` is still below the best-case delay for attempt `n + 1`.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::errors::{AgentError, AgentResult};
use crate::domain::models::{RetryConfig, StageId};

/// Per-stage retry bookkeeping. Created per stage invocation and discarded
/// when the conductor moves to another phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    pub stage: StageId,
    pub attempts: u32,
    pub max_attempts: u32,
}

impl RetryState {
    pub fn new(stage: StageId, max_attempts: u32) -> Self {
        Self {
            stage,
            attempts: 0,
            max_attempts,
        }
    }

    /// Count the attempt about to start and return its 1-based number.
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

/// Retry policy for transient errors
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Same backoff schedule with a different attempt bound.
    pub fn with_max_attempts(&self, max_attempts: u32) -> Self {
        let mut config = self.config.clone();
        config.max_attempts = max_attempts.max(1);
        Self { config }
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    pub fn state(&self, stage: StageId) -> RetryState {
        RetryState::new(stage, self.config.max_attempts)
    }

    /// Delay after the given failed attempt (1-based) for a fixed jitter
    /// fraction.
    pub fn calculate_backoff(&self, attempt: u32, jitter: f64) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let base = self.config.initial_backoff_ms as f64 * self.config.multiplier.powi(exponent);
        let jittered = base * (1.0 + jitter.clamp(0.0, self.config.jitter_ratio.max(0.0)));
        let capped = jittered.min(self.config.max_backoff_ms as f64);
        Duration::from_millis(capped.round() as u64)
    }

    /// Delay after the given failed attempt with a random jitter fraction.
    pub fn next_backoff(&self, attempt: u32) -> Duration {
        let jitter = if self.config.jitter_ratio > 0.0 {
            rand::thread_rng().gen_range(0.0..self.config.jitter_ratio)
        } else {
            0.0
        };
        self.calculate_backoff(attempt, jitter)
    }

    /// Run `operation` until it succeeds, fails non-transiently, or the
    /// attempt bound is reached. The last error is returned unchanged; callers
    /// decide whether exhaustion escalates.
    pub async fn execute<F, Fut, T>(
        &self,
        stage: StageId,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> AgentResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = AgentResult<T>>,
    {
        let mut state = self.state(stage);

        loop {
            let attempt = state.begin_attempt();
            let result = tokio::select! {
                () = cancel.cancelled() => return Err(AgentError::cancelled(stage)),
                result = operation(attempt) => result,
            };

            match result {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(stage = %stage, attempt, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if err.is_transient() && state.can_retry() => {
                    let backoff = self.next_backoff(attempt);
                    warn!(
                        stage = %stage,
                        attempt,
                        max_attempts = state.max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "transient failure, retrying"
                    );
                    if sleep_or_cancel(backoff, cancel).await {
                        return Err(AgentError::cancelled(stage));
                    }
                }
                Err(err) => {
                    if err.is_transient() {
                        debug!(stage = %stage, attempts = state.attempts, "retry budget spent");
                    }
                    return Err(err);
                }
            }
        }
    }
}

/// Escalate a transient error whose retry budget is spent.
pub fn exhausted(err: AgentError, attempts: u32) -> AgentError {
    err.escalate(format!("retries exhausted after {attempts} attempts"))
}

/// Sleep for `delay` unless cancelled first. Returns true on cancellation.
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        () = cancel.cancelled() => true,
        () = tokio::time::sleep(delay) => false,
    }
}
