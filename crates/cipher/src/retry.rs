//! Reconnect policy with exponential backoff for store connections.
//!
//! Used when opening pool connections and when a queue consumer loses its
//! connection mid-wait.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::TransportError;

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first try (default: 3).
    pub max_retries: u32,
    /// Initial backoff in milliseconds (default: 100).
    pub initial_backoff_ms: u64,
    /// Maximum backoff in milliseconds (default: 10 000).
    pub max_backoff_ms: u64,
    /// Multiplier for exponential backoff (default: 2.0).
    pub backoff_multiplier: f64,
    /// Whether to add random jitter to backoff (default: true).
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 10_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Outcome of a retried operation.
#[derive(Debug)]
pub enum RetryOutcome<T> {
    /// Operation succeeded.
    Success(T),
    /// All attempts failed, or a permanent error stopped the retries.
    Exhausted {
        /// The last error that occurred.
        last_error: TransportError,
        /// Total number of attempts made.
        attempts: u32,
    },
}

impl<T> RetryOutcome<T> {
    pub fn into_result(self) -> Result<T, TransportError> {
        match self {
            RetryOutcome::Success(v) => Ok(v),
            RetryOutcome::Exhausted { last_error, .. } => Err(last_error),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Runs `operation`, retrying transient failures with backoff.
    ///
    /// `on_failure` sees every failed attempt (1-based attempt number), which
    /// is where callers log and report.
    pub async fn execute<F, Fut, T, E>(&self, mut operation: F, mut on_failure: E) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
        E: FnMut(&TransportError, u32),
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => return RetryOutcome::Success(value),
                Err(e) => {
                    on_failure(&e, attempt);
                    if !is_retryable(&e) || attempt > self.config.max_retries {
                        return RetryOutcome::Exhausted {
                            last_error: e,
                            attempts: attempt,
                        };
                    }
                    tokio::time::sleep(self.backoff(attempt - 1)).await;
                }
            }
        }
    }

    /// Backoff before retry number `attempt` (0-based).
    ///
    /// `initial * multiplier^attempt`, capped at the maximum, plus up to 50%
    /// jitter when enabled.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.initial_backoff_ms as f64;
        let computed = base * self.config.backoff_multiplier.powi(attempt.min(64) as i32);
        let capped = computed.min(self.config.max_backoff_ms as f64) as u64;

        if self.config.jitter && capped > 1 {
            let jitter = rand::thread_rng().gen_range(0..capped / 2 + 1);
            Duration::from_millis(capped.saturating_add(jitter))
        } else {
            Duration::from_millis(capped)
        }
    }
}

/// Transient failures worth retrying. Authentication failures and an empty
/// pool will not fix themselves.
pub fn is_retryable(error: &TransportError) -> bool {
    match error {
        TransportError::ConnectFailed { .. } => true,
        TransportError::ConnectionClosed => true,
        TransportError::OperationFailed { .. } => true,
        TransportError::AuthFailed { .. } => false,
        TransportError::EmptyPool => false,
    }
}
