//! Retry policy for transient failures.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::config::RetryConfig;
use crate::error::{ErrorKind, MigrateError, Result};

/// Which error kinds are retried. Everything else surfaces immediately.
const RETRYABLE: [(ErrorKind, bool); 3] = [
    (ErrorKind::Transient, true),
    (ErrorKind::Validation, false),
    (ErrorKind::Fatal, false),
];

/// Bounded exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    pub fn is_retryable(kind: ErrorKind) -> bool {
        RETRYABLE
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, retry)| *retry)
            .unwrap_or(false)
    }

    /// Delay before retry number `retry` (1-based): base * 2^(retry-1), capped.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32
            .checked_shl(retry.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt limit is reached.
    ///
    /// Returns the outcome and the number of attempts made. Exhausted
    /// transient failures come back as [`MigrateError::RetriesExhausted`].
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> (Result<T>, u32)
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op(attempt).await {
                Ok(value) => return (Ok(value), attempt),
                Err(e) if Self::is_retryable(e.kind()) => {
                    if attempt >= self.max_attempts {
                        return (
                            Err(MigrateError::RetriesExhausted {
                                operation: operation.to_string(),
                                attempts: attempt,
                                message: e.to_string(),
                            }),
                            attempt,
                        );
                    }
                    let delay = self.delay_for(attempt);
                    warn!(
                        "{} failed ({}), retry {}/{} in {:?}",
                        operation,
                        e,
                        attempt,
                        self.max_attempts - 1,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return (Err(e), attempt),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}
