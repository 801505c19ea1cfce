//! Retry Logic for Harness Failures
//!
//! A session that dies of a transport or protocol failure says nothing about
//! the paper it was fetching, so batch runs retry those with exponential
//! backoff and jitter. Tool failures are answers and are never retried.
//!
//! # Example
//!
//! ```ignore
//! use paperprobe::mcp::retry::{RetryConfig, retry_with_backoff};
//!
//! let config = RetryConfig::default()
//!     .max_attempts(3)
//!     .base_delay(Duration::from_millis(500));
//!
//! let outcome = retry_with_backoff(&config, RetryConfig::should_retry_error, || async {
//!     download_one(&paper).await
//! })
//! .await?;
//! ```

use crate::error::HarnessError;
use std::fmt::Display;
use std::time::Duration;
use tokio::time::sleep;

/// Retry configuration
///
/// # Fields
///
/// * `max_attempts` - Maximum number of attempts, including the first (default: 3)
/// * `base_delay` - Delay before the first retry (default: 500ms)
/// * `max_delay` - Cap on the delay between retries (default: 10s)
/// * `jitter` - Random delay variation factor (default: 0.1 = 10%)
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts (including initial attempt)
    pub max_attempts: usize,

    /// Base delay before first retry
    pub base_delay: Duration,

    /// Maximum delay between retries
    pub max_delay: Duration,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            jitter: 0.1,
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of attempts (at least one)
    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the jitter factor, clamped to 0.0..=1.0
    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Calculate delay for a given retry attempt
    ///
    /// Uses exponential backoff: delay = base_delay * 2^attempt, plus up to
    /// `jitter` of extra delay, capped at max_delay.
    pub fn calculate_delay(&self, attempt: usize) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.min(31) as u32);
        let exponential_delay = self.base_delay.saturating_mul(factor);

        let jitter_range = exponential_delay.mul_f64(self.jitter);
        let jitter_offset = rand::random::<f64>() * jitter_range.as_secs_f64();
        let jittered_delay =
            exponential_delay.saturating_add(Duration::from_secs_f64(jitter_offset));

        jittered_delay.min(self.max_delay)
    }

    /// Whether a harness failure is worth another fresh session
    ///
    /// Transport and protocol failures are retried; spawn failures, state
    /// machine misuse and JSON-RPC errors are not.
    pub fn should_retry_error(error: &HarnessError) -> bool {
        match error {
            HarnessError::BrokenPipe { .. }
            | HarnessError::ProtocolDecode { .. }
            | HarnessError::UnexpectedId { .. }
            | HarnessError::SessionTerminated { .. }
            | HarnessError::Io(_) => true,
            HarnessError::Spawn { .. }
            | HarnessError::SessionNotReady { .. }
            | HarnessError::RequestInFlight { .. }
            | HarnessError::NoPendingRequest
            | HarnessError::Rpc(_) => false,
        }
    }
}

/// Retry an operation with exponential backoff
///
/// The operation runs up to `max_attempts` times. Errors for which
/// `is_retryable` returns false fail immediately.
pub async fn retry_with_backoff<F, Fut, T, E, P>(
    config: &RetryConfig,
    is_retryable: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(
                        "Operation succeeded on attempt {} after {} retries",
                        attempt + 1,
                        attempt
                    );
                }
                return Ok(result);
            }
            Err(e) if attempt + 1 < max_attempts && is_retryable(&e) => {
                tracing::warn!("Attempt {} failed: {}, retrying after delay", attempt + 1, e);

                let delay = config.calculate_delay(attempt);
                tracing::debug!("Waiting {:?} before retry", delay);
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                tracing::error!("Operation failed after {} attempts: {}", attempt + 1, e);
                return Err(e);
            }
        }
    }
}
