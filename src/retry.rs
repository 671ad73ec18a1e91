//! Retry Logic
//!
//! Bounded retries with exponential or fixed back-off for transient failures.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use comic_orchestrator::retry::RetryPolicy;
//!
//! // 3 retries after the first attempt: delays of 1s, 2s, 4s
//! let policy = RetryPolicy::exponential(3, Duration::from_secs(1));
//!
//! let outcome = policy
//!     .run(|attempt| generator.generate(&prompt), |e| e.is_retryable())
//!     .await;
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

/// Retry policy configuration
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// Delay schedule between attempts.
    pub strategy: RetryStrategy,
}

/// Retry backoff strategy
#[derive(Clone, Debug)]
pub enum RetryStrategy {
    /// Fixed delay between retries
    Fixed(Duration),
    /// Exponential backoff: `base * 2^(attempt - 1)`, capped at `max_delay`
    Exponential {
        /// Delay after the first failed attempt.
        base_delay: Duration,
        /// Upper bound for any single delay.
        max_delay: Duration,
    },
}

/// Result of running an operation under a [`RetryPolicy`].
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    /// Final value or the last error seen.
    pub result: Result<T, E>,
    /// Attempts made, including the first.
    pub attempts: u32,
    /// Wall-clock time across all attempts and delays.
    pub elapsed: Duration,
}

impl RetryPolicy {
    /// Create policy with fixed delay
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            strategy: RetryStrategy::Fixed(delay),
        }
    }

    /// Create policy with exponential backoff
    pub fn exponential(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            strategy: RetryStrategy::Exponential {
                base_delay,
                max_delay: Duration::from_secs(60),
            },
        }
    }

    /// Total attempts this policy allows.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Run `op` until it succeeds, `should_retry` rejects the error, or the
    /// retry budget is spent.
    ///
    /// `op` receives the 1-based attempt number. Every failed attempt is
    /// logged with its attempt number and the delay before the next one.
    pub async fn run<F, Fut, T, E, P>(&self, mut op: F, mut should_retry: P) -> RetryOutcome<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnMut(&E) -> bool,
        E: std::fmt::Display,
    {
        let started = Instant::now();
        let max_attempts = self.max_attempts();
        let mut attempt = 0;

        loop {
            attempt += 1;

            debug!(attempt = attempt, max_attempts = max_attempts, "retry: attempting operation");

            match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt = attempt, "retry: operation succeeded after retries");
                    }
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt,
                        elapsed: started.elapsed(),
                    };
                }
                Err(e) => {
                    if !should_retry(&e) {
                        warn!(attempt = attempt, error = %e, "retry: error is not retryable");
                        return RetryOutcome {
                            result: Err(e),
                            attempts: attempt,
                            elapsed: started.elapsed(),
                        };
                    }

                    if attempt >= max_attempts {
                        warn!(attempts = attempt, error = %e, "retry: all attempts exhausted");
                        return RetryOutcome {
                            result: Err(e),
                            attempts: attempt,
                            elapsed: started.elapsed(),
                        };
                    }

                    let delay = self.delay_for(attempt);
                    warn!(
                        attempt = attempt,
                        max_attempts = max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retry: attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match &self.strategy {
            RetryStrategy::Fixed(delay) => *delay,
            RetryStrategy::Exponential {
                base_delay,
                max_delay,
            } => {
                let exponent = attempt.saturating_sub(1).min(31);
                base_delay
                    .checked_mul(1u32 << exponent)
                    .unwrap_or(*max_delay)
                    .min(*max_delay)
            }
        }
    }
}
