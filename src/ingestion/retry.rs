use std::{future::Future, time::Duration};

use async_trait::async_trait;
use tracing::{error, warn};

use super::provider::ProviderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    RateLimited,
    TransientTimeout,
    Fatal,
}

impl ErrorClass {
    pub fn of(err: &ProviderError) -> Self {
        match err {
            ProviderError::RateLimited(_) => ErrorClass::RateLimited,
            ProviderError::Timeout(_) => ErrorClass::TransientTimeout,
            ProviderError::Fatal(_) => ErrorClass::Fatal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { wait: Duration },
    GiveUp,
}

/// Exponential backoff for rate limits and timeouts. Attempt `n` (zero based) waits `base * 2^n`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 15,
            base_backoff: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_backoff
            .saturating_mul(2u32.saturating_pow(attempt))
    }

    pub fn decide(&self, class: ErrorClass, attempt: u32) -> RetryDecision {
        match class {
            ErrorClass::Fatal => RetryDecision::GiveUp,
            _ if attempt >= self.max_retries => RetryDecision::GiveUp,
            ErrorClass::RateLimited | ErrorClass::TransientTimeout => RetryDecision::Retry {
                wait: self.backoff(attempt),
            },
        }
    }
}

/// Waits between attempts. Swapped for a recording implementation in tests.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await
    }
}

/// Runs `operation` until it succeeds, fails fatally or runs out of retries.
pub async fn execute_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    operation: F,
) -> Result<T, ProviderError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 0;

    loop {
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let class = ErrorClass::of(&err);
        match policy.decide(class, attempt) {
            RetryDecision::Retry { wait } => {
                warn!(
                    ?class,
                    attempt,
                    wait_ms = wait.as_millis() as u64,
                    %err,
                    "remote call failed, retrying"
                );
                sleeper.sleep(wait).await;
                attempt += 1;
            }
            RetryDecision::GiveUp => {
                if class == ErrorClass::Fatal {
                    error!(%err, "remote call failed with a non-retryable error");
                } else {
                    error!(attempt, %err, "remote call failed, retries exhausted");
                }
                return Err(err);
            }
        }
    }
}
