use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use log::{debug, warn};

/// What an error says about trying the same operation again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryHint {
    /// Retry after the policy's own delay.
    Retry,
    /// Retry after a delay the upstream asked for.
    RetryAfter(Duration),
    /// Give up now; another attempt cannot succeed.
    Stop,
}

pub trait Retryable {
    fn retry_hint(&self) -> RetryHint;
}

/// Bounded retry loop: one initial attempt plus up to `max_retries` more.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, delay: Duration) -> Self {
        Self { max_retries, delay }
    }

    pub async fn attempt<T, E, F, Fut>(&self, label: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let wait = match err.retry_hint() {
                RetryHint::Stop => return Err(err),
                _ if attempt > self.max_retries => {
                    warn!("{label}: giving up after {attempt} attempts: {err}");
                    return Err(err);
                }
                RetryHint::Retry => self.delay,
                RetryHint::RetryAfter(wait) => wait,
            };

            debug!(
                "{label}: attempt {attempt} failed ({err}), retrying in {}ms",
                wait.as_millis()
            );
            tokio::time::sleep(wait).await;
        }
    }
}
